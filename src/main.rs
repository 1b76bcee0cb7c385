use clap::Parser as ClapParser;
use garnet_vm::{Error, GcConfig, Vm, VmConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    let opt = Opt::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let bin = std::fs::read(&opt.file).expect("Failed to read file");

    if opt.disasm || opt.emit.is_some() {
        let irep = match garnet_bytecode::load(&bin) {
            Ok(irep) => irep,
            Err(e) => {
                eprintln!("{}: {}", opt.file, e);
                std::process::exit(1);
            }
        };
        if opt.disasm {
            print!("{}", irep);
        }
        if let Some(out) = &opt.emit {
            std::fs::write(out, garnet_bytecode::dump(&irep)).expect("Failed to write file");
        }
        return;
    }

    let mut config = VmConfig::default();
    if let Some(depth) = opt.max_depth {
        config = config.with_max_call_depth(depth);
    }
    if let Some(bytes) = opt.gc_threshold {
        config = config.with_gc(GcConfig::default().with_initial_threshold(bytes));
    }
    let mut vm = Vm::with_config(config);

    let result = vm.load(&bin);
    let status = match result {
        Ok(v) => {
            println!("{}", vm.inspect(v));
            0
        }
        Err(e) => {
            report(&vm, &e);
            1
        }
    };
    if opt.stats {
        let stats = vm.gc_stats();
        eprintln!(
            "gc: {} collections, {} live objects, {} freed, {} bytes allocated, next at {}",
            stats.collections,
            stats.live_objects,
            stats.freed_objects,
            stats.bytes_allocated,
            stats.threshold
        );
    }
    std::process::exit(status);
}

/// Print an uncaught error the way a Ruby interpreter does.
fn report(vm: &Vm, e: &Error) {
    eprintln!("{}", vm.describe_error(e));
    if let Error::Raise(exc) = e {
        for line in vm.exception_backtrace(*exc) {
            eprintln!("\tfrom {}", line);
        }
    }
}

#[derive(clap::Parser)]
#[clap(about, version, author)]
struct Opt {
    /// The compiled program, a RITE binary as produced by `mrbc`.
    file: String,

    /// Print the disassembly instead of running the program.
    #[clap(long)]
    disasm: bool,

    /// Write the validated program back out as a RITE binary without running it.
    #[clap(long, value_name = "OUT")]
    emit: Option<String>,

    /// Print collector statistics after the run.
    #[clap(long)]
    stats: bool,

    /// Frames a fiber may hold before `SystemStackError` is raised.
    #[clap(long)]
    max_depth: Option<usize>,

    /// Heap bytes allocated before the first collection.
    #[clap(long)]
    gc_threshold: Option<usize>,
}
