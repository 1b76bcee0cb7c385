use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use test_env_log::test;

use crate::{Value, Vm};

/// Indices reachable from `roots` along `edges`.
fn reachable(n: usize, edges: &[(usize, usize)], roots: &[usize]) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut work = roots.to_vec();
    while let Some(i) = work.pop() {
        if !seen.insert(i) {
            continue;
        }
        work.extend(edges.iter().filter(|(from, _)| *from == i).map(|(_, to)| *to));
    }
    assert!(seen.iter().all(|&i| i < n));
    seen
}

#[test]
fn test_collect_keeps_exactly_the_reachable_graph() {
    let mut rng = fastrand::Rng::with_seed(0x9a7c);
    for _ in 0..32 {
        let mut vm = Vm::new();
        let mark = vm.arena_save();
        let n = rng.usize(2..48);
        let objs: Vec<Value> = (0..n).map(|_| vm.new_array(vec![])).collect();
        let edges: Vec<(usize, usize)> = (0..rng.usize(0..n * 2))
            .map(|_| (rng.usize(..n), rng.usize(..n)))
            .collect();
        for &(from, to) in &edges {
            vm.array_push(objs[from], objs[to]).unwrap();
        }
        let roots: Vec<usize> = (0..n).filter(|_| rng.u8(..4) == 0).collect();
        let pins: Vec<_> = roots.iter().map(|&i| vm.pin(objs[i])).collect();
        vm.arena_restore(mark);

        vm.gc_collect();
        let live = reachable(n, &edges, &roots);
        for (i, obj) in objs.iter().enumerate() {
            let r = obj.as_object().unwrap();
            assert_eq!(vm.heap.contains(r), live.contains(&i), "object {} of {}", i, n);
        }
        // survivors still hold their elements
        for &i in &live {
            let expected = edges.iter().filter(|(from, _)| *from == i).count();
            assert_eq!(vm.array_items(objs[i]).unwrap().len(), expected);
        }

        for p in pins {
            vm.unpin(p);
        }
        vm.gc_collect();
        assert!(objs.iter().all(|o| !vm.heap.contains(o.as_object().unwrap())));
    }
}

#[test]
fn test_arena_protects_temporaries() {
    let mut vm = Vm::new();
    let mark = vm.arena_save();
    let s = vm.new_string("kept");
    vm.gc_collect();
    assert_eq!(vm.string_lossy(s).as_deref(), Some("kept"));
    vm.arena_restore(mark);
    vm.gc_collect();
    assert!(!vm.heap.contains(s.as_object().unwrap()));
}

#[test]
fn test_globals_and_ivars_are_roots() {
    let mut vm = Vm::new();
    let mark = vm.arena_save();
    let holder = vm.new_object(vm.object_class());
    let inner = vm.new_string("inner");
    vm.set_ivar(holder, "@x", inner).unwrap();
    vm.set_global("$holder", holder);
    vm.arena_restore(mark);

    vm.gc_collect();
    assert_eq!(vm.get_ivar(holder, "@x"), inner);
    assert_eq!(vm.string_lossy(inner).as_deref(), Some("inner"));

    vm.set_global("$holder", Value::Nil);
    vm.gc_collect();
    assert!(!vm.heap.contains(inner.as_object().unwrap()));
}

#[test]
fn test_release_runs_exactly_once() {
    let released = Rc::new(Cell::new(0));
    let mut vm = Vm::new();
    let class = vm.object_class();

    let mark = vm.arena_save();
    let counter = released.clone();
    let data = vm.new_data(class, "Handle", 42u32, move |v| {
        assert_eq!(v, 42);
        counter.set(counter.get() + 1)
    });
    assert_eq!(vm.data_ref::<u32>(data), Some(&42));
    vm.arena_restore(mark);

    vm.gc_collect();
    assert_eq!(released.get(), 1);
    vm.gc_collect();
    assert_eq!(released.get(), 1);

    // still alive at teardown
    let counter = released.clone();
    let kept = vm.new_data(class, "Handle", 7u32, move |_| counter.set(counter.get() + 1));
    let _pin = vm.pin(kept);
    drop(vm);
    assert_eq!(released.get(), 2);
}

#[test]
fn test_stats_and_threshold() {
    let mut vm = Vm::new();
    let before = vm.gc_stats();
    vm.gc_collect();
    let after = vm.gc_stats();
    assert_eq!(after.collections, before.collections + 1);
    assert!(after.threshold >= vm.config().gc.initial_threshold);
    assert_eq!(after.live_objects, vm.heap.len());
}

#[test]
fn test_allocation_triggers_collection() {
    use garnet_bytecode::{IrepBuilder, OpCode};

    let config = crate::VmConfig::default()
        .with_gc(crate::GcConfig::default().with_initial_threshold(16 * 1024));
    let mut vm = Vm::with_config(config);
    // loop 2000 times allocating a fresh string each round
    let mut b = IrepBuilder::new(1, 4);
    b.load_int(1, 0);
    let top = b.mark();
    b.load_string(2, "garbage");
    b.op_ab(OpCode::AddI, 1, 1);
    b.op_ab(OpCode::Move, 2, 1);
    b.load_int(3, 2000);
    b.op_a(OpCode::Lt, 2);
    b.jump(OpCode::JmpIf, Some(2), top);
    b.op_a(OpCode::Return, 1);
    let r = vm.run(b.build()).unwrap();
    assert_eq!(r, Value::Integer(2000));
    let stats = vm.gc_stats();
    assert!(stats.collections > 0);
    assert!(stats.freed_objects > 0);
    assert!(stats.live_objects < 2000);
}
