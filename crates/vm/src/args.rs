use crate::error::VmResult;
use crate::symbol::Symbol;
use crate::value::Value;
use crate::vm::Vm;

/// Arguments of a native method call.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub(crate) positional: Vec<Value>,
    /// Keyword arguments in call order
    pub(crate) keywords: Vec<(Value, Value)>,
    pub(crate) block: Value,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Args {
        Args {
            positional,
            keywords: vec![],
            block: Value::Nil,
        }
    }

    pub fn with_block(mut self, block: Value) -> Args {
        self.block = block;
        self
    }

    pub fn with_keyword(mut self, key: Symbol, value: Value) -> Args {
        self.keywords.push((Value::Symbol(key), value));
        self
    }

    /// Number of positional arguments
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    /// Positional argument `idx`, or nil when absent.
    pub fn get(&self, idx: usize) -> Value {
        self.positional.get(idx).copied().unwrap_or(Value::Nil)
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Positional arguments from `from` on
    pub fn rest(&self, from: usize) -> &[Value] {
        self.positional.get(from..).unwrap_or(&[])
    }

    pub fn keyword(&self, name: Symbol) -> Option<Value> {
        self.keywords
            .iter()
            .find(|(k, _)| *k == Value::Symbol(name))
            .map(|(_, v)| *v)
    }

    pub fn keywords(&self) -> &[(Value, Value)] {
        &self.keywords
    }

    pub fn block(&self) -> Option<Value> {
        if self.block.is_nil() {
            None
        } else {
            Some(self.block)
        }
    }
}

impl Vm {
    /// Raise `ArgumentError` unless `min <= args.len() <= max`.
    pub fn check_arity(&mut self, args: &Args, min: usize, max: usize) -> VmResult<()> {
        let n = args.len();
        if n >= min && n <= max {
            return Ok(());
        }
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("{}+", min)
        } else {
            format!("{}..{}", min, max)
        };
        let msg = format!("wrong number of arguments (given {}, expected {})", n, expected);
        Err(self.argument_error(msg))
    }

    /// Positional argument `idx` as an integer, raising `TypeError` otherwise.
    pub fn int_arg(&mut self, args: &Args, idx: usize) -> VmResult<i64> {
        match args.get(idx) {
            Value::Integer(i) => Ok(i),
            other => {
                let msg = format!(
                    "no implicit conversion of {} into Integer",
                    self.class_name(self.class_of(other))
                );
                Err(self.type_error(msg))
            }
        }
    }

    pub fn symbol_arg(&mut self, args: &Args, idx: usize) -> VmResult<Symbol> {
        match args.get(idx) {
            Value::Symbol(s) => Ok(s),
            v => match self.string_bytes(v).map(<[u8]>::to_vec) {
                Some(s) => Ok(self.intern_bytes(&s)),
                None => {
                    let msg = format!("{} is not a symbol nor a string", self.inspect(v));
                    Err(self.type_error(msg))
                }
            },
        }
    }
}
