use crate::gc::ObjRef;
use crate::symbol::Symbol;

/// A VM value. Immediates are stored inline; everything else is a handle into
/// the heap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Nil,
    False,
    True,
    Integer(i64),
    Float(f64),
    Symbol(Symbol),
    Object(ObjRef),
}

static_assertions::assert_eq_size!(Value, [u64; 2]);

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        if v {
            Value::True
        } else {
            Value::False
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Symbol> for Value {
    fn from(v: Symbol) -> Self {
        Value::Symbol(v)
    }
}

impl From<ObjRef> for Value {
    fn from(v: ObjRef) -> Self {
        Value::Object(v)
    }
}

impl Value {
    /// Only `nil` and `false` are falsy.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn is_falsy(self) -> bool {
        !self.is_truthy()
    }

    /// Returns `true` if the value is [`Nil`].
    ///
    /// [`Nil`]: Value::Nil
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(self) -> Option<i64> {
        if let Value::Integer(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// The value as a float, converting integers.
    pub fn as_float(self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_symbol(self) -> Option<Symbol> {
        if let Value::Symbol(v) = self {
            Some(v)
        } else {
            None
        }
    }

    pub fn as_object(self) -> Option<ObjRef> {
        if let Value::Object(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Whether the value lives inline rather than on the heap
    pub fn is_immediate(self) -> bool {
        !matches!(self, Value::Object(_))
    }
}

/// Coarse type of a value, as seen by hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Nil,
    False,
    True,
    Integer,
    Float,
    Symbol,
    Object,
    String,
    Array,
    Hash,
    Range,
    Class,
    Module,
    Proc,
    Fiber,
    Exception,
    Data,
}
