use garnet_bytecode::LoadError;
use thiserror::Error;

use crate::gc::ObjRef;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum Error {
    /// A runtime exception nobody rescued. Use [`Vm::describe_error`] for a
    /// readable message.
    ///
    /// [`Vm::describe_error`]: crate::Vm::describe_error
    #[error("uncaught exception {0:?}")]
    Raise(ObjRef),

    #[error("invalid bytecode: {0}")]
    Load(#[from] LoadError),

    /// The VM cannot continue, e.g. the heap is exhausted.
    #[error("fatal: {0}")]
    Fatal(String),

    /// A `break` or block `return` travelling to a frame below a native call.
    /// Public entry points never return it.
    #[error("non-local exit escaped its target frame")]
    Unwind(Unwind),
}

#[derive(Debug, Clone, Copy)]
pub struct Unwind {
    /// Index of the frame to pop in the current context
    pub(crate) target: usize,
    pub(crate) value: Value,
}

pub type VmResult<T> = Result<T, Error>;
