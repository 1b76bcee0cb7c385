//! A register-based virtual machine executing mruby 3 bytecode.
//!
//! [`Vm`] owns the heap, the class hierarchy and every fiber stack. Hosts
//! load RITE binaries with [`Vm::load`], call into Ruby with
//! [`Vm::funcall`] and register native methods with [`Vm::define_method`].

pub mod args;
pub mod class;
pub mod config;
mod core;
pub mod error;
pub mod fiber;
pub mod gc;
pub mod object;
pub mod symbol;
pub mod value;
pub mod vm;

pub use args::Args;
pub use class::{Method, NativeFn};
pub use config::{GcConfig, VmConfig};
pub use error::{Error, VmResult};
pub use fiber::{FiberState, ResumeWaiter, TerminationWaiter};
pub use gc::{GcStats, ObjRef, Persistent};
pub use symbol::Symbol;
pub use value::{Value, ValueType};
pub use vm::Vm;
