//! The mruby 3 instruction set, the RITE container format and an assembler
//! for building code units by hand.

pub mod builder;
pub mod inst;
pub mod irep;
pub mod rite;

pub use builder::{IrepBuilder, Label};
pub use inst::{Inst, InstContainer, OpCode, OperandFormat, Operands};
pub use irep::{ArgSpec, CatchHandler, CatchKind, Irep, PoolValue};
pub use rite::{dump, load, LoadError};
