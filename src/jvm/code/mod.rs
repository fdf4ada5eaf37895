//! Instruction level model of method bodies
//!
//! A `Code` attribute is decoded into an [`InstructionGraph`], analysed and rewritten in place,
//! and finally encoded back into bytes.

mod decoder;
mod encoder;
mod graph;
mod instruction;
pub mod opcodes;
mod subroutine;

pub use decoder::*;
pub use encoder::*;
pub use graph::*;
pub use instruction::*;
pub use subroutine::*;
