//! Rebuild, analyse, and rewrite JVM method bodies at the instruction level
//!
//! A method's `Code` attribute goes through a fixed sequence of stages, each of which consumes and
//! produces the same [`InstructionGraph`](jvm::code::InstructionGraph):
//!
//!  1. [decoding](jvm::code::decode_code) turns the byte stream into an arena of canonicalized
//!     instructions, exception handlers, and debug tables
//!  2. [constant analysis](analysis::ConstantAnalyzer) runs a worklist abstract interpretation
//!     to find unreachable code, constant results, and statically decided branches
//!  3. [constant folding](optimize::apply_constant_facts) and the
//!     [pop peephole](optimize::remove_pops) rewrite the graph using those facts
//!  4. [local optimization](optimize::LocalOptimizer) merges same-value locals, drops dead stores,
//!     and recolors slots so that no two simultaneously live values share one
//!  5. [encoding](jvm::code::encode_code) lays out the code again, picking branch widths until
//!     everything fits
//!
//! [`optimize::Optimizer`] strings the stages together for one or many methods.

pub mod analysis;
pub mod jvm;
pub mod optimize;
pub mod util;

pub use jvm::{Error, Result};
