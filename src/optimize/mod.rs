//! Rewriting method bodies using what the analyses found
//!
//! The [`Optimizer`] runs every stage over a batch of methods. The stages can also be used on
//! their own on an [`InstructionGraph`](crate::jvm::code::InstructionGraph):
//!
//!   - [`apply_constant_facts`] removes unreachable code, substitutes constants and
//!     straightens decided branches
//!   - [`remove_pops`] cancels values that are pushed only to be discarded
//!   - [`LocalOptimizer`] removes dead stores and packs locals into fewer slots

mod constant_folding;
mod local_optimizer;
mod pipeline;
mod remove_pop;
mod settings;
mod union_find;

pub use constant_folding::*;
pub use local_optimizer::*;
pub use pipeline::*;
pub use remove_pop::remove_pops;
pub use settings::*;
pub use union_find::*;
