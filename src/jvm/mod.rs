//! Class file level model of method bodies
//!
//! The [`class_file`] module deals with the raw binary structures (constant pool, `Code`
//! attribute and its debug sub-attributes), [`code`] lifts a method body into an editable
//! instruction graph and lowers it back, and [`class_graph`] answers the few class hierarchy
//! questions needed to canonicalize member references.

pub mod class_file;
pub mod class_graph;
pub mod code;
mod descriptors;
mod errors;

pub use descriptors::*;
pub use errors::*;
