//! Binary class file structures that method bodies are read from and written back to

mod attribute;
mod binary_format;
mod constants;

pub use attribute::*;
pub use binary_format::*;
pub use constants::*;
