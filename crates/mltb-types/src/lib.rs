pub mod errors;
pub mod values;

pub use errors::*;
pub use values::*;
