mod key;
mod label;
mod set;
mod source;

pub use key::*;
pub use label::*;
pub use set::*;
pub use source::*;
