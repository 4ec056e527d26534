mod identity;
mod numeric;
mod reserved;

pub use identity::*;
pub use numeric::*;
pub use reserved::*;
