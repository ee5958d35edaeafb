pub mod codec;
pub mod v1;

pub use codec::*;
