pub mod config;
pub mod frame;
pub mod probe;
pub mod session;
pub mod transport;

pub use config::*;
pub use frame::*;
pub use probe::*;
pub use session::*;
pub use transport::*;
