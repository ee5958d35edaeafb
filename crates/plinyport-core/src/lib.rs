pub mod backend;
pub mod endpoint;
pub mod error;
pub mod graph;
pub mod spec;
pub mod tensor;

pub use backend::*;
pub use endpoint::*;
pub use error::*;
pub use graph::*;
pub use spec::*;
pub use tensor::*;
