pub mod connection;
pub mod pool;
pub mod reader;
pub mod registry;

pub use connection::Connection;
pub use pool::{Pooled, SessionPool};
pub use registry::Registry;
