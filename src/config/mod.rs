pub mod file;
pub mod paths;
pub mod types;

pub use file::TuningFile;
pub use types::{ConnectionKey, ConnectionParams, Credentials, HostKeyCheck, RetryPolicy, Verbosity};
