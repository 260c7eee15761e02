pub mod error;

pub use error::{BridgeError, ErrorKind, Result};
