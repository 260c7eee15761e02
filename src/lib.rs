#![allow(clippy::new_without_default, clippy::len_without_is_empty)]

pub mod app;
pub mod common;
pub mod config;

pub use app::{Backends, Registry};
pub use common::{BridgeError, ErrorKind, Result};
pub use config::{ConfigBuilder, ProxyConfiguration, ServerDescriptor};
