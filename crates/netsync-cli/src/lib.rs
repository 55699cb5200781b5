//! netsync-cli library: exposes the CLI's building blocks for testing.
//!
//! This is a thin layer over netsync-core: file-backed replicas and a
//! session that drives a NetworkSyncher for one command.

pub mod file_store;
pub mod session;

pub use file_store::{FileProvider, FileStore};
pub use session::{Session, SessionOptions};
