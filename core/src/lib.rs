//! runq-core - descriptor types, codec, error taxonomy and shared constants.
//!
//! This crate has no async runtime and no I/O beyond the pure encode/decode
//! functions in [`codec`]; it is shared verbatim between the host proxy and
//! the guest init so that both sides agree on the wire schema.

pub mod cfg;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod log;
pub mod msg;

pub use error::{Result, RunqError};

/// runq-core version, taken from the crate's own Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
