//! dunlin core - framing, dialect codecs, hashing and shared types
//!
//! This crate provides the connection and protocol building blocks for the
//! dunlin Direct Connect client: framed plain/TLS connections with
//! switchable zlib, the two wire dialect codecs, and Tiger-tree hashing.

pub mod adc;
pub mod conn;
pub mod error;
pub mod nmdc;
pub mod tiger;
pub mod tls;
pub mod types;

pub use conn::{ConnCounters, ConnReader, ConnWriter, FramedConn, NetStream};
pub use error::{DcError, Result};
pub use tiger::{TigerHash, TreeLeaves};
pub use types::*;

/// Default hub and peer port when a URL omits one.
pub const DEFAULT_HUB_PORT: u16 = 411;
