//! dunlin client - a Direct Connect client engine
//!
//! Embedders build a [`ClientConfig`], register [`Callbacks`], and drive the
//! session with [`Client::run`]; everything else happens through the
//! cloneable [`Handle`].

pub mod client;
pub mod config;
pub mod download;
pub mod events;
mod hub;
mod peer;
pub mod share;
pub mod upload;

pub use client::{Client, Handle};
pub use config::{ClientConfig, HubUrl, LogLevel};
pub use download::{Download, DownloadConf, DownloadError};
pub use events::Callbacks;
pub use upload::{Upload, UploadRequest, UploadSubject};

pub use dunlin_core::error::{DcError, Result};
pub use dunlin_core::tiger::{TigerHash, TreeLeaves};
pub use dunlin_core::types::{EncryptionMode, Peer, SearchQuery, SearchResult};
