//! Download jobs and their registry
//!
//! The control task owns every download from the moment it is requested;
//! a peer connection only borrows a job while actively servicing it and
//! reports the outcome back.

use std::collections::HashMap;
use std::path::PathBuf;

use dunlin_core::error::{DcError, Result};
use dunlin_core::tiger::TigerHash;

/// Whole file, from the beginning.
pub const LENGTH_TO_END: i64 = -1;

/// What to download and where to put it.
#[derive(Debug, Clone)]
pub struct DownloadConf {
    /// Nickname of the peer holding the content.
    pub peer: String,
    /// Content hash of the wanted file.
    pub tth: TigerHash,
    /// First requested byte.
    pub start: u64,
    /// Requested byte count; [`LENGTH_TO_END`] means up to the end.
    pub length: i64,
    /// Write to this file instead of an in-memory buffer.
    pub save_path: Option<PathBuf>,
    /// Fetch the leaf digests first and verify arriving blocks.
    pub verify: bool,
}

impl DownloadConf {
    pub fn new(peer: impl Into<String>, tth: TigerHash) -> Self {
        DownloadConf {
            peer: peer.into(),
            tth,
            start: 0,
            length: LENGTH_TO_END,
            save_path: None,
            verify: true,
        }
    }

    pub fn save_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }
}

/// A finished download handed to the embedder.
#[derive(Debug)]
pub struct Download {
    pub conf: DownloadConf,
    /// Bytes actually received.
    pub size: u64,
    /// The payload, when no save path was configured.
    pub content: Option<Vec<u8>>,
}

/// A failed or cancelled download.
#[derive(Debug)]
pub struct DownloadError {
    pub conf: DownloadConf,
    pub error: DcError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DownloadStatus {
    Queued,
    /// A connection towards the peer is being established.
    Connecting,
    /// Actively serviced by the given connection.
    Transferring(u64),
}

pub(crate) struct DownloadEntry {
    pub conf: DownloadConf,
    pub status: DownloadStatus,
}

/// Job handed to a peer connection.
#[derive(Debug, Clone)]
pub(crate) struct DownloadJob {
    pub id: u64,
    pub conf: DownloadConf,
}

/// Registry of outstanding downloads, owned by the control task.
#[derive(Default)]
pub(crate) struct DownloadRegistry {
    next_id: u64,
    entries: HashMap<u64, DownloadEntry>,
}

impl DownloadRegistry {
    pub fn queue(&mut self, conf: DownloadConf) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            DownloadEntry {
                conf,
                status: DownloadStatus::Queued,
            },
        );
        id
    }

    pub fn mark_connecting(&mut self, id: u64) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.status = DownloadStatus::Connecting;
        }
    }

    /// Hand the oldest waiting job for `peer` to connection `conn_id`.
    pub fn assign_for_peer(&mut self, peer: &str, conn_id: u64) -> Option<DownloadJob> {
        let id = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.conf.peer == peer && !matches!(e.status, DownloadStatus::Transferring(_))
            })
            .map(|(id, _)| *id)
            .min()?;
        let entry = self.entries.get_mut(&id)?;
        entry.status = DownloadStatus::Transferring(conn_id);
        Some(DownloadJob {
            id,
            conf: entry.conf.clone(),
        })
    }

    pub fn has_pending_for(&self, peer: &str) -> bool {
        self.entries.values().any(|e| {
            e.conf.peer == peer && !matches!(e.status, DownloadStatus::Transferring(_))
        })
    }

    /// Waiting jobs for `peer`, used when re-establishing a connection to
    /// it fails and they all have to be reported.
    pub fn ids_pending_for(&self, peer: &str) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| {
                e.conf.peer == peer && !matches!(e.status, DownloadStatus::Transferring(_))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove a finished job. Completion and failure both land here so a job
    /// is taken out exactly once.
    pub fn complete(&mut self, id: u64) -> Option<DownloadConf> {
        self.entries.remove(&id).map(|e| e.conf)
    }

    /// Jobs currently serviced by a connection. When the connection dies
    /// with an error the control task fails them; on a clean idle close it
    /// requeues them.
    pub fn ids_by_conn(&self, conn_id: u64) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == DownloadStatus::Transferring(conn_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn requeue(&mut self, id: u64) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.status = DownloadStatus::Queued;
        }
    }

    /// Drain everything at close time; each entry reports `Cancelled`.
    pub fn drain(&mut self) -> Vec<DownloadConf> {
        self.entries.drain().map(|(_, e)| e.conf).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where download payload goes while in flight.
pub(crate) enum DownloadSink {
    Memory(Vec<u8>),
    File(tokio::fs::File),
}

impl DownloadSink {
    pub async fn open(conf: &DownloadConf) -> Result<Self> {
        match &conf.save_path {
            None => Ok(DownloadSink::Memory(Vec::new())),
            Some(path) => {
                let mut opts = tokio::fs::OpenOptions::new();
                opts.write(true).create(true).truncate(true);
                #[cfg(unix)]
                opts.mode(0o644);
                let file = opts.open(path).await?;
                Ok(DownloadSink::File(file))
            }
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            DownloadSink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            DownloadSink::File(f) => {
                use tokio::io::AsyncWriteExt;
                f.write_all(data).await.map_err(DcError::from)
            }
        }
    }

    pub async fn finish(self) -> Result<Option<Vec<u8>>> {
        match self {
            DownloadSink::Memory(buf) => Ok(Some(buf)),
            DownloadSink::File(f) => {
                f.sync_all().await?;
                Ok(None)
            }
        }
    }
}
