//! Upload servicing
//!
//! Parses peer `GET` requests, admits them against the slot pool, resolves
//! their subject through the share index, and produces the plan the peer
//! connection streams from. Slot accounting lives entirely on the control
//! task; a grant is balanced by exactly one release.

use std::path::PathBuf;

use dunlin_core::error::{DcError, Result};
use dunlin_core::tiger::TigerHash;

use crate::share::ShareIndex;

/// Streaming chunk size for upload payloads.
pub const UPLOAD_CHUNK: usize = 1024 * 1024;

/// Admission control for concurrent uploads.
pub(crate) struct SlotPool {
    total: u32,
    available: u32,
}

impl SlotPool {
    pub fn new(total: u32) -> Self {
        SlotPool {
            total,
            available: total,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    pub fn release(&mut self) {
        debug_assert!(self.available < self.total, "unbalanced slot release");
        if self.available < self.total {
            self.available += 1;
        }
    }
}

/// Subject of an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSubject {
    /// `file files.xml.bz2`
    FileList,
    /// `file TTH/<root>`
    File(TigerHash),
    /// `tthl TTH/<root>`
    Leaves(TigerHash),
}

/// A parsed peer request, surfaced to the embedder's veto callback.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub peer: String,
    pub subject: UploadSubject,
    pub start: u64,
    /// Requested length, `-1` meaning to the end.
    pub length: i64,
    /// The peer asked for on-the-wire zlib.
    pub compress: bool,
}

impl UploadRequest {
    /// Parse the `GET` subject tokens shared by both dialects.
    pub fn parse(
        peer: &str,
        kind: &str,
        path: &str,
        start: u64,
        length: i64,
        compress: bool,
    ) -> Result<Self> {
        let subject = match (kind, path) {
            ("file", "files.xml.bz2") => UploadSubject::FileList,
            ("file", p) => {
                let tth = p
                    .strip_prefix("TTH/")
                    .ok_or_else(|| {
                        DcError::ProtocolSemantic(format!("unsupported file subject: {}", p))
                    })?;
                UploadSubject::File(TigerHash::from_base32(tth)?)
            }
            ("tthl", p) => {
                let tth = p.strip_prefix("TTH/").ok_or_else(|| {
                    DcError::ProtocolSemantic(format!("unsupported tthl subject: {}", p))
                })?;
                UploadSubject::Leaves(TigerHash::from_base32(tth)?)
            }
            (k, _) => {
                return Err(DcError::ProtocolSemantic(format!(
                    "unsupported request kind: {}",
                    k
                )))
            }
        };
        Ok(UploadRequest {
            peer: peer.to_string(),
            subject,
            start,
            length,
            compress,
        })
    }

    /// Human-oriented form for logs.
    pub fn describe(&self) -> String {
        match &self.subject {
            UploadSubject::FileList => "file list".to_string(),
            UploadSubject::File(tth) => format!("file {}", tth),
            UploadSubject::Leaves(tth) => format!("leaves {}", tth),
        }
    }
}

/// What the peer connection streams.
#[derive(Debug)]
pub(crate) enum UploadSource {
    Bytes(Vec<u8>),
    File { path: PathBuf, start: u64 },
}

/// A granted upload: source, effective length, negotiated compression.
#[derive(Debug)]
pub(crate) struct UploadPlan {
    pub source: UploadSource,
    pub length: u64,
    pub compress: bool,
}

/// Outcome summary handed to the embedder when an upload ends.
#[derive(Debug)]
pub struct Upload {
    pub peer: String,
    pub request: UploadRequest,
    pub sent: u64,
    pub length: u64,
    pub result: Result<()>,
}

/// Resolve a request against the share. Range errors and missing files
/// surface before any slot is consumed.
pub(crate) fn resolve(
    share: &ShareIndex,
    req: &UploadRequest,
    allow_compression: bool,
) -> Result<UploadPlan> {
    let compress = req.compress && allow_compression;
    match &req.subject {
        UploadSubject::FileList => {
            if req.start != 0 || req.length != -1 {
                return Err(DcError::UnsupportedRange);
            }
            let bytes = share.file_list().to_vec();
            Ok(UploadPlan {
                length: bytes.len() as u64,
                source: UploadSource::Bytes(bytes),
                compress,
            })
        }
        UploadSubject::Leaves(tth) => {
            if req.start != 0 || req.length != -1 {
                return Err(DcError::UnsupportedRange);
            }
            let (_, file) = share
                .find_by_hash(tth)
                .ok_or_else(|| DcError::NotFound(format!("TTH {}", tth)))?;
            let bytes = file.leaves.to_wire();
            Ok(UploadPlan {
                length: bytes.len() as u64,
                source: UploadSource::Bytes(bytes),
                compress,
            })
        }
        UploadSubject::File(tth) => {
            let (_, file) = share
                .find_by_hash(tth)
                .ok_or_else(|| DcError::NotFound(format!("TTH {}", tth)))?;
            // resolve symlinks; a dangling link means the entry is stale
            let real = file
                .path
                .canonicalize()
                .map_err(|_| DcError::NotFound(format!("TTH {}", tth)))?;
            let meta =
                std::fs::metadata(&real).map_err(|_| DcError::NotFound(format!("TTH {}", tth)))?;
            let size = meta.len();
            if req.start > size {
                return Err(DcError::RangeTooBig);
            }
            let max_length = size - req.start;
            let length = if req.length == -1 {
                max_length
            } else {
                let wanted = req.length as u64;
                if wanted > max_length {
                    return Err(DcError::RangeTooBig);
                }
                wanted
            };
            Ok(UploadPlan {
                source: UploadSource::File {
                    path: real,
                    start: req.start,
                },
                length,
                compress,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::{scan_root, ShareIndex};
    use dunlin_core::tiger::root_of;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const A10000: &str = "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY";

    fn share_with_file() -> (TempDir, ShareIndex) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("test file.txt"), "A".repeat(10000)).unwrap();
        let mut cache = HashMap::new();
        let mut index = ShareIndex::default();
        index.install(scan_root("share", tmp.path(), &mut cache, 512).unwrap());
        (tmp, index)
    }

    #[test]
    fn slot_pool_invariant() {
        let mut pool = SlotPool::new(2);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        pool.release();
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire());
        pool.release();
        pool.release();
        assert_eq!(pool.available(), pool.total());
    }

    #[test]
    fn parse_subjects() {
        let r = UploadRequest::parse("p", "file", "files.xml.bz2", 0, -1, false).unwrap();
        assert_eq!(r.subject, UploadSubject::FileList);

        let r = UploadRequest::parse("p", "file", &format!("TTH/{}", A10000), 0, -1, true).unwrap();
        assert!(matches!(r.subject, UploadSubject::File(_)));

        let r = UploadRequest::parse("p", "tthl", &format!("TTH/{}", A10000), 0, -1, false).unwrap();
        assert!(matches!(r.subject, UploadSubject::Leaves(_)));

        assert!(UploadRequest::parse("p", "list", "/", 0, -1, false).is_err());
        assert!(UploadRequest::parse("p", "file", "plain/path", 0, -1, false).is_err());
    }

    #[test]
    fn filelist_rejects_ranges() {
        let (_tmp, share) = share_with_file();
        let req = UploadRequest::parse("p", "file", "files.xml.bz2", 1, -1, false).unwrap();
        assert!(matches!(
            resolve(&share, &req, true),
            Err(DcError::UnsupportedRange)
        ));
        let req = UploadRequest::parse("p", "file", "files.xml.bz2", 0, 100, false).unwrap();
        assert!(matches!(
            resolve(&share, &req, true),
            Err(DcError::UnsupportedRange)
        ));
    }

    #[test]
    fn file_range_resolution() {
        let (_tmp, share) = share_with_file();
        let path = format!("TTH/{}", A10000);

        let req = UploadRequest::parse("p", "file", &path, 0, -1, false).unwrap();
        let plan = resolve(&share, &req, true).unwrap();
        assert_eq!(plan.length, 10000);

        // length = -1 from an offset transfers size - start bytes
        let req = UploadRequest::parse("p", "file", &path, 4000, -1, false).unwrap();
        let plan = resolve(&share, &req, true).unwrap();
        assert_eq!(plan.length, 6000);

        let req = UploadRequest::parse("p", "file", &path, 4000, 6000, false).unwrap();
        assert_eq!(resolve(&share, &req, true).unwrap().length, 6000);

        let req = UploadRequest::parse("p", "file", &path, 4000, 6001, false).unwrap();
        assert!(matches!(
            resolve(&share, &req, true),
            Err(DcError::RangeTooBig)
        ));

        let req = UploadRequest::parse("p", "file", &path, 10001, -1, false).unwrap();
        assert!(matches!(
            resolve(&share, &req, true),
            Err(DcError::RangeTooBig)
        ));
    }

    #[test]
    fn unknown_hash_is_not_found() {
        let (_tmp, share) = share_with_file();
        let missing = root_of(b"nothing shared");
        let req =
            UploadRequest::parse("p", "file", &format!("TTH/{}", missing), 0, -1, false).unwrap();
        assert!(matches!(
            resolve(&share, &req, true),
            Err(DcError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlink_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("real.bin");
        std::fs::write(&target, b"shared data").unwrap();
        let mut cache = HashMap::new();
        let mut index = ShareIndex::default();
        index.install(scan_root("share", tmp.path(), &mut cache, 512).unwrap());
        let tth = root_of(b"shared data");

        // the file disappears after indexing
        std::fs::remove_file(&target).unwrap();
        let req =
            UploadRequest::parse("p", "file", &format!("TTH/{}", tth), 0, -1, false).unwrap();
        assert!(matches!(
            resolve(&index, &req, true),
            Err(DcError::NotFound(_))
        ));
    }

    #[test]
    fn compression_needs_both_sides() {
        let (_tmp, share) = share_with_file();
        let req = UploadRequest::parse("p", "file", "files.xml.bz2", 0, -1, true).unwrap();
        assert!(resolve(&share, &req, true).unwrap().compress);
        assert!(!resolve(&share, &req, false).unwrap().compress);
    }

    #[test]
    fn leaves_resolution() {
        let (_tmp, share) = share_with_file();
        let req =
            UploadRequest::parse("p", "tthl", &format!("TTH/{}", A10000), 0, -1, false).unwrap();
        let plan = resolve(&share, &req, true).unwrap();
        match plan.source {
            UploadSource::Bytes(b) => assert_eq!(b.len() as u64, plan.length),
            _ => panic!("expected in-memory leaves"),
        }
    }
}
