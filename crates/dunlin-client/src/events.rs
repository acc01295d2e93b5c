//! Event callbacks surfaced to the embedder
//!
//! Callbacks run on the control task, one at a time, in the order the
//! control task observed the events. Each receives the client [`Handle`] so
//! it can issue further API calls; fire-and-forget calls are safe from
//! inside a callback, the blocking `safe_wait` variant is not.

use dunlin_core::error::DcError;
use dunlin_core::types::{Peer, SearchResult};

use crate::client::Handle;
use crate::download::{Download, DownloadError};
use crate::upload::{Upload, UploadRequest};

type Cb0 = Box<dyn FnMut(&Handle) + Send>;
type Cb<T> = Box<dyn FnMut(&Handle, &T) + Send>;

#[derive(Default)]
pub struct Callbacks {
    /// The client finished starting up; share and hub calls are accepted.
    pub on_initialized: Option<Cb0>,
    /// A `share_add` scan completed.
    pub on_share_indexed: Option<Cb0>,
    /// The hub TCP (or TLS) connection is established.
    pub on_hub_connected: Option<Cb0>,
    /// The hub announced or changed its display name.
    pub on_hub_name: Option<Box<dyn FnMut(&Handle, &str) + Send>>,
    /// The hub session failed; the client is tearing down.
    pub on_hub_error: Option<Cb<DcError>>,
    pub on_peer_connected: Option<Cb<Peer>>,
    pub on_peer_updated: Option<Cb<Peer>>,
    pub on_peer_disconnected: Option<Cb<Peer>>,
    pub on_message_public: Option<Box<dyn FnMut(&Handle, &Peer, &str) + Send>>,
    pub on_message_private: Option<Box<dyn FnMut(&Handle, &Peer, &str) + Send>>,
    pub on_search_result: Option<Cb<SearchResult>>,
    pub on_download_successful: Option<Cb<Download>>,
    pub on_download_error: Option<Cb<DownloadError>>,
    /// Veto hook for inbound upload requests; returning `false` rejects the
    /// request before it consumes a slot.
    pub on_upload_requested: Option<Box<dyn FnMut(&Handle, &UploadRequest) -> bool + Send>>,
    pub on_upload_completed: Option<Cb<Upload>>,
}

impl Callbacks {
    pub(crate) fn initialized(&mut self, handle: &Handle) {
        if let Some(cb) = &mut self.on_initialized {
            cb(handle);
        }
    }

    pub(crate) fn share_indexed(&mut self, handle: &Handle) {
        if let Some(cb) = &mut self.on_share_indexed {
            cb(handle);
        }
    }

    pub(crate) fn hub_connected(&mut self, handle: &Handle) {
        if let Some(cb) = &mut self.on_hub_connected {
            cb(handle);
        }
    }

    pub(crate) fn hub_name(&mut self, handle: &Handle, name: &str) {
        if let Some(cb) = &mut self.on_hub_name {
            cb(handle, name);
        }
    }

    pub(crate) fn hub_error(&mut self, handle: &Handle, err: &DcError) {
        if let Some(cb) = &mut self.on_hub_error {
            cb(handle, err);
        }
    }

    pub(crate) fn peer_connected(&mut self, handle: &Handle, peer: &Peer) {
        if let Some(cb) = &mut self.on_peer_connected {
            cb(handle, peer);
        }
    }

    pub(crate) fn peer_updated(&mut self, handle: &Handle, peer: &Peer) {
        if let Some(cb) = &mut self.on_peer_updated {
            cb(handle, peer);
        }
    }

    pub(crate) fn peer_disconnected(&mut self, handle: &Handle, peer: &Peer) {
        if let Some(cb) = &mut self.on_peer_disconnected {
            cb(handle, peer);
        }
    }

    pub(crate) fn message_public(&mut self, handle: &Handle, peer: &Peer, text: &str) {
        if let Some(cb) = &mut self.on_message_public {
            cb(handle, peer, text);
        }
    }

    pub(crate) fn message_private(&mut self, handle: &Handle, peer: &Peer, text: &str) {
        if let Some(cb) = &mut self.on_message_private {
            cb(handle, peer, text);
        }
    }

    pub(crate) fn search_result(&mut self, handle: &Handle, result: &SearchResult) {
        if let Some(cb) = &mut self.on_search_result {
            cb(handle, result);
        }
    }

    pub(crate) fn download_successful(&mut self, handle: &Handle, download: &Download) {
        if let Some(cb) = &mut self.on_download_successful {
            cb(handle, download);
        }
    }

    pub(crate) fn download_error(&mut self, handle: &Handle, err: &DownloadError) {
        if let Some(cb) = &mut self.on_download_error {
            cb(handle, err);
        }
    }

    pub(crate) fn upload_requested(&mut self, handle: &Handle, req: &UploadRequest) -> bool {
        match &mut self.on_upload_requested {
            Some(cb) => cb(handle, req),
            None => true,
        }
    }

    pub(crate) fn upload_completed(&mut self, handle: &Handle, upload: &Upload) {
        if let Some(cb) = &mut self.on_upload_completed {
            cb(handle, upload);
        }
    }
}
