//! Tiger-tree hashing (TTH)
//!
//! Files are identified on the wire by the root of a Merkle tree built with
//! the Tiger digest: 1 KiB base segments hashed with a 0x00 prefix, inner
//! nodes with a 0x01 prefix, odd nodes promoted unchanged. Leaf digests are
//! kept at a coarser block size so the serialized leaf list stays small for
//! large files while still chaining to the same root.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use tiger::{Digest, Tiger};

use crate::error::{DcError, Result};

/// Size of a Tiger digest in bytes.
pub const TIGER_SIZE: usize = 24;

/// Base segment of the hash tree. Fixed by the protocol; every peer on the
/// network must agree on it for roots to match.
pub const BASE_SEGMENT: u64 = 1024;

/// Default cap on the number of serialized leaves per file. The leaf block
/// size doubles until the count fits.
pub const DEFAULT_MAX_LEAVES: usize = 512;

/// A Tiger digest, base-32 encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TigerHash(pub [u8; TIGER_SIZE]);

impl TigerHash {
    /// Parse the base-32 wire form (39 characters, no padding).
    pub fn from_base32(s: &str) -> Result<Self> {
        let bytes = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|_| DcError::ProtocolSyntax(format!("invalid TTH: {}", s)))?;
        if bytes.len() != TIGER_SIZE {
            return Err(DcError::ProtocolSyntax(format!("invalid TTH length: {}", s)));
        }
        let mut out = [0u8; TIGER_SIZE];
        out.copy_from_slice(&bytes);
        Ok(TigerHash(out))
    }

    pub fn as_bytes(&self) -> &[u8; TIGER_SIZE] {
        &self.0
    }
}

impl fmt::Display for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE32_NOPAD.encode(&self.0))
    }
}

impl fmt::Debug for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TigerHash({})", self)
    }
}

impl FromStr for TigerHash {
    type Err = DcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base32(s)
    }
}

fn hash_segment(data: &[u8]) -> TigerHash {
    let mut h = Tiger::new();
    h.update([0u8]);
    h.update(data);
    TigerHash(h.finalize().into())
}

fn hash_inner(left: &TigerHash, right: &TigerHash) -> TigerHash {
    let mut h = Tiger::new();
    h.update([1u8]);
    h.update(left.0);
    h.update(right.0);
    TigerHash(h.finalize().into())
}

/// Reduce one tree level: adjacent pairs combined, a trailing odd node
/// promoted unchanged.
fn reduce_level(nodes: &[TigerHash]) -> Vec<TigerHash> {
    let mut out = Vec::with_capacity(nodes.len() / 2 + 1);
    let mut it = nodes.chunks_exact(2);
    for pair in &mut it {
        out.push(hash_inner(&pair[0], &pair[1]));
    }
    if let [odd] = it.remainder() {
        out.push(*odd);
    }
    out
}

/// Hash of the tree node covering one leaf block (any power-of-two multiple
/// of the base segment).
fn block_node(block: &[u8]) -> TigerHash {
    if block.len() <= BASE_SEGMENT as usize {
        return hash_segment(block);
    }
    let mut nodes: Vec<TigerHash> = block
        .chunks(BASE_SEGMENT as usize)
        .map(hash_segment)
        .collect();
    while nodes.len() > 1 {
        nodes = reduce_level(&nodes);
    }
    nodes[0]
}

/// The ordered leaf digests of a file's hash tree at a fixed block size.
#[derive(Clone, PartialEq, Eq)]
pub struct TreeLeaves {
    pub block_size: u64,
    pub digests: Vec<TigerHash>,
}

impl TreeLeaves {
    /// Smallest power-of-two multiple of the base segment that covers `size`
    /// bytes in at most `max_leaves` blocks.
    pub fn block_size_for(size: u64, max_leaves: usize) -> u64 {
        let mut bs = BASE_SEGMENT;
        while size.div_ceil(bs) > max_leaves as u64 {
            bs *= 2;
        }
        bs
    }

    /// Compute the leaves of `reader`, expected to yield exactly `size`
    /// bytes. Runs on the caller's thread; share scanning calls it from a
    /// blocking worker.
    pub fn from_reader<R: Read>(mut reader: R, size: u64, max_leaves: usize) -> Result<Self> {
        let block_size = Self::block_size_for(size, max_leaves);
        let mut digests = Vec::with_capacity(size.div_ceil(block_size).max(1) as usize);
        let mut block = vec![0u8; block_size as usize];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(block_size) as usize;
            reader
                .read_exact(&mut block[..want])
                .map_err(DcError::from)?;
            digests.push(block_node(&block[..want]));
            remaining -= want as u64;
        }
        if digests.is_empty() {
            digests.push(hash_segment(&[]));
        }
        Ok(TreeLeaves { block_size, digests })
    }

    pub fn from_bytes_of(data: &[u8], max_leaves: usize) -> Self {
        // reading from a slice cannot fail
        Self::from_reader(data, data.len() as u64, max_leaves).unwrap_or_else(|_| TreeLeaves {
            block_size: BASE_SEGMENT,
            digests: vec![hash_segment(&[])],
        })
    }

    /// Chain the leaves up to the tree root.
    pub fn root(&self) -> TigerHash {
        let mut nodes = self.digests.clone();
        while nodes.len() > 1 {
            nodes = reduce_level(&nodes);
        }
        nodes[0]
    }

    /// Wire form: the digests concatenated in order.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.digests.len() * TIGER_SIZE);
        for d in &self.digests {
            out.extend_from_slice(&d.0);
        }
        out
    }

    /// Parse the wire form received from a peer and check it chains to the
    /// expected root before it is trusted for block verification.
    pub fn from_wire(data: &[u8], file_size: u64, expected_root: &TigerHash) -> Result<Self> {
        if data.is_empty() || data.len() % TIGER_SIZE != 0 {
            return Err(DcError::Integrity(format!(
                "leaf list length {} is not a digest multiple",
                data.len()
            )));
        }
        let digests: Vec<TigerHash> = data
            .chunks_exact(TIGER_SIZE)
            .map(|c| {
                let mut d = [0u8; TIGER_SIZE];
                d.copy_from_slice(c);
                TigerHash(d)
            })
            .collect();
        // the peer serializes leaves at the smallest block size that fits its
        // own cap; recover it from the count
        let mut block_size = BASE_SEGMENT;
        while file_size.div_ceil(block_size).max(1) > digests.len() as u64 {
            block_size *= 2;
        }
        if file_size.div_ceil(block_size).max(1) != digests.len() as u64 {
            return Err(DcError::Integrity(format!(
                "leaf count {} does not cover {} bytes",
                digests.len(),
                file_size
            )));
        }
        let leaves = TreeLeaves { block_size, digests };
        if leaves.root() != *expected_root {
            return Err(DcError::Integrity(
                "leaf list does not chain to the requested root".into(),
            ));
        }
        Ok(leaves)
    }
}

impl fmt::Debug for TreeLeaves {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLeaves")
            .field("block_size", &self.block_size)
            .field("count", &self.digests.len())
            .finish()
    }
}

/// Root of a byte slice, without keeping leaves.
pub fn root_of(data: &[u8]) -> TigerHash {
    TreeLeaves::from_bytes_of(data, DEFAULT_MAX_LEAVES).root()
}

/// Verifies downloaded bytes block-by-block against a trusted leaf list.
///
/// Bytes may arrive in arbitrary slices; each completed block is checked as
/// soon as it is full. `finish` checks the trailing partial block.
pub struct LeafVerifier {
    leaves: TreeLeaves,
    buf: Vec<u8>,
    next_leaf: usize,
}

impl LeafVerifier {
    pub fn new(leaves: TreeLeaves) -> Self {
        LeafVerifier {
            buf: Vec::with_capacity(leaves.block_size as usize),
            leaves,
            next_leaf: 0,
        }
    }

    fn check_block(&mut self) -> Result<()> {
        let expected = self
            .leaves
            .digests
            .get(self.next_leaf)
            .ok_or_else(|| DcError::Integrity("more data than leaves cover".into()))?;
        if block_node(&self.buf) != *expected {
            return Err(DcError::Integrity(format!(
                "block {} does not match its leaf digest",
                self.next_leaf
            )));
        }
        self.next_leaf += 1;
        self.buf.clear();
        Ok(())
    }

    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        let bs = self.leaves.block_size as usize;
        while !data.is_empty() {
            let take = (bs - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == bs {
                self.check_block()?;
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.check_block()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // reference values produced by existing clients on the network
    const EMPTY_ROOT: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";
    const A10000_ROOT: &str = "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY";

    #[test]
    fn empty_root() {
        assert_eq!(root_of(b"").to_string(), EMPTY_ROOT);
    }

    #[test]
    fn known_root() {
        let data = vec![b'A'; 10000];
        assert_eq!(root_of(&data).to_string(), A10000_ROOT);
    }

    #[test]
    fn base32_roundtrip() {
        let h = root_of(b"roundtrip");
        let parsed = TigerHash::from_base32(&h.to_string()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn base32_rejects_garbage() {
        assert!(TigerHash::from_base32("not-base32!").is_err());
        assert!(TigerHash::from_base32("ABCD").is_err());
    }

    #[test]
    fn root_independent_of_leaf_granularity() {
        let data = vec![0x5au8; 300_000];
        let fine = TreeLeaves::from_bytes_of(&data, 4096);
        let coarse = TreeLeaves::from_bytes_of(&data, 8);
        assert_ne!(fine.digests.len(), coarse.digests.len());
        assert_eq!(fine.root(), coarse.root());
    }

    #[test]
    fn block_size_doubles_to_fit_cap() {
        assert_eq!(TreeLeaves::block_size_for(1024, 512), 1024);
        assert_eq!(TreeLeaves::block_size_for(1024 * 513, 512), 2048);
        assert_eq!(TreeLeaves::block_size_for(0, 512), 1024);
    }

    #[test]
    fn wire_roundtrip_chains_to_root() {
        let data = vec![7u8; 50_000];
        let leaves = TreeLeaves::from_bytes_of(&data, 16);
        let root = leaves.root();
        let wire = leaves.to_wire();
        let parsed = TreeLeaves::from_wire(&wire, data.len() as u64, &root).unwrap();
        assert_eq!(parsed, leaves);
    }

    #[test]
    fn wire_rejects_wrong_root() {
        let data = vec![7u8; 50_000];
        let leaves = TreeLeaves::from_bytes_of(&data, 16);
        let wire = leaves.to_wire();
        let wrong = root_of(b"something else");
        assert!(TreeLeaves::from_wire(&wire, data.len() as u64, &wrong).is_err());
    }

    #[test]
    fn verifier_accepts_in_arbitrary_slices() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let leaves = TreeLeaves::from_bytes_of(&data, 32);
        let mut v = LeafVerifier::new(leaves);
        for chunk in data.chunks(777) {
            v.update(chunk).unwrap();
        }
        v.finish().unwrap();
    }

    #[test]
    fn verifier_rejects_corruption() {
        let data = vec![1u8; 10_000];
        let leaves = TreeLeaves::from_bytes_of(&data, 32);
        let mut corrupted = data.clone();
        corrupted[5000] ^= 0xff;
        let mut v = LeafVerifier::new(leaves);
        let res = v.update(&corrupted).and_then(|_| v.finish());
        assert!(matches!(res, Err(DcError::Integrity(_))));
    }
}
