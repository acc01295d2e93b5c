//! Local share index
//!
//! Scans configured directory roots, hashes every regular file into a
//! Tiger-tree, and keeps the result as an in-memory tree that peers query by
//! hash, by search, or as the bzip2-compressed XML file list. Scanning runs
//! on a blocking worker; the control task swaps the finished root in, so
//! lookups never observe a file whose hashing is still in progress.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bzip2::write::BzEncoder;

use dunlin_core::error::{DcError, Result};
use dunlin_core::tiger::{TigerHash, TreeLeaves};
use dunlin_core::types::SearchQuery;

/// Most results returned for one search request.
pub const MAX_SEARCH_RESULTS: usize = 10;

/// One shared regular file.
#[derive(Debug, Clone)]
pub struct ShareFile {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
    pub tth: TigerHash,
    pub leaves: TreeLeaves,
}

/// One directory node of the share tree.
#[derive(Debug, Clone, Default)]
pub struct ShareDirectory {
    pub dirs: BTreeMap<String, ShareDirectory>,
    pub files: BTreeMap<String, ShareFile>,
    /// Accumulated size of everything below this node.
    pub size: u64,
}

impl ShareDirectory {
    /// Names are unique after case-insensitive normalization.
    fn name_taken(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.dirs.keys().chain(self.files.keys()).any(|n| n.to_lowercase() == lower)
    }
}

/// A configured root: the alias peers see and the local path behind it.
#[derive(Debug, Clone)]
pub struct ShareRoot {
    pub alias: String,
    pub path: PathBuf,
    pub dir: ShareDirectory,
}

/// Hash results survive rescans as long as (size, mtime) is unchanged.
pub(crate) type HashCache = HashMap<PathBuf, (u64, SystemTime, TigerHash, TreeLeaves)>;

/// A search hit against the local share.
#[derive(Debug, Clone)]
pub struct ShareHit {
    /// Hub-facing path, `alias/dir/file` with `\` separators.
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    pub tth: Option<TigerHash>,
}

#[derive(Default)]
pub struct ShareIndex {
    roots: Vec<ShareRoot>,
    cache: HashCache,
    file_list: Vec<u8>,
}

impl ShareIndex {
    /// Install a freshly scanned root, replacing any previous root with the
    /// same alias, and regenerate the file list.
    pub fn install(&mut self, root: ShareRoot) {
        self.roots.retain(|r| r.alias != root.alias);
        self.roots.push(root);
        self.rebuild_file_list();
    }

    pub fn take_cache(&mut self) -> HashCache {
        std::mem::take(&mut self.cache)
    }

    pub fn restore_cache(&mut self, cache: HashCache) {
        self.cache = cache;
    }

    pub fn total_size(&self) -> u64 {
        self.roots.iter().map(|r| r.dir.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// First match in root order, then depth-first path order.
    pub fn find_by_hash(&self, tth: &TigerHash) -> Option<(String, &ShareFile)> {
        for root in &self.roots {
            if let Some(hit) = find_in_dir(&root.dir, &root.alias, tth) {
                return Some(hit);
            }
        }
        None
    }

    /// Evaluate a peer's search request against the tree.
    pub fn search(&self, query: &SearchQuery) -> Vec<ShareHit> {
        let mut hits = Vec::new();
        for root in &self.roots {
            search_dir(&root.dir, &root.alias, query, &mut hits);
            if hits.len() >= MAX_SEARCH_RESULTS {
                hits.truncate(MAX_SEARCH_RESULTS);
                break;
            }
        }
        hits
    }

    /// The `files.xml.bz2` document served to peers.
    pub fn file_list(&self) -> &[u8] {
        &self.file_list
    }

    fn rebuild_file_list(&mut self) {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\r\n");
        xml.push_str("<FileListing Version=\"1\" Base=\"/\" Generator=\"dunlin\">\r\n");
        for root in &self.roots {
            write_dir_xml(&mut xml, &root.alias, &root.dir, 1);
        }
        xml.push_str("</FileListing>\r\n");

        let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
        // writing to a Vec cannot fail
        let _ = encoder.write_all(xml.as_bytes());
        self.file_list = encoder.finish().unwrap_or_default();
    }
}

fn find_in_dir<'a>(
    dir: &'a ShareDirectory,
    prefix: &str,
    tth: &TigerHash,
) -> Option<(String, &'a ShareFile)> {
    for (name, file) in &dir.files {
        if file.tth == *tth {
            return Some((format!("{}\\{}", prefix, name), file));
        }
    }
    for (name, sub) in &dir.dirs {
        if let Some(hit) = find_in_dir(sub, &format!("{}\\{}", prefix, name), tth) {
            return Some(hit);
        }
    }
    None
}

fn search_dir(dir: &ShareDirectory, prefix: &str, query: &SearchQuery, hits: &mut Vec<ShareHit>) {
    if hits.len() >= MAX_SEARCH_RESULTS {
        return;
    }
    match query {
        SearchQuery::Tth(tth) => {
            for (name, file) in &dir.files {
                if file.tth == *tth {
                    hits.push(ShareHit {
                        path: format!("{}\\{}", prefix, name),
                        size: file.size,
                        is_directory: false,
                        tth: Some(file.tth),
                    });
                }
            }
        }
        SearchQuery::Name {
            text,
            min_size,
            max_size,
        } => {
            let needle = text.to_lowercase();
            for (name, file) in &dir.files {
                if !name.to_lowercase().contains(&needle) {
                    continue;
                }
                if min_size.is_some_and(|n| file.size < n)
                    || max_size.is_some_and(|n| file.size > n)
                {
                    continue;
                }
                hits.push(ShareHit {
                    path: format!("{}\\{}", prefix, name),
                    size: file.size,
                    is_directory: false,
                    tth: Some(file.tth),
                });
            }
            for (name, _) in &dir.dirs {
                if name.to_lowercase().contains(&needle) {
                    hits.push(ShareHit {
                        path: format!("{}\\{}", prefix, name),
                        size: 0,
                        is_directory: true,
                        tth: None,
                    });
                }
            }
        }
    }
    for (name, sub) in &dir.dirs {
        search_dir(sub, &format!("{}\\{}", prefix, name), query, hits);
    }
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn write_dir_xml(xml: &mut String, name: &str, dir: &ShareDirectory, depth: usize) {
    let pad = "\t".repeat(depth);
    xml.push_str(&format!("{}<Directory Name=\"{}\">\r\n", pad, xml_escape(name)));
    for (sub_name, sub) in &dir.dirs {
        write_dir_xml(xml, sub_name, sub, depth + 1);
    }
    for (file_name, file) in &dir.files {
        xml.push_str(&format!(
            "{}\t<File Name=\"{}\" Size=\"{}\" TTH=\"{}\"/>\r\n",
            pad,
            xml_escape(file_name),
            file.size,
            file.tth
        ));
    }
    xml.push_str(&format!("{}</Directory>\r\n", pad));
}

/// Recursively scan and hash one root. Blocking; callers run it on a worker
/// (`tokio::task::spawn_blocking`) and install the result afterwards.
pub fn scan_root(
    alias: &str,
    path: &Path,
    cache: &mut HashCache,
    max_leaves: usize,
) -> Result<ShareRoot> {
    if alias.is_empty() || alias.contains(['\\', '/', '$', '|']) {
        return Err(DcError::ConfigInvalid(format!("bad share alias: {}", alias)));
    }
    let canonical = path
        .canonicalize()
        .map_err(|_| DcError::NotFound(format!("share root {}", path.display())))?;
    let mut visited = HashSet::new();
    visited.insert(canonical.clone());
    let dir = scan_dir(&canonical, cache, max_leaves, &mut visited)?;
    Ok(ShareRoot {
        alias: alias.to_string(),
        path: canonical,
        dir,
    })
}

fn scan_dir(
    path: &Path,
    cache: &mut HashCache,
    max_leaves: usize,
    visited: &mut HashSet<PathBuf>,
) -> Result<ShareDirectory> {
    let mut dir = ShareDirectory::default();
    let entries = std::fs::read_dir(path)?;
    for entry in entries {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!("skipping non-utf8 name under {}", path.display());
                continue;
            }
        };
        if dir.name_taken(&name) {
            tracing::warn!(
                "skipping {}: name collides case-insensitively",
                entry.path().display()
            );
            continue;
        }
        // follow symlinks but detect cycles through canonical paths
        let meta = match std::fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        if meta.is_dir() {
            let canonical = match entry.path().canonicalize() {
                Ok(c) => c,
                Err(_) => continue,
            };
            if !visited.insert(canonical.clone()) {
                tracing::warn!("symlink cycle at {}", entry.path().display());
                continue;
            }
            let sub = scan_dir(&canonical, cache, max_leaves, visited)?;
            dir.size += sub.size;
            dir.dirs.insert(name, sub);
        } else if meta.is_file() {
            let size = meta.len();
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let fpath = entry.path();
            let (tth, leaves) = match cache.get(&fpath) {
                Some((csize, cmtime, tth, leaves)) if *csize == size && *cmtime == mtime => {
                    (*tth, leaves.clone())
                }
                _ => {
                    let hashed = std::fs::File::open(&fpath).map_err(DcError::from).and_then(
                        |file| {
                            TreeLeaves::from_reader(std::io::BufReader::new(file), size, max_leaves)
                        },
                    );
                    let leaves = match hashed {
                        Ok(leaves) => leaves,
                        Err(e) => {
                            tracing::warn!("skipping {}: {}", fpath.display(), e);
                            continue;
                        }
                    };
                    let tth = leaves.root();
                    cache.insert(fpath.clone(), (size, mtime, tth, leaves.clone()));
                    (tth, leaves)
                }
            };
            dir.size += size;
            dir.files.insert(
                name,
                ShareFile {
                    path: fpath,
                    size,
                    mtime,
                    tth,
                    leaves,
                },
            );
        }
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dunlin_core::tiger::root_of;
    use std::io::Read;
    use tempfile::TempDir;

    fn build_share() -> (TempDir, ShareIndex) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("test file.txt"), "A".repeat(10000)).unwrap();
        std::fs::write(tmp.path().join("sub/other.bin"), b"0123456789").unwrap();

        let mut index = ShareIndex::default();
        let mut cache = HashMap::new();
        let root = scan_root("share", tmp.path(), &mut cache, 512).unwrap();
        index.install(root);
        index.restore_cache(cache);
        (tmp, index)
    }

    #[test]
    fn scan_finds_files_and_sizes() {
        let (_tmp, index) = build_share();
        assert_eq!(index.total_size(), 10010);

        let tth = root_of("A".repeat(10000).as_bytes());
        assert_eq!(tth.to_string(), "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY");
        let (path, file) = index.find_by_hash(&tth).unwrap();
        assert_eq!(path, "share\\test file.txt");
        assert_eq!(file.size, 10000);
        assert_eq!(file.leaves.root(), tth);
    }

    #[test]
    fn find_unknown_hash_is_none() {
        let (_tmp, index) = build_share();
        assert!(index.find_by_hash(&root_of(b"missing")).is_none());
    }

    #[test]
    fn search_by_name_and_size() {
        let (_tmp, index) = build_share();
        let hits = index.search(&SearchQuery::Name {
            text: "test".into(),
            min_size: None,
            max_size: None,
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "share\\test file.txt");

        let hits = index.search(&SearchQuery::Name {
            text: "test".into(),
            min_size: Some(20000),
            max_size: None,
        });
        assert!(hits.is_empty());

        let hits = index.search(&SearchQuery::Name {
            text: "sub".into(),
            min_size: None,
            max_size: None,
        });
        assert!(hits.iter().any(|h| h.is_directory));
    }

    #[test]
    fn search_by_tth() {
        let (_tmp, index) = build_share();
        let tth = root_of(b"0123456789");
        let hits = index.search(&SearchQuery::Tth(tth));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "share\\sub\\other.bin");
    }

    #[test]
    fn file_list_decompresses_to_xml() {
        let (_tmp, index) = build_share();
        let mut decoder = bzip2::read::BzDecoder::new(index.file_list());
        let mut xml = String::new();
        decoder.read_to_string(&mut xml).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<Directory Name=\"share\">"));
        assert!(xml.contains("Name=\"test file.txt\""));
        assert!(xml.contains("TTH=\"UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY\""));
    }

    #[test]
    fn rescan_reuses_cache_until_mtime_changes() {
        let tmp = TempDir::new().unwrap();
        let fpath = tmp.path().join("f.bin");
        std::fs::write(&fpath, b"first contents").unwrap();

        let mut cache = HashMap::new();
        let root1 = scan_root("s", tmp.path(), &mut cache, 512).unwrap();
        let tth1 = root1.dir.files["f.bin"].tth;
        assert_eq!(cache.len(), 1);

        // unchanged file: cached entry survives a rescan
        let root2 = scan_root("s", tmp.path(), &mut cache, 512).unwrap();
        assert_eq!(root2.dir.files["f.bin"].tth, tth1);

        std::fs::write(&fpath, b"different contents!").unwrap();
        let root3 = scan_root("s", tmp.path(), &mut cache, 512).unwrap();
        assert_ne!(root3.dir.files["f.bin"].tth, tth1);
    }

    #[test]
    fn install_replaces_same_alias() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"aaa").unwrap();
        let mut cache = HashMap::new();
        let mut index = ShareIndex::default();
        index.install(scan_root("share", tmp.path(), &mut cache, 512).unwrap());
        let before = index.total_size();
        index.install(scan_root("share", tmp.path(), &mut cache, 512).unwrap());
        assert_eq!(index.total_size(), before);
    }

    #[cfg(unix)]
    #[test]
    fn broken_symlink_is_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), tmp.path().join("dangling")).unwrap();
        let mut cache = HashMap::new();
        let root = scan_root("s", tmp.path(), &mut cache, 512).unwrap();
        assert_eq!(root.dir.files.len(), 1);
        assert!(root.dir.files.contains_key("real.txt"));
    }
}
