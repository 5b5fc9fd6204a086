//! Content fingerprinting and tree diffing.
//!
//! Every file that ships to Walrus is identified locally by the Blake3 hash
//! of its bytes. The scan produced here is the sole input to change
//! detection: two files with identical bytes always hash equal, so the
//! change-set computer can rely on fingerprint equality alone.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use derive_more::Display;
use jiff::Timestamp;
use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};
use walkdir::WalkDir;

/// A Blake3 hash, hex encoded in lowercase.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Blake3(String);

impl Blake3 {
    /// Hash the contents of the file at the specified path.
    #[instrument(name = "Blake3::from_file")]
    pub fn from_file(path: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref();
        #[allow(clippy::disallowed_methods)]
        let file = std::fs::File::open(path).with_context(|| format!("open file: {path:?}"))?;

        let mut reader = std::io::BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let bytes = std::io::copy(&mut reader, &mut hasher)
            .with_context(|| format!("hash file: {path:?}"))?;

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?path, ?hash, ?bytes, "hash file");
        Ok(Self(hash))
    }

    /// Hash the contents of a buffer.
    #[instrument(skip_all, name = "Blake3::from_buffer")]
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer);

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?hash, bytes = ?buffer.len(), "hash buffer");
        Self(hash)
    }

    /// Wrap an already hex-encoded hash, as read back from the cache store.
    pub fn from_hex(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// View the hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Blake3 {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The observed state of one file during a tree scan.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileProbe {
    /// Fingerprint of the file's bytes.
    pub hash: Blake3,
    /// Size of the file in bytes.
    pub size: u64,
    /// Modification timestamp, where the filesystem reports one.
    pub mtime: Option<Timestamp>,
}

/// The result of scanning a site tree: relative forward-slash paths mapped to
/// their probes. Ordered so that scans are directly comparable in tests.
pub type TreeScan = BTreeMap<String, FileProbe>;

/// Scan a directory tree, hashing every regular file in parallel.
///
/// Paths in the returned map are relative to `root` with separators
/// normalized to `/`. Entries under any of the `exclude` directory names at
/// the root are skipped (the build cache lives inside the site and must not
/// fingerprint itself).
///
/// An I/O error on any individual file aborts the whole scan: a deployment
/// pipeline must not silently skip content.
#[instrument(skip(exclude))]
pub fn scan_tree(root: impl AsRef<Utf8Path> + std::fmt::Debug, exclude: &[&str]) -> Result<TreeScan> {
    let root = root.as_ref();

    // Hashing is CPU-bound and files are independent, so the walk is bridged
    // into the rayon pool and results are collected over a channel, since the
    // target map can't be merged per-thread.
    let (tx, rx) = flume::bounded::<(String, FileProbe)>(0);

    let walker = std::thread::spawn({
        let root = root.to_owned();
        let exclude = exclude.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        move || {
            WalkDir::new(&root)
                .into_iter()
                .filter_entry(|entry| {
                    let skip = entry.depth() == 1
                        && entry.file_type().is_dir()
                        && entry
                            .file_name()
                            .to_str()
                            .is_some_and(|name| exclude.iter().any(|ex| ex == name));
                    !skip
                })
                .par_bridge()
                .try_for_each(move |entry| -> Result<()> {
                    let entry = entry.context("walk directory")?;
                    let path = entry.path();
                    if !entry.file_type().is_file() {
                        trace!(?path, "skipped entry: not a file");
                        return Ok(());
                    }

                    let rel = path
                        .strip_prefix(root.as_std_path())
                        .with_context(|| format!("make {path:?} relative to {root:?}"))?;
                    let rel = Utf8PathBuf::try_from(rel.to_path_buf())
                        .context("read path as utf8")?
                        .as_str()
                        .replace('\\', "/");

                    let meta = entry.metadata().context("stat file")?;
                    let mtime = meta.modified().ok().and_then(|t| Timestamp::try_from(t).ok());
                    let hash = Blake3::from_file(
                        Utf8Path::from_path(path).ok_or_eyre("path is not utf8")?,
                    )
                    .context("hash file")?;
                    let probe = FileProbe {
                        hash,
                        size: meta.len(),
                        mtime,
                    };

                    // Only errors if the receiver has been dropped, which
                    // should never happen but we'll handle it just in case.
                    tx.send((rel, probe)).context("send probe to main thread")
                })
        }
    });

    // When the directory walk finishes, the senders all drop. This causes the
    // receiver channel to close, terminating the iterator.
    let files = rx
        .into_iter()
        .inspect(|(path, probe)| trace!(?path, ?probe, "scanned file"))
        .collect::<TreeScan>();

    // A panicked walker implies a broken invariant, so propagate the panic;
    // a fallible result is the walk failing, which aborts the scan.
    walker.join().expect("join walker thread").context("scan tree")?;

    trace!(files = files.len(), "scanned tree");
    Ok(files)
}

/// The four-way partition of a current tree against a previous one.
///
/// The partitions are disjoint and their union equals
/// `paths(current) ∪ paths(previous)`.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Paths present now but not previously.
    pub added: Vec<String>,
    /// Paths present in both, with differing fingerprints.
    pub modified: Vec<String>,
    /// Paths present previously but not now.
    pub deleted: Vec<String>,
    /// Paths present in both, with equal fingerprints.
    pub unchanged: Vec<String>,
}

impl ChangeSet {
    /// Report whether anything needs uploading.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.deleted.is_empty()
    }
}

/// Diff a current scan against the fingerprints of the previous deployment.
#[instrument(skip_all)]
pub fn diff_trees(current: &TreeScan, previous: &BTreeMap<String, Blake3>) -> ChangeSet {
    let mut set = ChangeSet::default();

    for (path, probe) in current {
        match previous.get(path) {
            None => set.added.push(path.clone()),
            Some(prev) if *prev == probe.hash => set.unchanged.push(path.clone()),
            Some(_) => set.modified.push(path.clone()),
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            set.deleted.push(path.clone());
        }
    }

    trace!(
        added = set.added.len(),
        modified = set.modified.len(),
        deleted = set.deleted.len(),
        unchanged = set.unchanged.len(),
        "diffed trees"
    );
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(root: &Utf8Path, rel: &str, content: &str) {
        let path = root.join(rel);
        #[allow(clippy::disallowed_methods)]
        {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
    }

    fn tmp() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn identical_bytes_hash_equal() {
        let (_dir, root) = tmp();
        write(&root, "a.txt", "same content");
        write(&root, "b.txt", "same content");

        let scan = scan_tree(&root, &[]).unwrap();
        assert_eq!(scan["a.txt"].hash, scan["b.txt"].hash);
        assert_eq!(scan["a.txt"].hash, Blake3::from_buffer("same content"));
        // 256-bit digest, lowercase hex.
        assert_eq!(scan["a.txt"].hash.as_str().len(), 64);
    }

    #[test_log::test]
    fn scan_normalizes_separators_and_skips_excluded() {
        let (_dir, root) = tmp();
        write(&root, "index.html", "<html>hi</html>");
        write(&root, "assets/style.css", "body{}");
        write(&root, ".walgo-cache/cache.db", "opaque");

        let scan = scan_tree(&root, &[".walgo-cache"]).unwrap();
        let paths = scan.keys().cloned().collect::<Vec<_>>();
        assert_eq!(paths, vec!["assets/style.css", "index.html"]);
        assert_eq!(scan["index.html"].size, 15);
    }

    #[test]
    fn untouched_tree_diffs_as_all_unchanged() {
        let (_dir, root) = tmp();
        write(&root, "index.html", "<html>hi</html>");
        write(&root, "style.css", "body{color:red}");

        let scan = scan_tree(&root, &[]).unwrap();
        let previous = scan
            .iter()
            .map(|(path, probe)| (path.clone(), probe.hash.clone()))
            .collect::<BTreeMap<_, _>>();

        let set = diff_trees(&scan, &previous);
        assert_eq!(set.unchanged.len(), scan.len());
        assert_eq!(set.added, Vec::<String>::new());
        assert_eq!(set.modified, Vec::<String>::new());
        assert_eq!(set.deleted, Vec::<String>::new());
        assert!(!set.has_changes());
    }

    #[test]
    fn partitions_are_disjoint_and_exhaustive() {
        let (_dir, root) = tmp();
        write(&root, "kept.html", "kept");
        write(&root, "changed.css", "new body");
        write(&root, "fresh.js", "let x;");

        let scan = scan_tree(&root, &[]).unwrap();
        let previous = BTreeMap::from([
            ("kept.html".to_string(), Blake3::from_buffer("kept")),
            ("changed.css".to_string(), Blake3::from_buffer("old body")),
            ("gone.txt".to_string(), Blake3::from_buffer("gone")),
        ]);

        let set = diff_trees(&scan, &previous);
        assert_eq!(set.added, vec!["fresh.js"]);
        assert_eq!(set.modified, vec!["changed.css"]);
        assert_eq!(set.deleted, vec!["gone.txt"]);
        assert_eq!(set.unchanged, vec!["kept.html"]);

        let mut union = [
            set.added.clone(),
            set.modified.clone(),
            set.deleted.clone(),
            set.unchanged.clone(),
        ]
        .concat();
        union.sort();
        let mut expected = scan
            .keys()
            .cloned()
            .chain(previous.keys().cloned())
            .collect::<Vec<_>>();
        expected.sort();
        expected.dedup();
        assert_eq!(union, expected);
    }
}
