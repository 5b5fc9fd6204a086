//! Brotli compression of text-bearing site assets.
//!
//! The Walrus gateway serves pre-compressed bytes as-is when the manifest
//! carries a `Content-Encoding: br` header, so compressing before upload
//! shrinks both the stored blobs and the transfer. Only files whose
//! compressed form is strictly smaller are touched.

use std::collections::BTreeSet;

use async_compression::{Level, tokio::bufread::BrotliEncoder};
use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace, warn};

use crate::{cache::CACHE_DIR, fs, resources::RESOURCES_FILE};

/// Extensions that carry text and benefit from compression.
const TEXT_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "mjs", "json", "xml", "svg", "txt", "md", "webmanifest", "rss",
    "atom", "ics", "csv",
];

/// Extensions that are already compressed; never recompressed even if a
/// caller lists them as text-bearing.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "br", "gz", "zip", "png", "jpg", "jpeg", "gif", "webp", "avif", "woff", "woff2", "mp4", "webm",
    "mp3", "pdf",
];

/// The outcome of compressing one file.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileCompression {
    /// Path relative to the compressed directory, forward-slash normalized.
    pub path: String,
    /// Size before compression.
    pub original: u64,
    /// Size of the Brotli output, whether or not it was kept.
    pub compressed: u64,
    /// Fraction of bytes saved (0 when the output was not smaller).
    pub savings: f64,
    /// Whether the compressed form was strictly smaller and therefore kept.
    pub smaller: bool,
}

/// Aggregate outcome of a compression pass.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct CompressionReport {
    pub files: Vec<FileCompression>,
    /// Total bytes across eligible files before compression.
    pub total_original: u64,
    /// Total bytes after the pass (kept outputs plus untouched originals).
    pub total_after: u64,
}

impl CompressionReport {
    /// Relative paths whose originals were replaced by a smaller variant.
    ///
    /// This is the exact set the resource manifest tags with
    /// `Content-Encoding: br`.
    pub fn replaced(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .filter(|file| file.smaller)
            .map(|file| file.path.clone())
            .collect()
    }

    /// Overall savings fraction across eligible files.
    pub fn savings(&self) -> f64 {
        if self.total_original == 0 {
            0.0
        } else {
            1.0 - self.total_after as f64 / self.total_original as f64
        }
    }
}

/// Whether a path is eligible for compression.
fn eligible(path: &Utf8Path) -> bool {
    let Some(ext) = path.extension().map(|ext| ext.to_ascii_lowercase()) else {
        return false;
    };
    TEXT_EXTENSIONS.contains(&ext.as_str()) && !COMPRESSED_EXTENSIONS.contains(&ext.as_str())
}

/// Compress one buffer with Brotli at maximum quality.
///
/// Site assets are compressed once and served many times, so the slowest,
/// densest quality level is the right trade.
async fn brotli(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BrotliEncoder::with_quality(bytes, Level::Precise(11));
    let mut out = Vec::with_capacity(bytes.len() / 2);
    encoder.read_to_end(&mut out).await.context("brotli encode")?;
    Ok(out)
}

/// How a compression pass disposes of its output.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Disposition {
    /// Write a `<path>.br` sibling next to the original.
    Sibling,
    /// Replace the original file's bytes.
    InPlace,
}

/// Walk a tree and write `<path>.br` siblings for every eligible file whose
/// compressed form is strictly smaller.
#[instrument]
pub async fn compress_directory(
    dir: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<CompressionReport> {
    run(dir.as_ref(), Disposition::Sibling).await
}

/// Walk a tree and replace every eligible file with its compressed form,
/// when that form is strictly smaller.
///
/// The returned report's [`CompressionReport::replaced`] set feeds the
/// resource manifest's `Content-Encoding` headers.
#[instrument]
pub async fn compress_in_place(
    dir: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<CompressionReport> {
    run(dir.as_ref(), Disposition::InPlace).await
}

async fn run(dir: &Utf8Path, disposition: Disposition) -> Result<CompressionReport> {
    let (files, errors) = fs::walk_files(dir).await?;
    for error in &errors {
        warn!(%error, "walk error during compression");
    }

    let mut report = CompressionReport::default();
    for file in files {
        let rel = file
            .strip_prefix(dir)
            .with_context(|| format!("make {file:?} relative to {dir:?}"))?
            .as_str()
            .replace('\\', "/");

        // The manifest must stay readable by the packager, and the cache is
        // opaque local state.
        if rel == RESOURCES_FILE || rel.starts_with(&format!("{CACHE_DIR}/")) {
            continue;
        }
        if !eligible(&file) {
            continue;
        }

        let bytes = fs::must_read_buffered(&file).await?;
        let compressed = brotli(&bytes).await?;
        let smaller = compressed.len() < bytes.len();

        if smaller {
            match disposition {
                Disposition::Sibling => {
                    fs::write(format!("{file}.br"), &compressed).await?;
                }
                Disposition::InPlace => {
                    fs::write(&file, &compressed).await?;
                }
            }
        }

        let entry = FileCompression {
            path: rel,
            original: bytes.len() as u64,
            compressed: compressed.len() as u64,
            savings: if smaller {
                1.0 - compressed.len() as f64 / bytes.len().max(1) as f64
            } else {
                0.0
            },
            smaller,
        };
        trace!(?entry, "compressed file");

        report.total_original += entry.original;
        report.total_after += if smaller { entry.compressed } else { entry.original };
        report.files.push(entry);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    fn site() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    // Large repetitive content compresses extremely well, tiny content does
    // not; both cases are exercised below.
    fn repetitive() -> String {
        "<div class=\"card\">lorem ipsum dolor sit amet</div>\n".repeat(200)
    }

    #[tokio::test]
    async fn sibling_mode_writes_br_only_when_smaller() {
        let (_dir, root) = site();
        fs::write(root.join("index.html"), repetitive()).await.unwrap();
        fs::write(root.join("tiny.css"), "p{}").await.unwrap();
        fs::write(root.join("photo.png"), vec![0u8; 4096]).await.unwrap();

        let report = compress_directory(&root).await.unwrap();

        assert!(fs::read_buffered(root.join("index.html.br")).await.unwrap().is_some());
        // Tiny files don't shrink; no sibling.
        assert_eq!(fs::read_buffered(root.join("tiny.css.br")).await.unwrap(), None);
        // Binary formats aren't eligible at all.
        assert_eq!(fs::read_buffered(root.join("photo.png.br")).await.unwrap(), None);
        assert_eq!(report.files.len(), 2);

        // Originals are untouched in sibling mode.
        let original = fs::must_read_buffered(root.join("index.html")).await.unwrap();
        let entry = report.files.iter().find(|f| f.path == "index.html").unwrap();
        assert_eq!(original.len() as u64, entry.original);
        assert!(entry.smaller);
    }

    #[tokio::test]
    async fn in_place_mode_replaces_and_reports() {
        let (_dir, root) = site();
        fs::write(root.join("index.html"), repetitive()).await.unwrap();
        fs::write(root.join("tiny.css"), "p{}").await.unwrap();

        let report = compress_in_place(&root).await.unwrap();

        let replaced = report.replaced();
        assert!(replaced.contains("index.html"));
        assert!(!replaced.contains("tiny.css"));

        let after = fs::must_read_buffered(root.join("index.html")).await.unwrap();
        assert!((after.len() as u64) < repetitive().len() as u64);
        assert!(report.savings() > 0.0);

        // The unshrinkable file keeps its original bytes.
        let tiny = fs::must_read_buffered(root.join("tiny.css")).await.unwrap();
        assert_eq!(tiny, b"p{}");
    }

    #[tokio::test]
    async fn manifest_and_cache_are_never_compressed() {
        let (_dir, root) = site();
        let manifest = format!("{{\"routes\": {{}}, \"pad\": \"{}\"}}", "x".repeat(2000));
        fs::write(root.join(RESOURCES_FILE), &manifest).await.unwrap();
        fs::write(root.join(".walgo-cache/state.json"), repetitive()).await.unwrap();

        let report = compress_in_place(&root).await.unwrap();
        assert_eq!(report.files.len(), 0);

        let untouched = fs::must_read_buffered(root.join(RESOURCES_FILE)).await.unwrap();
        assert_eq!(untouched, manifest.as_bytes());
    }
}
