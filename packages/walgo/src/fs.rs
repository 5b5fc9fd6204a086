//! Filesystem operations tailored to `walgo`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.

#![allow(
    clippy::disallowed_methods,
    reason = "The methods are disallowed elsewhere, but we need them here!"
)]

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use tap::{Pipe, TapFallible, TryConv};
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};

/// Determine the per-user walgo data directory (`~/.walgo`).
///
/// This can fail if the user has no home directory,
/// or if the home directory cannot be accessed.
#[instrument]
pub fn user_data_path() -> Result<Utf8PathBuf> {
    homedir::my_home()
        .context("get user home directory")?
        .ok_or_eyre("user has no home directory")?
        .try_conv::<Utf8PathBuf>()
        .context("user home directory is not utf8")?
        .join(".walgo")
        .pipe(Ok)
}

/// Determine the per-user local bin directory where tooling is installed.
///
/// - POSIX: `$HOME/.local/bin`
/// - Windows: `%USERPROFILE%\.local\bin`
#[instrument]
pub fn user_local_bin_path() -> Result<Utf8PathBuf> {
    homedir::my_home()
        .context("get user home directory")?
        .ok_or_eyre("user has no home directory")?
        .try_conv::<Utf8PathBuf>()
        .context("user home directory is not utf8")?
        .join(".local")
        .join("bin")
        .pipe(Ok)
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Buffer the file content from disk.
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_buffered(path: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk.
/// Unlike [`read_buffered`], this function returns an error if the file
/// doesn't exist.
#[instrument]
pub async fn must_read_buffered(path: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Buffer the file content from disk and parse it as UTF8.
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_buffered_utf8(
    path: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk, creating parent directories
/// as needed.
#[instrument(skip(content))]
pub async fn write(
    path: impl AsRef<Utf8Path> + std::fmt::Debug,
    content: impl AsRef<[u8]>,
) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await.context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Remove a file.
#[instrument]
pub async fn remove_file(path: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("remove file: {path:?}"))
        .tap_ok(|_| trace!(?path, "remove file"))
}

/// Rename a file, overwriting the destination if it already exists.
#[instrument]
pub async fn rename(
    src: impl AsRef<Utf8Path> + std::fmt::Debug,
    dst: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename file: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename file"))
}

/// Report the size in bytes of the file at the provided path.
#[instrument]
pub async fn file_size(path: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<u64> {
    let path = path.as_ref();
    tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat file: {path:?}"))
        .map(|meta| meta.len())
}

/// Walk regular files in a directory recursively, collecting their paths.
///
/// Only regular files are emitted; symbolic links and directories are not.
/// Per-file walk errors are collected rather than aborting the walk, so that
/// callers can decide whether they are fatal.
#[instrument]
pub async fn walk_files(
    root: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<(Vec<Utf8PathBuf>, Vec<String>)> {
    let root = root.as_ref().to_owned();
    spawn_blocking(move || {
        let mut files = Vec::new();
        let mut errors = Vec::new();
        for entry in walkdir::WalkDir::new(&root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.path().to_path_buf().try_conv::<Utf8PathBuf>() {
                Ok(path) => files.push(path),
                Err(err) => errors.push(format!("non-utf8 path: {err}")),
            }
        }
        trace!(?root, files = files.len(), errors = errors.len(), "walk files");
        (files, errors)
    })
    .await
    .context("join walk task")
}
