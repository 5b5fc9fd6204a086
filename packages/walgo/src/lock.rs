//! Per-site deployment locking.
//!
//! Two deployments against the same site root must not run concurrently: the
//! build cache is single-writer and the resource manifest is read-modify-write
//! with no cross-process coordination of its own. The lock lives under the
//! cache directory so that it travels with the cache it protects.
//!
//! Lock acquisition is best-effort POSIX advisory locking; on filesystems
//! without lock support the absence degrades to serialization-by-convention.

use std::{marker::PhantomData, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace};

use crate::cache::CACHE_DIR;

/// Shared lock file on the file system.
///
/// Lock the file with [`DeployLock::lock`]. Unlock it with
/// [`DeployLock::unlock`], or by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{path}")]
pub struct DeployLock<State> {
    state: PhantomData<State>,
    path: Utf8PathBuf,
    #[debug("<lockfile>")]
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl DeployLock<Unlocked> {
    /// Open the deploy lock for the provided site root.
    ///
    /// The lock file is created under the site's cache directory.
    #[instrument]
    pub async fn open(site_root: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<Self> {
        let path = site_root.as_ref().join(CACHE_DIR).join("deploy.lock");
        crate::fs::create_dir_all(path.parent().expect("lock path has parent")).await?;

        let (file, path) = spawn_blocking(move || {
            FsLockFile::open(path.as_std_path()).map(|file| (file, path))
        })
        .await
        .context("join task")?
        .context("open lock file")?;

        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile, blocking until it is acquired.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<DeployLock<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile can panic if the handle is already locked,
                // but we've set it up (using typestate) such that it's not
                // possible to lock an already locked handle.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(DeployLock {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .map(|lock: DeployLock<Locked>| {
            trace!(path = ?lock.path, "locked deploy lock");
            lock
        })
    }
}

impl DeployLock<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<DeployLock<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                // fslock::LockFile can panic if the handle is not locked,
                // but we've set it up (using typestate) such that it's not
                // possible to unlock a non-locked handle.
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(DeployLock {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .map(|lock: DeployLock<Unlocked>| {
            trace!(path = ?lock.path, "unlocked deploy lock");
            lock
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_unlock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let lock = DeployLock::open(&root).await.unwrap();
        let locked = lock.lock().await.unwrap();
        let unlocked = locked.unlock().await.unwrap();
        drop(unlocked);

        // Reacquirable after release.
        let lock = DeployLock::open(&root).await.unwrap();
        let _locked = lock.lock().await.unwrap();
    }
}
