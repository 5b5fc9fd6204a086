//! Deployment preparation and finalization against the build cache.
//!
//! `prepare_deployment` is the read side: scan the publish directory, diff it
//! against the latest manifest, and derive the totals the orchestrator plans
//! with. `finalize_deployment` is the write side: after a successful upload,
//! persist the whole current tree as the new latest manifest.

use std::collections::BTreeMap;

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace, warn};

use crate::{
    cache::{BuildCache, CACHE_DIR, FileRecord},
    hash::{ChangeSet, TreeScan, diff_trees, scan_tree},
};

/// Whether the orchestrator should update the existing site object or create
/// a new one.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub enum DeployPolicy {
    /// No previous object is known; publish a fresh site object.
    #[default]
    CreateNew,
    /// A previous object was resolved; update it in place.
    UpdateInPlace,
}

/// The inputs to the deployment orchestrator, derived from the change set
/// and file sizes.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// The four-way partition against the latest manifest.
    pub change_set: ChangeSet,
    /// Number of files in the current tree.
    pub total_files: usize,
    /// Total bytes in the current tree.
    pub total_size: u64,
    /// Bytes in added and modified files.
    pub changed_size: u64,
    /// True iff a latest manifest existed and at least one file is unchanged.
    pub incremental: bool,
    /// Update-in-place vs create-new-object. Defaults to create; the
    /// orchestrator overrides it after target resolution.
    pub policy: DeployPolicy,
}

impl DeploymentPlan {
    /// Build a plan from a scan and the previous fingerprints.
    fn from_diff(scan: &TreeScan, previous: Option<&BTreeMap<String, crate::hash::Blake3>>) -> Self {
        let change_set = match previous {
            Some(previous) => diff_trees(scan, previous),
            None => ChangeSet {
                added: scan.keys().cloned().collect(),
                ..ChangeSet::default()
            },
        };

        let total_size = scan.values().map(|probe| probe.size).sum();
        let changed_size = change_set
            .added
            .iter()
            .chain(change_set.modified.iter())
            .filter_map(|path| scan.get(path))
            .map(|probe| probe.size)
            .sum();

        Self {
            incremental: previous.is_some() && !change_set.unchanged.is_empty(),
            total_files: scan.len(),
            total_size,
            changed_size,
            change_set,
            policy: DeployPolicy::CreateNew,
        }
    }
}

/// Scan the publish directory and compute the plan against the latest cached
/// manifest.
///
/// A missing cache (`None`) means every file is treated as added; this is the
/// degraded mode the orchestrator uses when the cache store cannot be opened.
#[instrument(skip(cache))]
pub fn prepare_deployment(
    cache: Option<&BuildCache>,
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
) -> Result<(DeploymentPlan, TreeScan)> {
    let scan = scan_tree(publish_dir.as_ref(), &[CACHE_DIR]).context("scan publish directory")?;

    let previous = match cache {
        Some(cache) => match cache.latest_manifest().context("read latest manifest")? {
            Some(_) => Some(cache.fingerprints().context("read cached fingerprints")?),
            None => None,
        },
        None => None,
    };

    let plan = DeploymentPlan::from_diff(&scan, previous.as_ref());
    trace!(
        total_files = plan.total_files,
        total_size = plan.total_size,
        changed_size = plan.changed_size,
        incremental = plan.incremental,
        "prepared deployment"
    );
    Ok((plan, scan))
}

/// Persist the current tree as the new latest manifest.
///
/// Every path in the scan is written as a whole row; rows for paths that no
/// longer exist are removed. Blob identifiers parsed from the packager output
/// are attached where known. The whole write runs in one transaction so a
/// cancelled deployment never leaves a partial manifest marked latest.
///
/// After the write, the stored fingerprints are verified against the scan; a
/// mismatch means another writer raced us, and the write is retried once.
#[instrument(skip(cache, scan, blob_ids))]
pub fn finalize_deployment(
    cache: &mut BuildCache,
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    project_id: &str,
    deployment_id: &str,
    scan: &TreeScan,
    blob_ids: &BTreeMap<String, String>,
) -> Result<()> {
    let publish_dir = publish_dir.as_ref();

    for attempt in 0..2 {
        write_manifest(cache, publish_dir, project_id, deployment_id, scan, blob_ids)
            .context("write manifest")?;

        let stored = cache.fingerprints().context("verify written fingerprints")?;
        let expected = scan
            .iter()
            .map(|(path, probe)| (path.clone(), probe.hash.clone()))
            .collect::<BTreeMap<_, _>>();
        if stored == expected {
            return Ok(());
        }

        // Stale cache: another writer raced the finalize. One retry.
        warn!(attempt, "cache fingerprints stale after write, retrying");
    }

    color_eyre::eyre::bail!("cache store is stale after finalize retry")
}

fn write_manifest(
    cache: &mut BuildCache,
    publish_dir: &Utf8Path,
    project_id: &str,
    deployment_id: &str,
    scan: &TreeScan,
    blob_ids: &BTreeMap<String, String>,
) -> Result<()> {
    let now = jiff::Timestamp::now();
    let existing = cache.list_files().context("read existing rows")?;

    // Rows for paths that vanished since the previous manifest.
    let stale = existing
        .iter()
        .filter(|record| !scan.contains_key(&record.path))
        .map(|record| record.path.clone())
        .collect::<Vec<_>>();

    // Only rows that actually differ are rewritten, so write amplification
    // stays bounded by the number of changed files.
    let previous = existing
        .into_iter()
        .map(|record| (record.path.clone(), record))
        .collect::<BTreeMap<_, _>>();
    let records = scan
        .iter()
        .map(|(path, probe)| {
            // An unchanged file keeps its stored blob metadata when the
            // packager didn't re-emit it; its blob is still live remotely.
            let prev = previous
                .get(path)
                .filter(|record| record.hash == probe.hash);
            let (blob_id, last_deployed) = match blob_ids.get(path) {
                Some(blob_id) => (Some(blob_id.clone()), Some(now)),
                None => (
                    prev.and_then(|record| record.blob_id.clone()),
                    prev.and_then(|record| record.last_deployed),
                ),
            };
            FileRecord {
                path: path.clone(),
                hash: probe.hash.clone(),
                size: probe.size,
                mtime: probe.mtime,
                blob_id,
                last_deployed,
            }
        })
        .filter(|record| previous.get(&record.path) != Some(record))
        .collect::<Vec<_>>();

    cache
        .commit_manifest(publish_dir.as_str(), project_id, deployment_id, &records, &stale)
        .context("commit manifest")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    fn write(root: &Utf8Path, rel: &str, content: &str) {
        let path = root.join(rel);
        #[allow(clippy::disallowed_methods)]
        {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
    }

    fn remove(root: &Utf8Path, rel: &str) {
        #[allow(clippy::disallowed_methods)]
        std::fs::remove_file(root.join(rel)).unwrap();
    }

    fn site() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        write(&root, "index.html", "<html>hi</html>");
        write(&root, "style.css", "body{color:red}");
        (dir, root)
    }

    fn finalize(cache: &mut BuildCache, root: &Utf8Path) {
        let (_, scan) = prepare_deployment(Some(cache), root).unwrap();
        finalize_deployment(cache, root, "proj-1", "deploy-1", &scan, &BTreeMap::new()).unwrap();
    }

    #[test]
    fn first_deployment_is_all_new() {
        let (_dir, root) = site();
        let cache = BuildCache::in_memory().unwrap();

        let (plan, _) = prepare_deployment(Some(&cache), &root).unwrap();
        assert_eq!(plan.total_files, 2);
        assert_eq!(plan.change_set.added, vec!["index.html", "style.css"]);
        assert_eq!(plan.change_set.modified, Vec::<String>::new());
        assert_eq!(plan.change_set.deleted, Vec::<String>::new());
        assert_eq!(plan.change_set.unchanged, Vec::<String>::new());
        assert!(!plan.incremental);
        assert_eq!(plan.total_size, 30);
        assert_eq!(plan.changed_size, plan.total_size);
    }

    #[test]
    fn incremental_with_one_modified() {
        let (_dir, root) = site();
        let mut cache = BuildCache::in_memory().unwrap();
        finalize(&mut cache, &root);

        let updated = "<html>updated</html>";
        write(&root, "index.html", updated);

        let (plan, _) = prepare_deployment(Some(&cache), &root).unwrap();
        assert_eq!(plan.change_set.modified, vec!["index.html"]);
        assert_eq!(plan.change_set.unchanged, vec!["style.css"]);
        assert!(plan.incremental);
        assert_eq!(plan.changed_size, updated.len() as u64);
        assert_eq!(plan.total_size, updated.len() as u64 + 15);
    }

    #[test]
    fn repeat_without_changes_is_all_unchanged() {
        let (_dir, root) = site();
        let mut cache = BuildCache::in_memory().unwrap();
        finalize(&mut cache, &root);

        let (plan, scan) = prepare_deployment(Some(&cache), &root).unwrap();
        assert_eq!(plan.change_set.unchanged, vec!["index.html", "style.css"]);
        assert_eq!(plan.change_set.added, Vec::<String>::new());
        assert_eq!(plan.change_set.modified, Vec::<String>::new());
        assert_eq!(plan.change_set.deleted, Vec::<String>::new());
        assert_eq!(plan.changed_size, 0);
        assert_eq!(plan.change_set.unchanged.len(), scan.len());
    }

    #[test]
    fn deletion_is_detected() {
        let (_dir, root) = site();
        remove(&root, "style.css");
        write(&root, "about.html", "<html>about</html>");
        let mut cache = BuildCache::in_memory().unwrap();
        finalize(&mut cache, &root);

        remove(&root, "about.html");
        let (plan, _) = prepare_deployment(Some(&cache), &root).unwrap();
        assert_eq!(plan.change_set.deleted, vec!["about.html"]);
        assert_eq!(plan.change_set.unchanged, vec!["index.html"]);
        assert_eq!(plan.total_files, 1);
    }

    #[test]
    fn missing_cache_degrades_to_all_added() {
        let (_dir, root) = site();
        let (plan, _) = prepare_deployment(None, &root).unwrap();
        assert_eq!(plan.change_set.added.len(), 2);
        assert!(!plan.incremental);
    }

    #[test]
    fn finalize_attaches_blob_ids_and_prunes_stale_rows() {
        let (_dir, root) = site();
        let mut cache = BuildCache::in_memory().unwrap();
        finalize(&mut cache, &root);

        remove(&root, "style.css");
        let (_, scan) = prepare_deployment(Some(&cache), &root).unwrap();
        let blobs = BTreeMap::from([("index.html".to_string(), "0xfeed".to_string())]);
        finalize_deployment(&mut cache, &root, "proj-1", "deploy-2", &scan, &blobs).unwrap();

        let index = cache.get_file("index.html").unwrap().unwrap();
        assert_eq!(index.blob_id.as_deref(), Some("0xfeed"));
        assert!(index.last_deployed.is_some());
        assert_eq!(cache.get_file("style.css").unwrap(), None);

        // Finalize then prepare with no intervening changes: everything
        // unchanged, nothing to upload.
        let (plan, _) = prepare_deployment(Some(&cache), &root).unwrap();
        assert_eq!(plan.change_set.unchanged.len(), plan.total_files);
        assert_eq!(plan.changed_size, 0);
    }
}
