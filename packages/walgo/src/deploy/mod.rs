//! The deployment orchestrator.
//!
//! One public operation, [`deploy`], drives the full lifecycle: preflight
//! facts are gathered by the caller, then the phases here run strictly in
//! order. Cross-phase communication is only through values returned by one
//! phase and passed to the next; the only shared state is the per-site
//! deploy lock and the stores the phases own.
//!
//! A failed run is safe to re-run: uploaded blobs are content-addressed, so
//! the only repeated work is cheap metadata.

pub mod failure;
mod object_id;
mod output;

pub use failure::FailureKind;
pub use object_id::validate_object_id;
pub use output::{ParsedOutput, parse_output};

use std::{collections::BTreeSet, time::Duration};

use bon::Builder;
use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    Result, Section,
    eyre::{Context, eyre},
};
use serde_json::Value;
use strum::Display;
use tracing::{debug, instrument, warn};

use crate::{
    cache::{BuildCache, CACHE_DIR, DeployPolicy, DeploymentPlan, finalize_deployment,
            prepare_deployment},
    compress,
    fs,
    hash::scan_tree,
    ledger::{DeploymentOutcome, Ledger, Project},
    lock::DeployLock,
    network::Network,
    proc,
    resources::{self, ResourceOptions, SiteMetadata},
    site,
    toolchain::{self, Tool},
};

/// Default deadline for the packager invocation when the caller supplies
/// none.
const DEFAULT_DEPLOY_DEADLINE: Duration = Duration::from_secs(1800);

/// The ordered phases of a deployment.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum DeployPhase {
    SizeScan,
    CacheInit,
    ChangeAnalysis,
    TargetResolution,
    MetadataWriteBack,
    Invocation,
    OutputParsing,
    CostReconciliation,
    CacheFinalize,
    LocalPersistence,
    LedgerUpsert,
}

/// Receives progress events as phases begin.
pub trait DeployObserver: Send + Sync {
    fn on_phase(&self, phase: DeployPhase, detail: &str) {
        let _ = (phase, detail);
    }
}

/// An observer that ignores everything.
pub struct NullObserver;

impl DeployObserver for NullObserver {}

/// Caller-facing deployment options.
#[derive(Clone, Debug, Builder)]
pub struct DeployOptions {
    #[builder(default)]
    pub network: Network,
    /// Storage duration to purchase, in epochs.
    #[builder(default = 1)]
    pub epochs: u64,
    /// Stop after change analysis; nothing is uploaded or written.
    #[builder(default)]
    pub dry_run: bool,
    /// Skip target resolution and publish a fresh site object.
    #[builder(default)]
    pub force_new: bool,
    /// Brotli-compress text assets in place before upload.
    #[builder(default)]
    pub compress: bool,
    /// Record the deployment in the project ledger.
    #[builder(default = true)]
    pub save_project: bool,
    /// Emit per-directory routes in the resource manifest.
    #[builder(default)]
    pub directory_routes: bool,
    pub site_name: Option<String>,
    pub metadata: Option<SiteMetadata>,
    /// Deadline for the packager invocation.
    pub deadline: Option<Duration>,
    /// Override the packager binary; resolved from the toolchain otherwise.
    pub site_builder_bin: Option<Utf8PathBuf>,
    /// Override the ledger location; the per-user default otherwise.
    pub ledger_path: Option<Utf8PathBuf>,
}

/// What a deployment produced.
#[derive(Debug)]
pub struct DeployOutcome {
    /// The deployed site object id. Absent on dry runs.
    pub object_id: Option<String>,
    /// Whether an existing object was updated rather than created.
    pub is_update: bool,
    pub plan: DeploymentPlan,
    /// The recorded fee string: actual when knowable, estimated otherwise.
    pub fee: Option<String>,
    pub dry_run: bool,
    /// The ledger row, when project-saving was requested and succeeded.
    pub project: Option<Project>,
}

/// Deploy a built site.
///
/// `site_root` is the project directory (carrying `walgo.yaml` and the build
/// cache); `publish_dir` is the finished static output that actually ships.
/// They may be the same directory.
#[instrument(skip(options, observer))]
pub async fn deploy(
    site_root: impl AsRef<Utf8Path> + std::fmt::Debug,
    publish_dir: impl AsRef<Utf8Path> + std::fmt::Debug,
    options: &DeployOptions,
    observer: &dyn DeployObserver,
) -> Result<DeployOutcome> {
    let site_root = site_root.as_ref();
    let publish_dir = publish_dir.as_ref();

    // No two deployments against the same site root may run concurrently.
    // Acquisition is best-effort: a filesystem without lock support degrades
    // to serialization-by-convention.
    let _lock = match DeployLock::open(site_root).await {
        Ok(lock) => match lock.lock().await {
            Ok(locked) => Some(locked),
            Err(err) => {
                warn!(?err, "could not acquire deploy lock, continuing unlocked");
                None
            }
        },
        Err(err) => {
            warn!(?err, "could not open deploy lock, continuing unlocked");
            None
        }
    };

    // Phase 1: size scan. Walk errors are collected, not fatal.
    observer.on_phase(DeployPhase::SizeScan, "scanning publish directory");
    let (files, walk_errors) = fs::walk_files(publish_dir).await?;
    for error in &walk_errors {
        warn!(%error, "walk error during size scan");
    }
    let mut total_size = 0u64;
    for file in &files {
        match fs::file_size(file).await {
            Ok(size) => total_size += size,
            Err(err) => warn!(?err, "could not stat file during size scan"),
        }
    }
    debug!(files = files.len(), total_size, "size scan complete");

    // Phase 2: cache init. The cache is advisory; open failure degrades to
    // treating every file as added.
    observer.on_phase(DeployPhase::CacheInit, "opening build cache");
    let mut cache = match BuildCache::open(site_root) {
        Ok(cache) => Some(cache),
        Err(err) => {
            warn!(?err, "build cache unavailable, treating all files as new");
            None
        }
    };

    // Phase 3: change analysis.
    observer.on_phase(DeployPhase::ChangeAnalysis, "computing change set");
    let (mut plan, scan) =
        prepare_deployment(cache.as_ref(), publish_dir).context("prepare deployment")?;

    if options.dry_run {
        return Ok(DeployOutcome {
            object_id: None,
            is_update: false,
            plan,
            fee: None,
            dry_run: true,
            project: None,
        });
    }

    // Phase 4: target resolution. First hit wins: site config, then the
    // resource manifest, then the ledger. Pinned order; do not reorder.
    let existing = if options.force_new {
        None
    } else {
        observer.on_phase(DeployPhase::TargetResolution, "resolving existing site object");
        resolve_target(site_root, publish_dir, &options.ledger_path).await?
    };
    let is_update = existing.is_some();
    if is_update {
        plan.policy = DeployPolicy::UpdateInPlace;
    }

    // Compression runs between change analysis and the manifest write so the
    // manifest's Content-Encoding headers describe the bytes that ship.
    let compressed = if options.compress {
        let report = compress::compress_in_place(publish_dir)
            .await
            .context("compress site assets")?;
        debug!(
            replaced = report.replaced().len(),
            savings = report.savings(),
            "compression pass complete"
        );
        report.replaced()
    } else {
        BTreeSet::new()
    };

    // Phase 5: metadata write-back. Must precede invocation so the merged
    // manifest ships inside the upload.
    observer.on_phase(DeployPhase::MetadataWriteBack, "writing resource manifest");
    write_back_manifest(publish_dir, options, existing.as_deref(), &compressed).await?;

    // Phase 6: invocation.
    observer.on_phase(DeployPhase::Invocation, "invoking site-builder");
    let site_builder = match &options.site_builder_bin {
        Some(binary) => binary.clone(),
        None => toolchain::resolve(Tool::SiteBuilder).ok_or_else(|| {
            eyre!("site-builder is not installed")
                .suggestion("install the toolchain with `walgo doctor install`")
        })?,
    };

    let mut args = vec!["--context".to_string(), options.network.context().to_string()];
    match &existing {
        Some(object_id) => {
            args.extend([
                "update".to_string(),
                publish_dir.to_string(),
                object_id.clone(),
            ]);
        }
        None => {
            args.extend(["publish".to_string(), publish_dir.to_string()]);
        }
    }
    args.extend(["--epochs".to_string(), options.epochs.to_string()]);
    let deadline = options.deadline.unwrap_or(DEFAULT_DEPLOY_DEADLINE);
    let invocation = proc::invoke_output(&site_builder, args, deadline)
        .await
        .context("invoke site-builder")?;

    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&invocation.stdout),
        String::from_utf8_lossy(&invocation.stderr),
    );
    if !invocation.status.success() {
        return Err(failure::classified_error(&combined, invocation.status));
    }

    // Phase 7: output parsing.
    observer.on_phase(DeployPhase::OutputParsing, "parsing site-builder output");
    let parsed = parse_output(&combined);
    let object_id = match parsed.object_id.or_else(|| existing.clone()) {
        Some(object_id) => validate_object_id(&object_id)?.to_string(),
        None => {
            return Err(eyre!("site-builder output contains no site object id")
                .suggestion(
                    "the tool may have changed its output format; \
                     re-run with WALGO_LOG=debug and inspect the captured output",
                )
                .section(combined));
        }
    };
    debug!(%object_id, blobs = parsed.blob_ids.len(), "parsed deployment result");

    // Phase 8: cost reconciliation, best effort.
    observer.on_phase(DeployPhase::CostReconciliation, "reconciling costs");
    let fee = reconcile_costs(options.network, plan.changed_size.max(1), options.epochs).await;

    // Phase 9: cache finalize. A write failure after a successful upload is
    // fatal: the cache would lie about what is deployed.
    if let Some(cache) = cache.as_mut() {
        observer.on_phase(DeployPhase::CacheFinalize, "finalizing build cache");
        // Compression rewrote file bytes, so the fingerprints that describe
        // the uploaded content come from a fresh scan.
        let final_scan = if options.compress {
            scan_tree(publish_dir, &[CACHE_DIR]).context("rescan after compression")?
        } else {
            scan
        };
        finalize_deployment(
            cache,
            publish_dir,
            &object_id,
            &jiff::Timestamp::now().to_string(),
            &final_scan,
            &parsed.blob_ids,
        )
        .context("finalize cache after successful upload")?;
    }

    // Phase 10: local persistence of the object id.
    observer.on_phase(DeployPhase::LocalPersistence, "persisting object id");
    resources::write_object_id(publish_dir, &object_id).await?;
    site::write_object_id(site_root, &object_id).await?;

    // Phase 11: ledger upsert. Losing the ledger row is annoying but not
    // worth failing a finished deployment over.
    let project = if options.save_project {
        observer.on_phase(DeployPhase::LedgerUpsert, "recording project");
        match open_ledger(&options.ledger_path) {
            Ok(mut ledger) => {
                let outcome = DeploymentOutcome::builder()
                    .source_path(site_root.to_string())
                    .object_id(object_id.clone())
                    .network(options.network)
                    .epochs(options.epochs)
                    .success(true)
                    .maybe_fee(fee.clone())
                    .maybe_name(options.site_name.clone())
                    .maybe_description(
                        options.metadata.as_ref().and_then(|m| m.description.clone()),
                    )
                    .maybe_image_url(options.metadata.as_ref().and_then(|m| m.image_url.clone()))
                    .maybe_category(options.metadata.as_ref().and_then(|m| m.category.clone()))
                    .build();
                match ledger.upsert_deployment(&outcome) {
                    Ok(project) => Some(project),
                    Err(err) => {
                        warn!(?err, "could not record project in ledger");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(?err, "could not open project ledger");
                None
            }
        }
    } else {
        None
    };

    Ok(DeployOutcome {
        object_id: Some(object_id),
        is_update,
        plan,
        fee,
        dry_run: false,
        project,
    })
}

/// Resolve the existing site object for an update.
///
/// Lookup order is pinned: the site configuration is canonical, then the
/// resource manifest on disk, then the project ledger keyed by source path.
/// Any hit is validated before use; an invalid stored id is fatal.
async fn resolve_target(
    site_root: &Utf8Path,
    publish_dir: &Utf8Path,
    ledger_path: &Option<Utf8PathBuf>,
) -> Result<Option<String>> {
    if let Some(section) = site::load_walrus_section(site_root).await?
        && let Some(id) = section.project_id.filter(|id| !id.trim().is_empty())
    {
        validate_object_id(&id).context("object id in site config")?;
        debug!(%id, "resolved target from site config");
        return Ok(Some(id));
    }

    if let Some(manifest) = resources::load(publish_dir).await?
        && let Some(id) = manifest.object_id.filter(|id| !id.trim().is_empty())
    {
        validate_object_id(&id).context("object id in resource manifest")?;
        debug!(%id, "resolved target from resource manifest");
        return Ok(Some(id));
    }

    match open_ledger(ledger_path) {
        Ok(ledger) => {
            if let Some(project) = ledger.get_project_by_source_path(site_root.as_str())?
                && let Some(id) = project.object_id.filter(|id| !id.trim().is_empty())
            {
                validate_object_id(&id).context("object id in project ledger")?;
                debug!(%id, "resolved target from project ledger");
                return Ok(Some(id));
            }
        }
        Err(err) => warn!(?err, "ledger unavailable during target resolution"),
    }

    Ok(None)
}

fn open_ledger(ledger_path: &Option<Utf8PathBuf>) -> Result<Ledger> {
    match ledger_path {
        Some(path) => Ledger::open_at(path),
        None => Ledger::open(),
    }
}

/// Merge the generated manifest into the on-disk document, preserving keys
/// this engine doesn't own.
async fn write_back_manifest(
    publish_dir: &Utf8Path,
    options: &DeployOptions,
    object_id: Option<&str>,
    compressed: &BTreeSet<String>,
) -> Result<()> {
    let resource_options = ResourceOptions::builder()
        .directory_routes(options.directory_routes)
        .maybe_metadata(options.metadata.clone())
        .maybe_site_name(options.site_name.clone())
        .maybe_object_id(object_id.map(|id| id.to_string()))
        .build();
    let generated = resources::generate(publish_dir, &resource_options, compressed)
        .await
        .context("generate resource manifest")?;

    let headers = serde_json::to_value(&generated.headers).expect("headers serialize");
    let ignore = serde_json::to_value(&generated.ignore).expect("ignore serializes");
    let routes = serde_json::to_value(&generated.routes).expect("routes serialize");
    let metadata = generated
        .metadata
        .as_ref()
        .map(|metadata| serde_json::to_value(metadata).expect("metadata serializes"));
    let site_name = generated.site_name.clone();
    let object_id = generated.object_id.clone();

    resources::merge_update(publish_dir, move |map| {
        map.insert("headers".to_string(), headers);
        map.insert("ignore".to_string(), ignore);
        map.insert("routes".to_string(), routes);
        if let Some(metadata) = metadata {
            map.insert("metadata".to_string(), metadata);
        }
        if let Some(site_name) = site_name {
            map.insert("site_name".to_string(), Value::String(site_name));
        }
        if let Some(object_id) = object_id {
            map.insert("object_id".to_string(), Value::String(object_id));
        }
    })
    .await
    .context("write resource manifest")
}

/// Record what the deployment cost.
///
/// The actual on-chain cost is knowable only by querying the signer's most
/// recent transaction; when that isn't possible the deterministic synthesis
/// over fallback constants is recorded instead.
async fn reconcile_costs(network: Network, changed_size: u64, epochs: u64) -> Option<String> {
    if let Some(actual) = actual_gas_cost(network, changed_size, epochs).await {
        return Some(actual);
    }
    Some(Ledger::estimate_gas_fee(network, changed_size, epochs))
}

/// Best-effort query of the signer wallet's most recent transaction cost.
async fn actual_gas_cost(network: Network, changed_size: u64, epochs: u64) -> Option<String> {
    let sui = toolchain::resolve(Tool::Sui)?;
    let address = proc::invoke_checked(&sui, ["client", "active-address"], Duration::from_secs(30))
        .await
        .map(|output| proc::first_stdout_line(&output))
        .ok()
        .filter(|address| !address.is_empty())?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "suix_queryTransactionBlocks",
        "params": [
            {"filter": {"FromAddress": address}, "options": {"showEffects": true}},
            null,
            1,
            true,
        ],
    });
    let response = client
        .post(network.rpc_url())
        .json(&body)
        .send()
        .await
        .ok()?
        .json::<Value>()
        .await
        .ok()?;

    let gas = response
        .pointer("/result/data/0/effects/gasUsed")?
        .clone();
    let read = |key: &str| -> i64 {
        gas.get(key)
            .and_then(Value::as_str)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0)
    };
    let mist = read("computationCost") + read("storageCost") - read("storageRebate");
    debug!(mist, "reconciled actual gas cost");
    // WAL spent isn't visible in gas effects; record the actual SUI with the
    // estimated WAL component.
    let wal = Ledger::estimate_gas_fee(network, changed_size, epochs);
    let wal_part = wal.split(" WAL").next().unwrap_or("0.000000");
    Some(format!("{wal_part} WAL + {:.6} SUI", mist as f64 / 1e9))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ProjectStatus;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    const SITE_ID: &str = "0x5f8a2cbb4b94157db1e43b4e4a1b6ca6f9a8d21bd0274ad1ae0ccf4ba66a2c5d";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        ledger_path: Utf8PathBuf,
        args_file: Utf8PathBuf,
        builder: Utf8PathBuf,
    }

    /// A fake site-builder that records its arguments and prints a
    /// parseable result.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let args_file = root.join("invocation-args.txt");
        let builder = root.join("fake-site-builder.sh");

        #[allow(clippy::disallowed_methods)]
        {
            std::fs::write(root.join("index.html"), "<html>hi</html>").unwrap();
            std::fs::write(root.join("style.css"), "body{color:red}").unwrap();
            std::fs::write(
                &builder,
                format!("#!/bin/sh\necho \"$@\" > {args_file}\necho \"Site object ID: {SITE_ID}\"\n"),
            )
            .unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&builder, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
        }

        Fixture {
            ledger_path: root.join("ledger.db"),
            _dir: dir,
            root,
            args_file,
            builder,
        }
    }

    fn options(fixture: &Fixture) -> DeployOptions {
        DeployOptions::builder()
            .site_builder_bin(fixture.builder.clone())
            .ledger_path(fixture.ledger_path.clone())
            .epochs(3)
            .build()
    }

    #[derive(Default)]
    struct RecordingObserver(Mutex<Vec<DeployPhase>>);

    impl DeployObserver for RecordingObserver {
        fn on_phase(&self, phase: DeployPhase, _detail: &str) {
            self.0.lock().unwrap().push(phase);
        }
    }

    #[tokio::test]
    async fn dry_run_analyzes_without_invoking() {
        let fixture = fixture();
        let options = DeployOptions::builder()
            .site_builder_bin(fixture.builder.clone())
            .ledger_path(fixture.ledger_path.clone())
            .dry_run(true)
            .build();

        let outcome = deploy(&fixture.root, &fixture.root, &options, &NullObserver)
            .await
            .unwrap();

        assert!(outcome.dry_run);
        assert_eq!(outcome.object_id, None);
        assert_eq!(outcome.plan.total_files, 3); // two assets + the fake tool
        assert!(!fixture.args_file.exists(), "dry run must not invoke the packager");
    }

    #[test_log::test(tokio::test)]
    async fn first_deployment_publishes_and_persists_everywhere() {
        let fixture = fixture();
        let observer = RecordingObserver::default();

        let outcome = deploy(&fixture.root, &fixture.root, &options(&fixture), &observer)
            .await
            .unwrap();

        assert_eq!(outcome.object_id.as_deref(), Some(SITE_ID));
        assert!(!outcome.is_update);
        assert!(outcome.fee.is_some());

        // The packager saw a publish (not update) with explicit context.
        let args = fs::read_buffered_utf8(&fixture.args_file).await.unwrap().unwrap();
        assert!(args.contains("--context testnet"), "args: {args}");
        assert!(args.contains("publish"), "args: {args}");
        assert!(args.contains("--epochs 3"), "args: {args}");

        // Phase 10: both persistence targets carry the id.
        let section = site::load_walrus_section(&fixture.root).await.unwrap().unwrap();
        assert_eq!(section.project_id.as_deref(), Some(SITE_ID));
        let manifest = resources::load(&fixture.root).await.unwrap().unwrap();
        assert_eq!(manifest.object_id.as_deref(), Some(SITE_ID));

        // Phase 9: the cache marks a latest manifest.
        let cache = BuildCache::open(&fixture.root).unwrap();
        assert!(cache.latest_manifest().unwrap().is_some());

        // Phase 11: the ledger has an active project with one record.
        let project = outcome.project.unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        let ledger = Ledger::open_at(&fixture.ledger_path).unwrap();
        assert_eq!(ledger.list_deployments(project.id).unwrap().len(), 1);

        // Phases ran in order.
        let phases = observer.0.lock().unwrap().clone();
        let expected = [
            DeployPhase::SizeScan,
            DeployPhase::CacheInit,
            DeployPhase::ChangeAnalysis,
            DeployPhase::TargetResolution,
            DeployPhase::MetadataWriteBack,
            DeployPhase::Invocation,
            DeployPhase::OutputParsing,
            DeployPhase::CostReconciliation,
            DeployPhase::CacheFinalize,
            DeployPhase::LocalPersistence,
            DeployPhase::LedgerUpsert,
        ];
        assert_eq!(phases, expected);
    }

    #[tokio::test]
    async fn second_deployment_is_an_update_with_the_stored_id() {
        let fixture = fixture();
        deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();

        let outcome = deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();
        assert!(outcome.is_update);
        assert_eq!(outcome.plan.policy, DeployPolicy::UpdateInPlace);

        let args = fs::read_buffered_utf8(&fixture.args_file).await.unwrap().unwrap();
        assert!(args.contains("update"), "args: {args}");
        assert!(args.contains(SITE_ID), "args: {args}");
    }

    #[tokio::test]
    async fn force_new_skips_target_resolution() {
        let fixture = fixture();
        deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();

        let options = DeployOptions::builder()
            .site_builder_bin(fixture.builder.clone())
            .ledger_path(fixture.ledger_path.clone())
            .force_new(true)
            .build();
        let outcome = deploy(&fixture.root, &fixture.root, &options, &NullObserver)
            .await
            .unwrap();

        assert!(!outcome.is_update);
        let args = fs::read_buffered_utf8(&fixture.args_file).await.unwrap().unwrap();
        assert!(args.contains("publish"), "args: {args}");
    }

    #[tokio::test]
    async fn site_config_wins_target_resolution() {
        let fixture = fixture();
        let config_id = format!("0x{}", "1".repeat(64));
        let manifest_id = format!("0x{}", "2".repeat(64));

        site::write_object_id(&fixture.root, &config_id).await.unwrap();
        resources::write_object_id(&fixture.root, &manifest_id).await.unwrap();

        deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();

        let args = fs::read_buffered_utf8(&fixture.args_file).await.unwrap().unwrap();
        assert!(args.contains(&config_id), "site config must win: {args}");
        assert!(!args.contains(&manifest_id), "manifest id must lose: {args}");
    }

    #[tokio::test]
    async fn manifest_id_is_second_in_precedence() {
        let fixture = fixture();
        let manifest_id = format!("0x{}", "2".repeat(64));
        resources::write_object_id(&fixture.root, &manifest_id).await.unwrap();

        deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();

        let args = fs::read_buffered_utf8(&fixture.args_file).await.unwrap().unwrap();
        assert!(args.contains("update"), "args: {args}");
        assert!(args.contains(&manifest_id), "args: {args}");
    }

    #[tokio::test]
    async fn hostile_stored_id_fails_before_any_subprocess() {
        let fixture = fixture();
        fs::write(
            fixture.root.join(site::SITE_CONFIG_FILE),
            "walrus:\n  project_id: \"0xABC; curl evil.com\"\n",
        )
        .await
        .unwrap();

        let result = deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver).await;
        assert!(result.is_err());
        assert!(
            !fixture.args_file.exists(),
            "the packager must never see an unvalidated id"
        );
    }

    #[tokio::test]
    async fn incremental_plan_survives_into_outcome() {
        let fixture = fixture();
        deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();

        fs::write(fixture.root.join("index.html"), "<html>updated</html>").await.unwrap();
        let outcome = deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap();

        assert!(outcome.plan.incremental);
        assert!(outcome
            .plan
            .change_set
            .modified
            .contains(&"index.html".to_string()));
    }

    #[tokio::test]
    async fn failed_packager_output_is_classified() {
        let fixture = fixture();
        #[allow(clippy::disallowed_methods)]
        {
            std::fs::write(
                &fixture.builder,
                "#!/bin/sh\necho 'Error: insufficient funds for gas' >&2\nexit 1\n",
            )
            .unwrap();
        }

        let err = deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("InsufficientFunds"), "got: {rendered}");
    }

    #[tokio::test]
    async fn missing_object_id_in_output_is_fatal() {
        let fixture = fixture();
        #[allow(clippy::disallowed_methods)]
        {
            std::fs::write(&fixture.builder, "#!/bin/sh\necho 'all done, no id'\n").unwrap();
        }

        let err = deploy(&fixture.root, &fixture.root, &options(&fixture), &NullObserver)
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("no site object id"));
    }
}
