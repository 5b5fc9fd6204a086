use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Args;
use colored::Colorize as _;
use tracing::instrument;

use color_eyre::{Result, eyre::Context as _};
use walgo::{
    cost::EstimateParams,
    deploy::{DeployObserver, DeployOptions, DeployPhase},
    network::Network,
    preflight,
    progress::PhaseBar,
    resources::SiteMetadata,
    site,
};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Site root containing walgo.yaml.
    #[arg(long, default_value = ".")]
    site: Utf8PathBuf,

    /// Built output to upload. Defaults to `<site>/public` when it exists,
    /// otherwise the site root itself.
    #[arg(long)]
    publish_dir: Option<Utf8PathBuf>,

    /// Target network.
    #[arg(long, value_enum, default_value_t = Network::Testnet)]
    network: Network,

    /// Storage duration in epochs. Overrides `walrus.epochs` in walgo.yaml.
    #[arg(long)]
    epochs: Option<u64>,

    /// Analyze changes and exit without uploading.
    #[arg(long)]
    dry_run: bool,

    /// Publish a fresh site object even if one is already recorded.
    #[arg(long)]
    force_new: bool,

    /// Brotli-compress text assets before upload. Overrides
    /// `walrus.compress` in walgo.yaml.
    #[arg(long)]
    compress: Option<bool>,

    /// Skip recording the deployment in the project ledger.
    #[arg(long)]
    no_save: bool,

    /// Emit one route per directory index in the resource manifest.
    #[arg(long)]
    directory_routes: bool,

    /// Print a cost estimate before deploying.
    #[arg(long)]
    estimate: bool,

    /// Human name for the site object.
    #[arg(long)]
    site_name: Option<String>,

    /// Site description for portals.
    #[arg(long)]
    description: Option<String>,

    /// Image URL for portals.
    #[arg(long)]
    image_url: Option<String>,

    /// Category tag for portals.
    #[arg(long)]
    category: Option<String>,

    /// Deadline for the site-builder invocation, in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

/// Bridges orchestrator phases onto the progress bar.
struct BarObserver(PhaseBar);

impl DeployObserver for BarObserver {
    fn on_phase(&self, _phase: DeployPhase, detail: &str) {
        self.0.advance(detail.to_string());
    }
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let publish_dir = resolve_publish_dir(&options);
    let config = site::load_walrus_section(&options.site).await?.unwrap_or_default();
    let epochs = options.epochs.or(config.epochs).unwrap_or(1);
    let compress = options.compress.or(config.compress).unwrap_or(false);

    let report = preflight::run(options.network).await.context("preflight checks")?;
    for warning in &report.warnings {
        eprintln!("{} {warning}", "warning:".yellow().bold());
    }

    if options.estimate {
        let size = directory_size(&publish_dir).await?;
        let estimate = walgo::cost::estimate_deploy(
            &EstimateParams::builder()
                .size_bytes(size)
                .epochs(epochs)
                .network(options.network)
                .build(),
        )
        .await;
        println!(
            "Estimated cost: {} ({:.6}-{:.6} WAL, {:.6}-{:.6} SUI)",
            estimate.fee_string().bold(),
            estimate.wal_min,
            estimate.wal_max,
            estimate.sui_min,
            estimate.sui_max,
        );
    }

    let metadata = build_metadata(&options);
    let deploy_options = DeployOptions::builder()
        .network(options.network)
        .epochs(epochs)
        .dry_run(options.dry_run)
        .force_new(options.force_new)
        .compress(compress)
        .save_project(!options.no_save)
        .directory_routes(options.directory_routes)
        .maybe_site_name(options.site_name.clone())
        .maybe_metadata(metadata)
        .maybe_deadline(options.timeout_secs.map(Duration::from_secs))
        .build();

    let observer = BarObserver(PhaseBar::new(11, "deploying"));
    let outcome = walgo::deploy::deploy(&options.site, &publish_dir, &deploy_options, &observer)
        .await?;
    observer.0.finish(if outcome.dry_run { "analyzed" } else { "deployed" });

    let plan = &outcome.plan;
    println!(
        "{} added, {} modified, {} deleted, {} unchanged ({} files total)",
        plan.change_set.added.len(),
        plan.change_set.modified.len(),
        plan.change_set.deleted.len(),
        plan.change_set.unchanged.len(),
        plan.total_files,
    );

    if outcome.dry_run {
        println!(
            "Dry run: {} of {} would upload.",
            humansize::format_size(plan.changed_size, humansize::BINARY),
            humansize::format_size(plan.total_size, humansize::BINARY),
        );
        return Ok(());
    }

    let object_id = outcome.object_id.as_deref().unwrap_or_default();
    let action = if outcome.is_update { "Updated" } else { "Published" };
    println!("{action} site object {}", object_id.green().bold());
    if let Some(fee) = &outcome.fee {
        println!("Recorded cost: {fee}");
    }
    if let Some(project) = &outcome.project {
        println!("Project #{} ({}) is {}", project.id, project.name, project.status);
    }
    Ok(())
}

fn resolve_publish_dir(options: &Options) -> Utf8PathBuf {
    if let Some(dir) = &options.publish_dir {
        return dir.clone();
    }
    let public = options.site.join("public");
    if public.is_dir() { public } else { options.site.clone() }
}

fn build_metadata(options: &Options) -> Option<SiteMetadata> {
    if options.description.is_none() && options.image_url.is_none() && options.category.is_none() {
        return None;
    }
    Some(SiteMetadata {
        description: options.description.clone(),
        image_url: options.image_url.clone(),
        category: options.category.clone(),
        ..SiteMetadata::default()
    })
}

async fn directory_size(dir: &Utf8PathBuf) -> Result<u64> {
    let (files, _) = walgo::fs::walk_files(dir).await?;
    let mut total = 0;
    for file in files {
        total += walgo::fs::file_size(&file).await.unwrap_or(0);
    }
    Ok(total)
}
