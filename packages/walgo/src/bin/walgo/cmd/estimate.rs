use camino::Utf8PathBuf;
use clap::Args;
use colored::Colorize as _;
use tracing::instrument;

use color_eyre::{Result, eyre::Context as _};
use walgo::{
    cache::BuildCache,
    cost::{self, EstimateParams},
    network::Network,
};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Site root containing walgo.yaml.
    #[arg(long, default_value = ".")]
    site: Utf8PathBuf,

    /// Built output that would be uploaded. Defaults to `<site>/public`
    /// when it exists, otherwise the site root.
    #[arg(long)]
    publish_dir: Option<Utf8PathBuf>,

    /// Target network.
    #[arg(long, value_enum, default_value_t = Network::Testnet)]
    network: Network,

    /// Storage duration in epochs.
    #[arg(long, default_value_t = 1)]
    epochs: u64,

    /// Estimate only the incremental update (changed bytes + new files)
    /// against the build cache.
    #[arg(long)]
    update: bool,

    /// Estimate the gas for destroying the site object instead.
    #[arg(long)]
    destroy: bool,

    /// Gas price override in MIST. Zero uses the live price or fallback.
    #[arg(long)]
    gas_price: Option<u64>,
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    if options.destroy {
        let estimate = cost::estimate_destroy(options.network, options.gas_price).await;
        println!(
            "Destroy gas: {} SUI ({:.6}-{:.6})",
            format!("{:.6}", estimate.total_sui).bold(),
            estimate.sui_min,
            estimate.sui_max,
        );
        return Ok(());
    }

    let publish_dir = options.publish_dir.clone().unwrap_or_else(|| {
        let public = options.site.join("public");
        if public.is_dir() { public } else { options.site.clone() }
    });

    let cache = BuildCache::open(&options.site).ok();
    let (plan, _) = walgo::cache::prepare_deployment(cache.as_ref(), &publish_dir)
        .context("analyze publish directory")?;

    let (size, files, label) = if options.update {
        let new_files = plan.change_set.added.len() as u64;
        (plan.changed_size, new_files.max(1), "update")
    } else {
        (plan.total_size, plan.total_files as u64, "deployment")
    };

    let params = EstimateParams::builder()
        .size_bytes(size)
        .epochs(options.epochs)
        .file_count(files)
        .network(options.network)
        .maybe_gas_price_override(options.gas_price)
        .build();
    let estimate = if options.update {
        cost::estimate_update(&params).await
    } else {
        cost::estimate_deploy(&params).await
    };

    println!(
        "Estimated {label} cost on {} for {} across {files} files, {} epochs:",
        options.network,
        humansize::format_size(size, humansize::BINARY),
        options.epochs,
    );
    println!(
        "  WAL: {} (range {:.6} - {:.6})",
        format!("{:.6}", estimate.total_wal).bold(),
        estimate.wal_min,
        estimate.wal_max,
    );
    println!(
        "  SUI: {} (range {:.6} - {:.6})",
        format!("{:.6}", estimate.total_sui).bold(),
        estimate.sui_min,
        estimate.sui_max,
    );
    println!(
        "  Projected encoded size: {} (gas price {} MIST)",
        humansize::format_size(estimate.encoded_bytes, humansize::BINARY),
        estimate.gas_price,
    );
    Ok(())
}
