use camino::Utf8PathBuf;
use clap::{Args, Subcommand};
use colored::Colorize as _;
use inquire::Confirm;
use tracing::instrument;

use color_eyre::{Result, eyre::Context as _};
use walgo::cache::BuildCache;

#[derive(Clone, Subcommand, Debug)]
pub enum Command {
    /// Show what the build cache knows about the last deployment.
    Show(ShowOptions),
    /// Delete every cached fingerprint and manifest.
    Reset(ResetOptions),
}

#[derive(Clone, Args, Debug)]
pub struct ShowOptions {
    /// Site root containing the cache.
    #[arg(long, default_value = ".")]
    site: Utf8PathBuf,
}

#[derive(Clone, Args, Debug)]
pub struct ResetOptions {
    /// Site root containing the cache.
    #[arg(long, default_value = ".")]
    site: Utf8PathBuf,

    /// Skip all confirmation prompts.
    #[arg(short, long)]
    yes: bool,
}

#[instrument]
pub fn show(options: ShowOptions) -> Result<()> {
    let cache = BuildCache::open(&options.site).context("open build cache")?;

    match cache.latest_manifest()? {
        Some(manifest) => {
            println!(
                "Latest manifest: deployment {} for project {} at {}",
                manifest.deployment_id.bold(),
                manifest.project_id,
                manifest.created_at,
            );
        }
        None => println!("No deployment has been finalized yet."),
    }

    let files = cache.list_files()?;
    println!("{} cached file records.", files.len());
    for record in files.iter().take(20) {
        let blob = record.blob_id.as_deref().unwrap_or("-");
        let short = &record.hash.as_str()[..12];
        println!("  {} {} {blob}", short.dimmed(), record.path);
    }
    if files.len() > 20 {
        println!("  ... and {} more", files.len() - 20);
    }
    Ok(())
}

#[instrument]
pub fn reset(options: ResetOptions) -> Result<()> {
    if !options.yes {
        println!(
            "{}",
            "WARNING: the next deployment will re-examine every file".on_red()
        );
        let confirmed = Confirm::new("Are you sure you want to reset the cache?")
            .with_default(false)
            .prompt()?;
        if !confirmed {
            return Ok(());
        }
    }

    let mut cache = BuildCache::open(&options.site).context("open build cache")?;
    cache.clear().context("clear build cache")?;
    println!("Done!");
    Ok(())
}
