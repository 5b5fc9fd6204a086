use camino::Utf8PathBuf;
use clap::Args;
use colored::Colorize as _;
use tracing::instrument;

use color_eyre::{Result, eyre::Context as _};
use walgo::cache::BuildCache;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Site root containing walgo.yaml.
    #[arg(long, default_value = ".")]
    site: Utf8PathBuf,

    /// Built output to compare. Defaults to `<site>/public` when it exists,
    /// otherwise the site root.
    #[arg(long)]
    publish_dir: Option<Utf8PathBuf>,

    /// List every changed path instead of the summary counts.
    #[arg(short, long)]
    verbose: bool,
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let publish_dir = options.publish_dir.clone().unwrap_or_else(|| {
        let public = options.site.join("public");
        if public.is_dir() { public } else { options.site.clone() }
    });

    let cache = match BuildCache::open(&options.site) {
        Ok(cache) => Some(cache),
        Err(err) => {
            eprintln!(
                "{} build cache unavailable ({err:#}); everything reads as new",
                "warning:".yellow().bold()
            );
            None
        }
    };

    let (plan, _) = walgo::cache::prepare_deployment(cache.as_ref(), &publish_dir)
        .context("analyze publish directory")?;
    let set = &plan.change_set;

    if !plan.incremental && set.added.len() == plan.total_files {
        println!("No previous deployment; all {} files are new.", plan.total_files);
    } else if !set.has_changes() {
        println!("Up to date: {} files unchanged.", set.unchanged.len());
        return Ok(());
    }

    println!(
        "{} {} added, {} modified, {} deleted, {} unchanged",
        "changes:".bold(),
        set.added.len().to_string().green(),
        set.modified.len().to_string().yellow(),
        set.deleted.len().to_string().red(),
        set.unchanged.len(),
    );
    println!(
        "Next deployment uploads {} of {}.",
        humansize::format_size(plan.changed_size, humansize::BINARY),
        humansize::format_size(plan.total_size, humansize::BINARY),
    );

    if options.verbose {
        for path in &set.added {
            println!("  {} {path}", "A".green());
        }
        for path in &set.modified {
            println!("  {} {path}", "M".yellow());
        }
        for path in &set.deleted {
            println!("  {} {path}", "D".red());
        }
    }
    Ok(())
}
