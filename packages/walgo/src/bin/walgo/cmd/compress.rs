use camino::Utf8PathBuf;
use clap::Args;
use colored::Colorize as _;
use tracing::instrument;

use color_eyre::Result;
use walgo::compress;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Directory to compress.
    #[arg(default_value = ".")]
    dir: Utf8PathBuf,

    /// Replace originals instead of writing `.br` siblings.
    #[arg(long)]
    in_place: bool,
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let report = if options.in_place {
        compress::compress_in_place(&options.dir).await?
    } else {
        compress::compress_directory(&options.dir).await?
    };

    if report.files.is_empty() {
        println!("Nothing eligible for compression.");
        return Ok(());
    }

    for file in &report.files {
        let marker = if file.smaller { "✓".green() } else { "·".dimmed() };
        println!(
            "  {marker} {:<48} {:>10} -> {:>10} ({:.0}%)",
            file.path,
            humansize::format_size(file.original, humansize::BINARY),
            humansize::format_size(file.compressed, humansize::BINARY),
            file.savings * 100.0,
        );
    }

    println!(
        "{} files, {} -> {} ({:.1}% saved)",
        report.files.len(),
        humansize::format_size(report.total_original, humansize::BINARY),
        humansize::format_size(report.total_after, humansize::BINARY),
        report.savings() * 100.0,
    );
    Ok(())
}
