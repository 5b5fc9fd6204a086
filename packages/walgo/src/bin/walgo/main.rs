//! The binary entrypoint for `walgo`, the Walrus static-site deployer.

use std::path::PathBuf;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context};
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

// Command modules stay private: anything the engine needs lives in the
// walgo library, and unreferenced CLI code should warn as dead.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "walgo",
    about = "Deploy static sites to Walrus decentralized storage",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Emit flamegraph profiling data
    #[arg(short, long, hide(true))]
    profile: Option<PathBuf>,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Deploy a built site to Walrus
    Deploy(cmd::deploy::Options),

    /// Estimate deployment cost without deploying
    Estimate(cmd::estimate::Options),

    /// Show what would change on the next deployment
    Status(cmd::status::Options),

    /// Inspect and install the external toolchain
    #[clap(subcommand)]
    Doctor(cmd::doctor::Command),

    /// Manage deployed projects
    #[clap(subcommand)]
    Projects(cmd::projects::Command),

    /// Manage the build cache
    #[clap(subcommand)]
    Cache(cmd::cache::Command),

    /// Compress site assets with Brotli
    Compress(cmd::compress::Options),
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let (logger, flame_guard) = log::make_logger(std::io::stderr, top.profile.clone(), top.color)?;
    logger.init();

    let result = match top.command {
        Command::Deploy(opts) => cmd::deploy::exec(opts).await,
        Command::Estimate(opts) => cmd::estimate::exec(opts).await,
        Command::Status(opts) => cmd::status::exec(opts).await,
        Command::Doctor(command) => match command {
            cmd::doctor::Command::Check => cmd::doctor::check().await,
            cmd::doctor::Command::Install(opts) => cmd::doctor::install(opts).await,
        },
        Command::Projects(command) => match command {
            cmd::projects::Command::List(opts) => cmd::projects::list(opts),
            cmd::projects::Command::Show(opts) => cmd::projects::show(opts),
            cmd::projects::Command::Archive(opts) => cmd::projects::archive(opts),
        },
        Command::Cache(command) => match command {
            cmd::cache::Command::Show(opts) => cmd::cache::show(opts),
            cmd::cache::Command::Reset(opts) => cmd::cache::reset(opts),
        },
        Command::Compress(opts) => cmd::compress::exec(opts).await,
    };

    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame_guard")?;
    }

    result
}
