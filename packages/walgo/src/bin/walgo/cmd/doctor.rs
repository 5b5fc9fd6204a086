use clap::{Args, Subcommand};
use colored::Colorize as _;
use inquire::Confirm;
use tracing::instrument;

use color_eyre::{Result, eyre::Context as _};
use walgo::{
    network::Network,
    toolchain::{self, Tool},
};

#[derive(Clone, Subcommand, Debug)]
pub enum Command {
    /// Report which tools are installed and their versions.
    Check,
    /// Install the deployment toolchain through suiup.
    Install(InstallOptions),
}

#[derive(Clone, Args, Debug)]
pub struct InstallOptions {
    /// Network whose release channel the walrus and sui CLIs install from.
    #[arg(long, value_enum, default_value_t = Network::Testnet)]
    network: Network,

    /// Skip all confirmation prompts.
    #[arg(short, long)]
    yes: bool,
}

#[instrument]
pub async fn check() -> Result<()> {
    for status in toolchain::status_all().await {
        let name = status.tool.binary_name();
        match (&status.path, &status.version) {
            (Some(path), Some(version)) => {
                println!("{} {name} {version} ({path})", "ok".green().bold());
            }
            (Some(path), None) => {
                println!("{} {name} at {path} (version unknown)", "ok".green().bold());
            }
            (None, _) => {
                let marker = if status.tool.required() {
                    "missing".red().bold()
                } else {
                    "absent".yellow().bold()
                };
                println!("{marker} {name}: {}", status.tool.description());
            }
        }

        if status.installed()
            && let Ok(Some(check)) = toolchain::check_latest(status.tool).await
            && check.outdated
        {
            println!(
                "  {} {name} {} is behind the latest release {}",
                "note:".yellow(),
                check.installed,
                check.latest,
            );
        }
    }
    Ok(())
}

#[instrument]
pub async fn install(options: InstallOptions) -> Result<()> {
    let tools = [Tool::SiteBuilder, Tool::Walrus, Tool::Sui];

    if !options.yes {
        println!(
            "This installs {} from the {} channel into your local bin.",
            tools.map(|t| t.binary_name()).join(", "),
            options.network,
        );
        let confirmed = Confirm::new("Proceed with installation?")
            .with_default(true)
            .prompt()?;
        if !confirmed {
            return Ok(());
        }
    }

    println!("Installing toolchain...");
    toolchain::install(options.network, &tools)
        .await
        .context("install toolchain")?;

    println!("Done! Current state:");
    check().await
}
