use clap::{Args, Subcommand};
use colored::Colorize as _;
use inquire::Confirm;
use tracing::instrument;

use color_eyre::{Result, eyre::OptionExt as _};
use walgo::{
    ledger::{Ledger, ProjectFilter, ProjectStatus},
    network::Network,
};

#[derive(Clone, Subcommand, Debug)]
pub enum Command {
    /// List projects in the ledger.
    List(ListOptions),
    /// Show one project and its deployment history.
    Show(ShowOptions),
    /// Archive a project. Archived projects are never reactivated.
    Archive(ArchiveOptions),
}

#[derive(Clone, Args, Debug)]
pub struct ListOptions {
    /// Only projects with this status.
    #[arg(long)]
    status: Option<String>,

    /// Only projects on this network.
    #[arg(long, value_enum)]
    network: Option<Network>,
}

#[derive(Clone, Args, Debug)]
pub struct ShowOptions {
    /// Project id.
    id: i64,
}

#[derive(Clone, Args, Debug)]
pub struct ArchiveOptions {
    /// Project id.
    id: i64,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
}

#[instrument]
pub fn list(options: ListOptions) -> Result<()> {
    let ledger = Ledger::open()?;
    let filter = ProjectFilter {
        status: options
            .status
            .as_deref()
            .map(|status| status.parse::<ProjectStatus>())
            .transpose()?,
        network: options.network,
    };

    let projects = ledger.list_projects(&filter)?;
    if projects.is_empty() {
        println!("No projects recorded.");
        return Ok(());
    }

    for project in projects {
        let object = project.object_id.as_deref().unwrap_or("-");
        println!(
            "#{:<4} {:<24} {:<8} {:<8} {object}",
            project.id,
            project.name,
            project.status.to_string(),
            project.network.to_string(),
        );
    }
    Ok(())
}

#[instrument]
pub fn show(options: ShowOptions) -> Result<()> {
    let ledger = Ledger::open()?;
    let project = ledger
        .get_project(options.id)?
        .ok_or_eyre("no project with that id")?;

    println!("{} (#{})", project.name.bold(), project.id);
    println!("  status:      {}", project.status);
    println!("  network:     {}", project.network);
    println!("  source:      {}", project.source_path);
    println!("  object id:   {}", project.object_id.as_deref().unwrap_or("-"));
    println!("  epochs:      {}", project.epochs);
    if let Some(fee) = &project.last_fee {
        println!("  last fee:    {fee}");
    }
    if let Some(deployed) = project.last_deployed_at {
        println!("  deployed at: {deployed}");
    }

    let records = ledger.list_deployments(project.id)?;
    if !records.is_empty() {
        println!("deployments:");
        for record in records {
            let marker = if record.success { "✓".green() } else { "✗".red() };
            println!(
                "  {marker} {} {} ({} epochs) {}",
                record.created_at,
                record.object_id,
                record.epochs,
                record.fee.as_deref().unwrap_or(""),
            );
        }
    }
    Ok(())
}

#[instrument]
pub fn archive(options: ArchiveOptions) -> Result<()> {
    let ledger = Ledger::open()?;
    let project = ledger
        .get_project(options.id)?
        .ok_or_eyre("no project with that id")?;

    if !options.yes {
        println!(
            "{}",
            format!("Archiving {:?} cannot be undone.", project.name).on_red()
        );
        let confirmed = Confirm::new("Are you sure you want to proceed?")
            .with_default(false)
            .prompt()?;
        if !confirmed {
            return Ok(());
        }
    }

    ledger.archive_project(project.id)?;
    println!("Archived #{} ({}).", project.id, project.name);
    Ok(())
}
