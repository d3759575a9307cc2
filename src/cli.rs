use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::config::{self, Overrides, RunConfig};
use crate::providers::azure_boards::AzureBoardsClient;
use crate::providers::snyk::SnykClient;
use crate::providers::WorkItemTracker;
use crate::sync::{self, RunOptions};

/// CLI tool to convert Snyk issues to Azure Boards issues.
///
/// Given a Snyk organization, get the issues of its projects and send them
/// to Azure Boards. Needs a Snyk token either as the SNYK_TOKEN environment
/// variable or via --token.
#[derive(Debug, Parser)]
#[command(name = "snyk-to-azure-boards", disable_version_flag = true)]
pub struct Args {
    /// Organization ID of the org you want to pull projects from.
    pub org_id: Option<String>,

    /// Snyk API token (falls back to SNYK_TOKEN).
    #[arg(short = 't', long = "token")]
    pub token: Option<String>,

    /// Only sync these Snyk project IDs. Repeatable.
    #[arg(short = 'p', long = "project")]
    pub projects: Vec<String>,

    /// Azure DevOps organization (falls back to AZURE_DEVOPS_ORG).
    #[arg(long)]
    pub azure_org: Option<String>,

    /// Azure DevOps project (falls back to AZURE_DEVOPS_PROJECT).
    #[arg(long)]
    pub azure_project: Option<String>,

    /// Azure DevOps personal access token (falls back to AZURE_DEVOPS_PAT).
    #[arg(long)]
    pub azure_token: Option<String>,

    /// Map issues and log the work items without writing to Azure Boards.
    #[arg(long)]
    pub dry_run: bool,

    /// Config file (default: ~/.snyk-to-azure-boards/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Prints the version of the snyk-to-azure-boards package.
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(config::default_config_path)
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            org_id: self.org_id.clone(),
            snyk_token: self.token.clone(),
            azure_org: self.azure_org.clone(),
            azure_project: self.azure_project.clone(),
            azure_token: self.azure_token.clone(),
            project_ids: self.projects.clone(),
            dry_run: self.dry_run,
        }
    }
}

pub fn version_line() -> String {
    format!("snyk-to-azure-boards version: {}", env!("CARGO_PKG_VERSION"))
}

/// Build the adapters from the resolved config and run the sync.
pub async fn execute(config: RunConfig) -> Result<()> {
    let source = SnykClient::new(&config.snyk, &config.http)?;

    let tracker = match (&config.azure, config.dry_run) {
        (Some(azure), false) => Some(AzureBoardsClient::new(azure, &config.http)?),
        _ => None,
    };
    if tracker.is_none() {
        info!("dry run: nothing will be written to Azure Boards");
    }

    let options = RunOptions {
        org_id: config.org_id.clone(),
        project_ids: config.project_ids.clone(),
    };

    let summary = sync::run(
        &options,
        &source,
        tracker.as_ref().map(|t| t as &dyn WorkItemTracker),
        &config.mapping,
    )
    .await
    .with_context(|| format!("Sync failed for organization {}", config.org_id))?;

    if summary.has_failures() {
        warn!(
            failed = summary.failed_projects.len(),
            "some projects could not be synced"
        );
    }
    println!("{summary}");
    Ok(())
}
