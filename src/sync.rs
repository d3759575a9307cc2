use std::fmt;

use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{SyncError, SyncResult};
use crate::mapping::{map_issue, MappingPolicy};
use crate::model::snyk::{Organization, Project};
use crate::model::work_item::WorkItemState;
use crate::providers::{IssueSource, WorkItemTracker};

/// What the orchestrator needs from the resolved run configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub org_id: String,
    /// Restrict the run to these Snyk project ids; empty means all.
    pub project_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFailure {
    pub project: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub organization: String,
    pub projects_processed: usize,
    pub failed_projects: Vec<ProjectFailure>,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Issues dropped because their mapped payload was rejected.
    pub invalid: usize,
    /// Issues left out by policy (ignored, patched, below threshold).
    pub filtered: usize,
    /// Payloads mapped during a dry run.
    pub planned: usize,
}

impl RunSummary {
    fn record(&mut self, state: WorkItemState) {
        match state {
            WorkItemState::Created => self.created += 1,
            WorkItemState::Updated => self.updated += 1,
            WorkItemState::Unchanged => self.unchanged += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_projects.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Organization: {}", self.organization)?;
        writeln!(
            f,
            "Projects: {} processed, {} failed",
            self.projects_processed,
            self.failed_projects.len()
        )?;
        write!(
            f,
            "Work items: {} created, {} updated, {} unchanged",
            self.created, self.updated, self.unchanged
        )?;
        if self.planned > 0 {
            write!(f, ", {} planned (dry run)", self.planned)?;
        }
        write!(
            f,
            "\nIssues skipped: {} invalid, {} filtered",
            self.invalid, self.filtered
        )?;
        for failure in &self.failed_projects {
            write!(f, "\n  failed: {} ({})", failure.project, failure.error)?;
        }
        Ok(())
    }
}

/// Fetch, map and push every selected project of one organization.
///
/// Organization and project-list failures abort the run, as do
/// authorization and configuration errors anywhere. Any other failure
/// inside a project is recorded and the next project is processed.
/// With no tracker the run maps issues but writes nothing.
pub async fn run(
    options: &RunOptions,
    source: &dyn IssueSource,
    tracker: Option<&dyn WorkItemTracker>,
    policy: &MappingPolicy,
) -> SyncResult<RunSummary> {
    let span = info_span!("sync", org = %options.org_id);
    run_organization(options, source, tracker, policy)
        .instrument(span)
        .await
}

async fn run_organization(
    options: &RunOptions,
    source: &dyn IssueSource,
    tracker: Option<&dyn WorkItemTracker>,
    policy: &MappingPolicy,
) -> SyncResult<RunSummary> {
    info!(
        source = source.name(),
        tracker = tracker.map(|t| t.name()).unwrap_or("none"),
        "starting sync"
    );
    let org = source.get_organization(&options.org_id).await?;
    info!(name = %org.name, "resolved organization");

    let mut summary = RunSummary {
        organization: org.name.clone(),
        ..RunSummary::default()
    };

    let projects = select_projects(source, &org, options, &mut summary).await?;
    info!(count = projects.len(), "projects selected");

    for project in &projects {
        let project_span = info_span!("project", id = %project.id, name = %project.name);
        let result = sync_project(project, source, tracker, policy, &mut summary)
            .instrument(project_span)
            .await;
        match result {
            Ok(()) => summary.projects_processed += 1,
            Err(err) if err.is_fatal() => {
                error!(project = %project.name, error = %err, "aborting run");
                return Err(err);
            }
            Err(err) => {
                warn!(project = %project.name, error = %err, "project failed, continuing");
                summary.failed_projects.push(ProjectFailure {
                    project: project.name.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        created = summary.created,
        updated = summary.updated,
        unchanged = summary.unchanged,
        failed = summary.failed_projects.len(),
        "run finished"
    );
    Ok(summary)
}

async fn select_projects(
    source: &dyn IssueSource,
    org: &Organization,
    options: &RunOptions,
    summary: &mut RunSummary,
) -> SyncResult<Vec<Project>> {
    let all = source.list_projects(org).await?;
    if options.project_ids.is_empty() {
        return Ok(all);
    }

    let mut selected = Vec::new();
    for id in &options.project_ids {
        match all.iter().find(|p| &p.id == id) {
            Some(project) => selected.push(project.clone()),
            None => {
                let err = SyncError::NotFound(format!("Snyk project '{id}' in {}", org.name));
                warn!(project = %id, "requested project not in organization");
                summary.failed_projects.push(ProjectFailure {
                    project: id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(selected)
}

async fn sync_project(
    project: &Project,
    source: &dyn IssueSource,
    tracker: Option<&dyn WorkItemTracker>,
    policy: &MappingPolicy,
    summary: &mut RunSummary,
) -> SyncResult<()> {
    let issues = source.list_issues(project).await?;
    info!(count = issues.len(), "fetched issues");

    for issue in &issues {
        if let Some(reason) = policy.skip_reason(issue) {
            tracing::debug!(issue = %issue.id, ?reason, "filtered");
            summary.filtered += 1;
            continue;
        }

        let payload = match map_issue(issue, project, policy) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(issue = %issue.id, error = %err, "skipping issue");
                summary.invalid += 1;
                continue;
            }
        };

        let Some(tracker) = tracker else {
            info!(
                key = %payload.dedup_key,
                title = %payload.fields.title,
                priority = payload.fields.priority,
                "would upsert work item"
            );
            summary.planned += 1;
            continue;
        };

        match tracker.upsert_work_item(&payload).await {
            Ok(result) => {
                info!(id = result.item.id, state = ?result.state, key = %payload.dedup_key, "work item synced");
                summary.record(result.state);
            }
            Err(SyncError::Validation(msg)) => {
                warn!(issue = %issue.id, error = %msg, "tracker rejected work item");
                summary.invalid += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
