use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{build_http_client, read_json, IssueSource};
use crate::config::{HttpSettings, SnykSettings};
use crate::error::{SyncError, SyncResult};
use crate::model::snyk::{Issue, Organization, Project, Severity};
use crate::util::retry::{with_retry, RetryPolicy};

const SERVICE: &str = "Snyk";

pub struct SnykClient {
    base_url: String,
    auth_header: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl SnykClient {
    pub fn new(settings: &SnykSettings, http: &HttpSettings) -> SyncResult<Self> {
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth_header: format!("token {}", settings.token),
            client: build_http_client(http.timeout, SERVICE)?,
            retry: http.retry.clone(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, what: &str) -> SyncResult<T> {
        let url = format!("{}/{path}", self.base_url);
        with_retry(&self.retry, what, || {
            let req = self
                .client
                .get(&url)
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json");
            async move {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| SyncError::from_reqwest(SERVICE, e))?;
                read_json(SERVICE, resp).await
            }
        })
        .await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        what: &str,
    ) -> SyncResult<T> {
        let url = format!("{}/{path}", self.base_url);
        with_retry(&self.retry, what, || {
            let req = self
                .client
                .post(&url)
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json")
                .json(body);
            async move {
                let resp = req
                    .send()
                    .await
                    .map_err(|e| SyncError::from_reqwest(SERVICE, e))?;
                read_json(SERVICE, resp).await
            }
        })
        .await
    }
}

#[derive(Deserialize)]
struct OrgsResponse {
    #[serde(default)]
    orgs: Vec<SnykOrg>,
}

#[derive(Deserialize)]
struct SnykOrg {
    id: String,
    name: String,
    slug: Option<String>,
}

#[derive(Deserialize)]
struct ProjectsResponse {
    #[serde(default)]
    projects: Vec<SnykProject>,
}

#[derive(Deserialize)]
struct SnykProject {
    id: String,
    name: String,
    #[serde(rename = "type")]
    project_type: Option<String>,
}

#[derive(Deserialize)]
struct IssuesResponse {
    #[serde(default)]
    issues: Vec<AggregatedIssue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedIssue {
    id: String,
    pkg_name: Option<String>,
    #[serde(default)]
    pkg_versions: Vec<String>,
    issue_data: IssueData,
    fix_info: Option<FixInfo>,
    introduced_date: Option<String>,
    #[serde(default)]
    is_ignored: bool,
    #[serde(default)]
    is_patched: bool,
}

#[derive(Deserialize)]
struct IssueData {
    title: Option<String>,
    severity: Option<Severity>,
    url: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixInfo {
    #[serde(default)]
    is_fixable: bool,
}

fn find_org(orgs: Vec<SnykOrg>, org_id: &str) -> SyncResult<Organization> {
    orgs.into_iter()
        .find(|o| o.id == org_id)
        .map(|o| Organization {
            id: o.id,
            name: o.name,
            slug: o.slug,
        })
        .ok_or_else(|| SyncError::NotFound(format!("Snyk organization '{org_id}'")))
}

fn to_project(raw: SnykProject, org_id: &str) -> Project {
    Project {
        id: raw.id,
        name: raw.name,
        org_id: org_id.to_string(),
        project_type: raw.project_type,
    }
}

fn to_issue(raw: AggregatedIssue, project_id: &str) -> Issue {
    let introduced = raw
        .introduced_date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc));

    Issue {
        id: raw.id,
        project_id: project_id.to_string(),
        title: raw.issue_data.title.unwrap_or_default(),
        severity: raw.issue_data.severity.unwrap_or(Severity::Unknown),
        description: raw.issue_data.description.filter(|d| !d.trim().is_empty()),
        package: raw.pkg_name,
        versions: raw.pkg_versions,
        url: raw.issue_data.url,
        introduced,
        is_ignored: raw.is_ignored,
        is_patched: raw.is_patched,
        is_fixable: raw.fix_info.map(|f| f.is_fixable).unwrap_or(false),
    }
}

#[async_trait]
impl IssueSource for SnykClient {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn get_organization(&self, org_id: &str) -> SyncResult<Organization> {
        let resp: OrgsResponse = self.get("orgs", "list Snyk organizations").await?;
        debug!(count = resp.orgs.len(), "organizations visible to token");
        find_org(resp.orgs, org_id)
    }

    async fn list_projects(&self, org: &Organization) -> SyncResult<Vec<Project>> {
        let path = format!("org/{}/projects", urlencoding::encode(&org.id));
        let resp: ProjectsResponse = self.get(&path, "list Snyk projects").await?;
        Ok(resp
            .projects
            .into_iter()
            .map(|p| to_project(p, &org.id))
            .collect())
    }

    async fn list_issues(&self, project: &Project) -> SyncResult<Vec<Issue>> {
        let path = format!(
            "org/{}/project/{}/aggregated-issues",
            urlencoding::encode(&project.org_id),
            urlencoding::encode(&project.id)
        );
        let body = serde_json::json!({
            "includeDescription": true,
            "includeIntroducedThrough": false,
        });
        let resp: IssuesResponse = self.post(&path, &body, "list Snyk issues").await?;
        Ok(resp
            .issues
            .into_iter()
            .map(|i| to_issue(i, &project.id))
            .collect())
    }
}
