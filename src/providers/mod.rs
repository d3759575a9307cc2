pub mod azure_boards;
pub mod snyk;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{parse_retry_after, SyncError, SyncResult};
use crate::model::snyk::{Issue, Organization, Project};
use crate::model::work_item::{UpsertResult, WorkItem, WorkItemPayload, WorkItemState};
use crate::util::retry::{with_retry, RetryPolicy};

/// Read side: where vulnerability issues come from.
#[async_trait]
pub trait IssueSource: Send + Sync {
    fn name(&self) -> &str;
    async fn get_organization(&self, org_id: &str) -> SyncResult<Organization>;
    async fn list_projects(&self, org: &Organization) -> SyncResult<Vec<Project>>;
    async fn list_issues(&self, project: &Project) -> SyncResult<Vec<Issue>>;
}

/// Write side: the ticket tracker work items are pushed to.
#[async_trait]
pub trait WorkItemTracker: Send + Sync {
    fn name(&self) -> &str;
    /// Find the work item carrying `dedup_key` as a tag.
    async fn find_by_key(&self, dedup_key: &str) -> SyncResult<Option<WorkItem>>;
    /// A single attempt. Retries belong to `upsert_work_item`, which checks
    /// for a landed create before trying again.
    async fn create(&self, payload: &WorkItemPayload) -> SyncResult<WorkItem>;
    async fn update(&self, id: u64, payload: &WorkItemPayload) -> SyncResult<WorkItem>;

    /// Backoff used by `upsert_work_item` around `create`.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Create-or-update keyed on the payload's dedup key. Calling this twice
    /// with the same payload never creates a second work item.
    ///
    /// A failed create may still have landed, so before each retry the key
    /// is looked up again and a work item found there is taken as created.
    async fn upsert_work_item(&self, payload: &WorkItemPayload) -> SyncResult<UpsertResult> {
        match self.find_by_key(&payload.dedup_key).await? {
            None => {
                let mut retrying = false;
                let item = with_retry(&self.retry_policy(), "create work item", || {
                    let look_first = retrying;
                    retrying = true;
                    async move {
                        if look_first {
                            if let Some(item) = self.find_by_key(&payload.dedup_key).await? {
                                debug!(id = item.id, key = %payload.dedup_key, "earlier create landed");
                                return Ok(item);
                            }
                        }
                        self.create(payload).await
                    }
                })
                .await?;
                debug!(id = item.id, key = %payload.dedup_key, "created work item");
                Ok(UpsertResult {
                    item,
                    state: WorkItemState::Created,
                })
            }
            Some(existing) => {
                let merged = payload.merged_with(&existing);
                if merged.fields.matches(&existing.fields) {
                    return Ok(UpsertResult {
                        item: existing,
                        state: WorkItemState::Unchanged,
                    });
                }
                let item = self.update(existing.id, &merged).await?;
                debug!(id = item.id, key = %payload.dedup_key, "updated work item");
                Ok(UpsertResult {
                    item,
                    state: WorkItemState::Updated,
                })
            }
        }
    }
}

pub(crate) fn build_http_client(
    timeout: std::time::Duration,
    service: &str,
) -> SyncResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("snyk-to-azure-boards/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SyncError::Configuration(format!("failed to build {service} HTTP client: {e}")))
}

/// Turn a response into `T`, classifying non-success statuses.
pub(crate) async fn read_json<T: DeserializeOwned>(
    service: &str,
    resp: reqwest::Response,
) -> SyncResult<T> {
    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(
            resp.headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = resp.text().await.unwrap_or_default();
        return Err(SyncError::from_status(service, status, &body, retry_after));
    }
    resp.json::<T>().await.map_err(|e| SyncError::Api {
        service: service.to_string(),
        status: status.as_u16(),
        message: format!("failed to decode response: {e}"),
    })
}
