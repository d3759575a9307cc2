use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{build_http_client, read_json, WorkItemTracker};
use crate::config::{AzureSettings, HttpSettings};
use crate::error::{SyncError, SyncResult};
use crate::model::work_item::{normalize_tags, WorkItem, WorkItemFields, WorkItemPayload};
use crate::util::retry::{with_retry, RetryPolicy};

const SERVICE: &str = "Azure Boards";
const API_VERSION: &str = "7.0";
/// Upper bound on `ids=` in a work items batch GET.
const MAX_BATCH_IDS: usize = 200;

const FIELD_TITLE: &str = "System.Title";
const FIELD_DESCRIPTION: &str = "System.Description";
const FIELD_TAGS: &str = "System.Tags";
const FIELD_AREA_PATH: &str = "System.AreaPath";
const FIELD_PRIORITY: &str = "Microsoft.VSTS.Common.Priority";
const FIELD_SEVERITY: &str = "Microsoft.VSTS.Common.Severity";

pub struct AzureBoardsClient {
    /// `{base}/{organization}/{project}/_apis/wit`
    wit_url: String,
    auth_header: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl AzureBoardsClient {
    pub fn new(settings: &AzureSettings, http: &HttpSettings) -> SyncResult<Self> {
        // PAT auth is Basic with an empty user name.
        let creds = format!(":{}", settings.token);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        Ok(Self {
            wit_url: format!(
                "{}/{}/{}/_apis/wit",
                settings.base_url.trim_end_matches('/'),
                urlencoding::encode(&settings.organization),
                urlencoding::encode(&settings.project)
            ),
            auth_header: format!("Basic {encoded}"),
            client: build_http_client(http.timeout, SERVICE)?,
            retry: http.retry.clone(),
        })
    }

    fn request(
        &self,
        method: &reqwest::Method,
        url: &str,
        content_type: &str,
        body: Option<&Vec<u8>>,
    ) -> reqwest::RequestBuilder {
        let req = self
            .client
            .request(method.clone(), url)
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json");
        match body {
            Some(body) => req.header("Content-Type", content_type).body(body.clone()),
            None => req,
        }
    }

    async fn send_once<T: serde::de::DeserializeOwned>(
        req: reqwest::RequestBuilder,
    ) -> SyncResult<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::from_reqwest(SERVICE, e))?;
        read_json(SERVICE, resp).await
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        content_type: &str,
        body: Option<Vec<u8>>,
        what: &str,
    ) -> SyncResult<T> {
        with_retry(&self.retry, what, || {
            Self::send_once(self.request(&method, url, content_type, body.as_ref()))
        })
        .await
    }

    async fn query_ids(&self, dedup_key: &str) -> SyncResult<Vec<u64>> {
        let url = format!("{}/wiql?api-version={API_VERSION}", self.wit_url);
        let body = serde_json::to_vec(&serde_json::json!({ "query": wiql_for_key(dedup_key) }))
            .map_err(|e| SyncError::Validation(format!("failed to encode WIQL query: {e}")))?;
        let resp: WiqlResponse = self
            .send(
                reqwest::Method::POST,
                &url,
                "application/json",
                Some(body),
                "query work items",
            )
            .await?;
        Ok(resp.work_items.into_iter().map(|w| w.id).collect())
    }

    async fn fetch_items(&self, ids: &str) -> SyncResult<Vec<WorkItem>> {
        let fields = [
            FIELD_TITLE,
            FIELD_DESCRIPTION,
            FIELD_PRIORITY,
            FIELD_SEVERITY,
            FIELD_TAGS,
        ]
        .join(",");
        let url = format!(
            "{}/workitems?ids={ids}&fields={fields}&api-version={API_VERSION}",
            self.wit_url
        );
        let resp: WorkItemList = self
            .send(reqwest::Method::GET, &url, "", None, "fetch work items")
            .await?;
        Ok(resp.value.into_iter().map(to_work_item).collect())
    }

    /// Create and update go out once. Only create is ever ambiguous, and
    /// `upsert_work_item` retries it after looking the key up again.
    async fn write(
        &self,
        method: reqwest::Method,
        url: String,
        payload: &WorkItemPayload,
        what: &str,
    ) -> SyncResult<WorkItem> {
        let body = serde_json::to_vec(&patch_document(payload))
            .map_err(|e| SyncError::Validation(format!("failed to encode work item: {e}")))?;
        debug!(what, url = %url, "writing work item");
        let raw: RawWorkItem = Self::send_once(self.request(
            &method,
            &url,
            "application/json-patch+json",
            Some(&body),
        ))
        .await?;
        Ok(to_work_item(raw))
    }
}

/// Comma-joined id lists, at most `MAX_BATCH_IDS` per list.
fn id_batches(ids: &[u64]) -> Vec<String> {
    ids.chunks(MAX_BATCH_IDS)
        .map(|chunk| {
            chunk
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

#[derive(Deserialize)]
struct WiqlResponse {
    #[serde(rename = "workItems", default)]
    work_items: Vec<WiqlRef>,
}

#[derive(Deserialize)]
struct WiqlRef {
    id: u64,
}

#[derive(Deserialize)]
struct WorkItemList {
    #[serde(default)]
    value: Vec<RawWorkItem>,
}

#[derive(Deserialize)]
struct RawWorkItem {
    id: u64,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
    url: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
struct PatchOp {
    op: &'static str,
    path: String,
    value: Value,
}

/// WIQL string literals escape a single quote by doubling it.
fn wiql_for_key(dedup_key: &str) -> String {
    format!(
        "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = @project \
         AND [{FIELD_TAGS}] CONTAINS '{}' ORDER BY [System.Id]",
        dedup_key.replace('\'', "''")
    )
}

fn patch_document(payload: &WorkItemPayload) -> Vec<PatchOp> {
    let add = |field: &str, value: Value| PatchOp {
        op: "add",
        path: format!("/fields/{field}"),
        value,
    };
    let fields = &payload.fields;
    let mut ops = vec![
        add(FIELD_TITLE, Value::from(fields.title.clone())),
        add(FIELD_DESCRIPTION, Value::from(fields.description.clone())),
        add(FIELD_PRIORITY, Value::from(fields.priority)),
        add(FIELD_SEVERITY, Value::from(fields.severity.clone())),
        add(FIELD_TAGS, Value::from(fields.tags.join("; "))),
    ];
    if let Some(area) = &payload.area_path {
        ops.push(add(FIELD_AREA_PATH, Value::from(area.clone())));
    }
    ops
}

fn field_str(fields: &serde_json::Map<String, Value>, name: &str) -> String {
    fields
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn to_work_item(raw: RawWorkItem) -> WorkItem {
    let tags = field_str(&raw.fields, FIELD_TAGS);
    let priority = raw
        .fields
        .get(FIELD_PRIORITY)
        .and_then(|v| v.as_u64())
        .and_then(|p| u8::try_from(p).ok())
        .unwrap_or(0);

    WorkItem {
        id: raw.id,
        fields: WorkItemFields {
            title: field_str(&raw.fields, FIELD_TITLE),
            description: field_str(&raw.fields, FIELD_DESCRIPTION),
            priority,
            severity: field_str(&raw.fields, FIELD_SEVERITY),
            tags: normalize_tags(tags.split(';')),
        },
        url: raw.url,
    }
}

#[async_trait]
impl WorkItemTracker for AzureBoardsClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    async fn find_by_key(&self, dedup_key: &str) -> SyncResult<Option<WorkItem>> {
        let ids = self.query_ids(dedup_key).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        // CONTAINS is a substring match, so confirm the exact tag.
        for batch in id_batches(&ids) {
            let items = self.fetch_items(&batch).await?;
            if let Some(item) = items.into_iter().find(|item| item.has_tag(dedup_key)) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    async fn create(&self, payload: &WorkItemPayload) -> SyncResult<WorkItem> {
        let url = format!(
            "{}/workitems/${}?api-version={API_VERSION}",
            self.wit_url,
            urlencoding::encode(&payload.work_item_type)
        );
        self.write(reqwest::Method::POST, url, payload, "create work item")
            .await
    }

    async fn update(&self, id: u64, payload: &WorkItemPayload) -> SyncResult<WorkItem> {
        let url = format!("{}/workitems/{id}?api-version={API_VERSION}", self.wit_url);
        self.write(reqwest::Method::PATCH, url, payload, "update work item")
            .await
    }
}
