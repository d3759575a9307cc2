use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::util::html;

/// The fields the tool owns on an Azure Boards work item. Two payloads with
/// equal fields need no update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemFields {
    pub title: String,
    pub description: String,
    pub priority: u8,
    /// Azure severity label, e.g. "2 - High".
    pub severity: String,
    /// Sorted and deduplicated.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkItemFields {
    /// Whether a stored work item already shows these fields. Azure Boards
    /// may change tag case and reformat description HTML, so tags compare
    /// case-insensitively and descriptions compare on their visible text.
    pub fn matches(&self, stored: &WorkItemFields) -> bool {
        self.title == stored.title
            && self.priority == stored.priority
            && self.severity == stored.severity
            && tag_set(&self.tags) == tag_set(&stored.tags)
            && html::text_content(&self.description) == html::text_content(&stored.description)
    }
}

fn tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter().map(|t| t.trim().to_lowercase()).collect()
}

/// Tags written by this tool: `snyk`, `severity:*` and the `snyk:*` dedup
/// key. Every other tag on a work item belongs to its users.
pub fn is_managed_tag(tag: &str) -> bool {
    let tag = tag.trim().to_lowercase();
    tag == "snyk" || tag.starts_with("severity:") || tag.starts_with("snyk:")
}

/// A mapped Snyk issue ready to be pushed to Azure Boards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemPayload {
    /// Tag linking the work item back to its Snyk issue.
    pub dedup_key: String,
    pub work_item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_path: Option<String>,
    pub fields: WorkItemFields,
}

impl WorkItemPayload {
    /// This payload with the user-added tags of `existing` carried over.
    /// Writing `System.Tags` replaces the whole list, so an update must
    /// resend them.
    pub fn merged_with(&self, existing: &WorkItem) -> WorkItemPayload {
        let mut merged = self.clone();
        let kept = existing
            .fields
            .tags
            .iter()
            .filter(|t| !is_managed_tag(t))
            .filter(|t| !merged.fields.tags.iter().any(|o| o.eq_ignore_ascii_case(t)));
        merged.fields.tags = normalize_tags(merged.fields.tags.iter().chain(kept));
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub fields: WorkItemFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl WorkItem {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.fields.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemState {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct UpsertResult {
    pub item: WorkItem,
    pub state: WorkItemState,
}

/// Normalize a tag list the way Azure Boards stores it: trimmed, unique, sorted.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = tags
        .into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    set.into_iter().collect()
}
