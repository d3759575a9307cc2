use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::model::snyk::{Issue, Project, Severity};
use crate::model::work_item::{normalize_tags, WorkItemFields, WorkItemPayload};
use crate::util::html;

/// Azure Boards rejects titles longer than this.
pub const MAX_TITLE_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeverityRule {
    pub priority: u8,
    pub azure_severity: String,
}

/// How Snyk issues become work items. Injected into the run so the
/// severity table and filters can be tuned from the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingPolicy {
    severities: HashMap<Severity, SeverityRule>,
    pub min_severity: Option<Severity>,
    pub include_ignored: bool,
    pub include_patched: bool,
    pub extra_tags: Vec<String>,
    pub work_item_type: String,
    pub area_path: Option<String>,
}

impl Default for MappingPolicy {
    fn default() -> Self {
        let severities = [
            (Severity::Critical, 1, "1 - Critical"),
            (Severity::High, 2, "2 - High"),
            (Severity::Medium, 3, "3 - Medium"),
            (Severity::Low, 4, "4 - Low"),
        ]
        .into_iter()
        .map(|(sev, priority, label)| {
            (
                sev,
                SeverityRule {
                    priority,
                    azure_severity: label.to_string(),
                },
            )
        })
        .collect();

        MappingPolicy {
            severities,
            min_severity: None,
            include_ignored: false,
            include_patched: false,
            extra_tags: Vec::new(),
            work_item_type: "Bug".to_string(),
            area_path: None,
        }
    }
}

/// Why an issue was left out of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Ignored,
    Patched,
    BelowThreshold,
}

impl MappingPolicy {
    pub fn rule(&self, severity: Severity) -> Option<&SeverityRule> {
        self.severities.get(&severity)
    }

    pub fn set_rule(&mut self, severity: Severity, rule: SeverityRule) {
        self.severities.insert(severity, rule);
    }

    /// Returns why the issue should be skipped, or `None` to sync it.
    pub fn skip_reason(&self, issue: &Issue) -> Option<SkipReason> {
        if issue.is_ignored && !self.include_ignored {
            return Some(SkipReason::Ignored);
        }
        if issue.is_patched && !self.include_patched {
            return Some(SkipReason::Patched);
        }
        match self.min_severity {
            Some(min) if issue.severity.rank() < min.rank() => Some(SkipReason::BelowThreshold),
            _ => None,
        }
    }
}

pub fn dedup_key(project_id: &str, issue_id: &str) -> String {
    format!("snyk:{project_id}:{issue_id}")
}

/// Translate a Snyk issue into a work item payload. Output depends only on
/// the inputs, so an unchanged issue always yields an identical payload.
pub fn map_issue(
    issue: &Issue,
    project: &Project,
    policy: &MappingPolicy,
) -> SyncResult<WorkItemPayload> {
    if issue.id.trim().is_empty() {
        return Err(SyncError::Validation(format!(
            "issue in project '{}' has no id",
            project.name
        )));
    }
    if issue.title.trim().is_empty() {
        return Err(SyncError::Validation(format!("issue {} has no title", issue.id)));
    }
    let rule = policy.rule(issue.severity).ok_or_else(|| {
        SyncError::Validation(format!(
            "issue {} has severity '{}' with no mapping",
            issue.id, issue.severity
        ))
    })?;

    let key = dedup_key(&project.id, &issue.id);

    let mut tags = vec![
        "snyk".to_string(),
        format!("severity:{}", issue.severity),
        key.clone(),
    ];
    tags.extend(policy.extra_tags.iter().cloned());

    Ok(WorkItemPayload {
        dedup_key: key,
        work_item_type: policy.work_item_type.clone(),
        area_path: policy.area_path.clone(),
        fields: WorkItemFields {
            title: build_title(issue),
            description: build_description(issue, project),
            priority: rule.priority,
            severity: rule.azure_severity.clone(),
            tags: normalize_tags(tags),
        },
    })
}

fn build_title(issue: &Issue) -> String {
    let mut title = format!("[Snyk] {}", issue.title.trim());
    if let Some(pkg) = &issue.package {
        title.push_str(" in ");
        title.push_str(pkg);
        if let Some(version) = issue.versions.first() {
            title.push('@');
            title.push_str(version);
        }
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        title = title.chars().take(MAX_TITLE_CHARS - 1).collect();
        title.push('…');
    }
    title
}

fn build_description(issue: &Issue, project: &Project) -> String {
    let mut rows = vec![
        ("Project", html::escape(&project.name)),
        ("Snyk issue", html::escape(&issue.id)),
        ("Severity", issue.severity.to_string()),
    ];
    if let Some(pkg) = &issue.package {
        rows.push(("Package", html::escape(pkg)));
    }
    if !issue.versions.is_empty() {
        rows.push(("Versions", html::escape(&issue.versions.join(", "))));
    }
    rows.push(("Fixable", if issue.is_fixable { "yes" } else { "no" }.to_string()));
    if let Some(introduced) = issue.introduced {
        rows.push(("Introduced", introduced.format("%Y-%m-%d").to_string()));
    }

    let mut out = String::from("<ul>");
    for (label, value) in rows {
        out.push_str(&format!("<li><b>{label}:</b> {value}</li>"));
    }
    out.push_str("</ul>");

    if let Some(url) = &issue.url {
        let url = html::escape(url);
        out.push_str(&format!("<p><a href=\"{url}\">View in Snyk</a></p>"));
    }
    if let Some(desc) = issue.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&html::paragraphs(desc));
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn project() -> Project {
        Project {
            id: "proj-1".into(),
            name: "web-frontend".into(),
            org_id: "abc123".into(),
            project_type: Some("npm".into()),
        }
    }

    fn issue(id: &str, severity: Severity) -> Issue {
        Issue {
            id: id.into(),
            project_id: "proj-1".into(),
            title: "Prototype Pollution".into(),
            severity,
            description: Some("## Overview\nlodash is vulnerable.".into()),
            package: Some("lodash".into()),
            versions: vec!["4.17.15".into()],
            url: Some("https://snyk.io/vuln/SNYK-JS-LODASH-567746".into()),
            introduced: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            is_ignored: false,
            is_patched: false,
            is_fixable: true,
        }
    }

    #[test]
    fn mapping_is_deterministic() {
        let policy = MappingPolicy::default();
        let a = map_issue(&issue("SNYK-1", Severity::High), &project(), &policy).unwrap();
        let b = map_issue(&issue("SNYK-1", Severity::High), &project(), &policy).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn high_severity_layout() {
        let payload =
            map_issue(&issue("SNYK-1", Severity::High), &project(), &MappingPolicy::default())
                .unwrap();
        assert_eq!(payload.dedup_key, "snyk:proj-1:SNYK-1");
        assert_eq!(payload.work_item_type, "Bug");
        assert_eq!(payload.fields.title, "[Snyk] Prototype Pollution in lodash@4.17.15");
        assert_eq!(payload.fields.priority, 2);
        assert_eq!(payload.fields.severity, "2 - High");
        assert_eq!(
            payload.fields.tags,
            vec!["severity:high", "snyk", "snyk:proj-1:SNYK-1"]
        );
        let desc = &payload.fields.description;
        assert!(desc.contains("<li><b>Project:</b> web-frontend</li>"));
        assert!(desc.contains("<li><b>Fixable:</b> yes</li>"));
        assert!(desc.contains("<li><b>Introduced:</b> 2024-03-01</li>"));
        assert!(desc.contains("View in Snyk"));
        assert!(desc.contains("<p>## Overview<br>lodash is vulnerable.</p>"));
    }

    #[test]
    fn default_table_covers_known_severities() {
        let policy = MappingPolicy::default();
        let priorities: Vec<u8> = Severity::ALL
            .iter()
            .map(|s| policy.rule(*s).unwrap().priority)
            .collect();
        assert_eq!(priorities, vec![1, 2, 3, 4]);
    }

    #[test]
    fn custom_table_is_used() {
        let mut policy = MappingPolicy::default();
        policy.set_rule(
            Severity::Medium,
            SeverityRule {
                priority: 1,
                azure_severity: "1 - Critical".into(),
            },
        );
        policy.extra_tags = vec!["team:web".into()];
        let payload = map_issue(&issue("SNYK-2", Severity::Medium), &project(), &policy).unwrap();
        assert_eq!(payload.fields.priority, 1);
        assert_eq!(payload.fields.severity, "1 - Critical");
        assert!(payload.fields.tags.contains(&"team:web".to_string()));
    }

    #[test]
    fn unknown_severity_is_validation_error() {
        let err = map_issue(
            &issue("SNYK-3", Severity::Unknown),
            &project(),
            &MappingPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn empty_title_is_validation_error() {
        let mut bad = issue("SNYK-4", Severity::Low);
        bad.title = "  ".into();
        let err = map_issue(&bad, &project(), &MappingPolicy::default()).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn empty_id_is_validation_error() {
        let err = map_issue(&issue("", Severity::Low), &project(), &MappingPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("web-frontend"));
    }

    #[test]
    fn long_titles_are_truncated_on_char_boundaries() {
        let mut long = issue("SNYK-5", Severity::Low);
        long.title = "é".repeat(400);
        let payload = map_issue(&long, &project(), &MappingPolicy::default()).unwrap();
        assert_eq!(payload.fields.title.chars().count(), MAX_TITLE_CHARS);
        assert!(payload.fields.title.ends_with('…'));
    }

    #[test]
    fn description_escapes_snyk_text() {
        let mut nasty = issue("SNYK-6", Severity::Critical);
        nasty.description = Some("<img src=x onerror=alert(1)>".into());
        let payload = map_issue(&nasty, &project(), &MappingPolicy::default()).unwrap();
        assert!(!payload.fields.description.contains("<img"));
        assert!(payload.fields.description.contains("&lt;img"));
    }

    #[test]
    fn title_without_package() {
        let mut bare = issue("SNYK-7", Severity::Low);
        bare.package = None;
        let payload = map_issue(&bare, &project(), &MappingPolicy::default()).unwrap();
        assert_eq!(payload.fields.title, "[Snyk] Prototype Pollution");
    }

    #[test]
    fn skip_reasons() {
        let mut policy = MappingPolicy::default();
        let mut ignored = issue("SNYK-8", Severity::High);
        ignored.is_ignored = true;
        assert_eq!(policy.skip_reason(&ignored), Some(SkipReason::Ignored));

        let mut patched = issue("SNYK-9", Severity::High);
        patched.is_patched = true;
        assert_eq!(policy.skip_reason(&patched), Some(SkipReason::Patched));

        policy.min_severity = Some(Severity::High);
        assert_eq!(
            policy.skip_reason(&issue("SNYK-10", Severity::Medium)),
            Some(SkipReason::BelowThreshold)
        );
        assert_eq!(policy.skip_reason(&issue("SNYK-11", Severity::Critical)), None);

        policy.include_ignored = true;
        policy.min_severity = None;
        assert_eq!(policy.skip_reason(&ignored), None);
    }
}
