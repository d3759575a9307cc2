use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::mapping::{MappingPolicy, SeverityRule};
use crate::model::snyk::Severity;
use crate::util::retry::RetryPolicy;

pub const SNYK_TOKEN_ENV: &str = "SNYK_TOKEN";
pub const AZURE_PAT_ENV: &str = "AZURE_DEVOPS_PAT";
pub const AZURE_ORG_ENV: &str = "AZURE_DEVOPS_ORG";
pub const AZURE_PROJECT_ENV: &str = "AZURE_DEVOPS_PROJECT";

pub const DEFAULT_SNYK_BASE_URL: &str = "https://api.snyk.io/v1";
pub const DEFAULT_AZURE_BASE_URL: &str = "https://dev.azure.com";

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub snyk: Option<SnykFileConfig>,
    pub azure: Option<AzureFileConfig>,
    pub http: Option<HttpFileConfig>,
    pub mapping: Option<MappingFileConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SnykFileConfig {
    pub token: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AzureFileConfig {
    pub organization: Option<String>,
    pub project: Option<String>,
    pub token: Option<String>,
    pub work_item_type: Option<String>,
    pub area_path: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct HttpFileConfig {
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct MappingFileConfig {
    pub min_severity: Option<String>,
    pub include_ignored: Option<bool>,
    pub include_patched: Option<bool>,
    #[serde(default)]
    pub extra_tags: Vec<String>,
    #[serde(default)]
    pub severity: BTreeMap<String, SeverityOverride>,
}

#[derive(Debug, Deserialize)]
pub struct SeverityOverride {
    pub priority: Option<u8>,
    pub severity: Option<String>,
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".snyk-to-azure-boards")
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Load the TOML config. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(config)
}

/// Values given on the command line. `None` means the flag was not passed.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub org_id: Option<String>,
    pub snyk_token: Option<String>,
    pub azure_org: Option<String>,
    pub azure_project: Option<String>,
    pub azure_token: Option<String>,
    pub project_ids: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct SnykSettings {
    pub token: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct AzureSettings {
    pub organization: String,
    pub project: String,
    pub token: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub org_id: String,
    pub snyk: SnykSettings,
    /// Absent only for dry runs.
    pub azure: Option<AzureSettings>,
    pub project_ids: Vec<String>,
    pub dry_run: bool,
    pub http: HttpSettings,
    pub mapping: MappingPolicy,
}

/// Pick the first non-empty value: explicit flag, then environment, then file.
pub fn resolve_value(
    flag: Option<&str>,
    env_var: &str,
    env: &dyn Fn(&str) -> Option<String>,
    file: Option<&str>,
) -> Option<String> {
    let non_empty = |v: &str| {
        let v = v.trim();
        (!v.is_empty()).then(|| v.to_string())
    };
    flag.and_then(non_empty)
        .or_else(|| env(env_var).as_deref().and_then(non_empty))
        .or_else(|| file.and_then(non_empty))
}

/// Resolve the Snyk API token or fail before any network call is made.
pub fn resolve_snyk_token(
    flag: Option<&str>,
    env: &dyn Fn(&str) -> Option<String>,
    file: Option<&str>,
) -> SyncResult<String> {
    resolve_value(flag, SNYK_TOKEN_ENV, env, file).ok_or_else(|| {
        SyncError::Configuration(format!(
            "missing Snyk token: pass --token or set {SNYK_TOKEN_ENV}"
        ))
    })
}

impl RunConfig {
    pub fn resolve(
        overrides: &Overrides,
        file: &AppConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> SyncResult<RunConfig> {
        let org_id = overrides
            .org_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SyncError::Configuration("missing the Organization ID parameter".into())
            })?
            .to_string();

        let snyk_file = file.snyk.as_ref();
        let token = resolve_snyk_token(
            overrides.snyk_token.as_deref(),
            env,
            snyk_file.and_then(|s| s.token.as_deref()),
        )?;
        let snyk = SnykSettings {
            token,
            base_url: snyk_file
                .and_then(|s| s.base_url.clone())
                .unwrap_or_else(|| DEFAULT_SNYK_BASE_URL.to_string()),
        };

        let azure = resolve_azure(overrides, file.azure.as_ref(), env)?;

        let http = resolve_http(file.http.as_ref());
        let mut mapping = resolve_mapping(file.mapping.as_ref())?;
        if let Some(azure_file) = &file.azure {
            if let Some(kind) = &azure_file.work_item_type {
                mapping.work_item_type = kind.clone();
            }
            mapping.area_path = azure_file.area_path.clone();
        }

        let mut project_ids: Vec<String> = overrides
            .project_ids
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let mut seen = HashSet::new();
        project_ids.retain(|p| seen.insert(p.clone()));

        Ok(RunConfig {
            org_id,
            snyk,
            azure,
            project_ids,
            dry_run: overrides.dry_run,
            http,
            mapping,
        })
    }
}

fn resolve_azure(
    overrides: &Overrides,
    file: Option<&AzureFileConfig>,
    env: &dyn Fn(&str) -> Option<String>,
) -> SyncResult<Option<AzureSettings>> {
    let organization = resolve_value(
        overrides.azure_org.as_deref(),
        AZURE_ORG_ENV,
        env,
        file.and_then(|f| f.organization.as_deref()),
    );
    let project = resolve_value(
        overrides.azure_project.as_deref(),
        AZURE_PROJECT_ENV,
        env,
        file.and_then(|f| f.project.as_deref()),
    );
    let token = resolve_value(
        overrides.azure_token.as_deref(),
        AZURE_PAT_ENV,
        env,
        file.and_then(|f| f.token.as_deref()),
    );

    match (organization, project, token) {
        (Some(organization), Some(project), Some(token)) => Ok(Some(AzureSettings {
            organization,
            project,
            token,
            base_url: file
                .and_then(|f| f.base_url.clone())
                .unwrap_or_else(|| DEFAULT_AZURE_BASE_URL.to_string()),
        })),
        // Dry runs never talk to Azure.
        _ if overrides.dry_run => Ok(None),
        (organization, project, token) => {
            let mut missing = Vec::new();
            if organization.is_none() {
                missing.push(format!("--azure-org or {AZURE_ORG_ENV}"));
            }
            if project.is_none() {
                missing.push(format!("--azure-project or {AZURE_PROJECT_ENV}"));
            }
            if token.is_none() {
                missing.push(format!("--azure-token or {AZURE_PAT_ENV}"));
            }
            Err(SyncError::Configuration(format!(
                "missing Azure DevOps settings: {}",
                missing.join(", ")
            )))
        }
    }
}

fn resolve_http(file: Option<&HttpFileConfig>) -> HttpSettings {
    let defaults = HttpSettings::default();
    let Some(file) = file else {
        return defaults;
    };
    HttpSettings {
        timeout: file
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        retry: RetryPolicy {
            max_attempts: file.max_attempts.unwrap_or(defaults.retry.max_attempts).max(1),
            initial_delay: file
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: file
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        },
    }
}

fn resolve_mapping(file: Option<&MappingFileConfig>) -> SyncResult<MappingPolicy> {
    let mut policy = MappingPolicy::default();
    let Some(file) = file else {
        return Ok(policy);
    };

    if let Some(min) = &file.min_severity {
        policy.min_severity = Some(Severity::parse(min).ok_or_else(|| {
            SyncError::Configuration(format!("unknown min_severity '{min}'"))
        })?);
    }
    policy.include_ignored = file.include_ignored.unwrap_or(policy.include_ignored);
    policy.include_patched = file.include_patched.unwrap_or(policy.include_patched);
    policy.extra_tags = file.extra_tags.clone();

    for (name, over) in &file.severity {
        // `unknown` covers Snyk severities outside the four known levels.
        let severity = Severity::parse(name)
            .or_else(|| {
                name.trim()
                    .eq_ignore_ascii_case("unknown")
                    .then_some(Severity::Unknown)
            })
            .ok_or_else(|| {
                let known: Vec<&str> = Severity::ALL.iter().map(|s| s.as_str()).collect();
                SyncError::Configuration(format!(
                    "unknown severity '{name}' in [mapping.severity], expected one of {}, unknown",
                    known.join(", ")
                ))
            })?;
        let current = policy.rule(severity).cloned().unwrap_or(SeverityRule {
            priority: 4,
            azure_severity: "4 - Low".into(),
        });
        let priority = over.priority.unwrap_or(current.priority);
        if !(1..=4).contains(&priority) {
            return Err(SyncError::Configuration(format!(
                "priority for '{name}' must be between 1 and 4, got {priority}"
            )));
        }
        policy.set_rule(
            severity,
            SeverityRule {
                priority,
                azure_severity: over.severity.clone().unwrap_or(current.azure_severity),
            },
        );
    }

    Ok(policy)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::mapping::map_issue;
    use crate::model::snyk::Project;
    use crate::providers::tests::make_issue;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn no_env() -> impl Fn(&str) -> Option<String> {
        |_| None
    }

    fn overrides(org: &str) -> Overrides {
        Overrides {
            org_id: Some(org.to_string()),
            dry_run: true,
            ..Overrides::default()
        }
    }

    #[test]
    fn flag_token_wins_over_env() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "from-env")]);
        let token = resolve_snyk_token(Some("from-flag"), &env, Some("from-file")).unwrap();
        assert_eq!(token, "from-flag");
    }

    #[test]
    fn env_token_used_when_flag_absent() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "from-env")]);
        let token = resolve_snyk_token(None, &env, Some("from-file")).unwrap();
        assert_eq!(token, "from-env");
    }

    #[test]
    fn file_token_is_last_resort() {
        let token = resolve_snyk_token(None, &no_env(), Some("from-file")).unwrap();
        assert_eq!(token, "from-file");
    }

    #[test]
    fn empty_values_count_as_absent() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "   ")]);
        let token = resolve_snyk_token(Some(""), &env, Some("from-file")).unwrap();
        assert_eq!(token, "from-file");
    }

    #[test]
    fn missing_token_is_configuration_error() {
        let err = resolve_snyk_token(None, &no_env(), None).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(err.to_string().contains(SNYK_TOKEN_ENV));
    }

    #[test]
    fn missing_org_id_is_configuration_error() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let err = RunConfig::resolve(&Overrides::default(), &AppConfig::default(), &env)
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(err.to_string().contains("Organization ID"));
    }

    #[test]
    fn run_config_without_token_fails() {
        let err = RunConfig::resolve(&overrides("abc123"), &AppConfig::default(), &no_env())
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn dry_run_needs_no_azure_settings() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let config = RunConfig::resolve(&overrides("abc123"), &AppConfig::default(), &env).unwrap();
        assert!(config.azure.is_none());
        assert!(config.dry_run);
        assert_eq!(config.snyk.base_url, DEFAULT_SNYK_BASE_URL);
    }

    #[test]
    fn real_run_requires_azure_settings() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok"), (AZURE_ORG_ENV, "contoso")]);
        let mut ov = overrides("abc123");
        ov.dry_run = false;
        let err = RunConfig::resolve(&ov, &AppConfig::default(), &env).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(AZURE_PROJECT_ENV));
        assert!(msg.contains(AZURE_PAT_ENV));
        assert!(!msg.contains(AZURE_ORG_ENV));
    }

    #[test]
    fn azure_settings_resolved_from_env_and_flags() {
        let env = env_from(&[
            (SNYK_TOKEN_ENV, "tok"),
            (AZURE_ORG_ENV, "contoso"),
            (AZURE_PROJECT_ENV, "env-project"),
            (AZURE_PAT_ENV, "pat"),
        ]);
        let ov = Overrides {
            org_id: Some("abc123".into()),
            azure_project: Some("Security".into()),
            project_ids: vec!["p1".into(), "p1".into(), " ".into()],
            ..Overrides::default()
        };
        let config = RunConfig::resolve(&ov, &AppConfig::default(), &env).unwrap();
        let azure = config.azure.unwrap();
        assert_eq!(azure.organization, "contoso");
        assert_eq!(azure.project, "Security");
        assert_eq!(azure.token, "pat");
        assert_eq!(config.mapping.work_item_type, "Bug");
        assert_eq!(config.project_ids, vec!["p1"]);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert!(config.snyk.is_none());
        assert!(config.azure.is_none());
    }

    #[test]
    fn load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[snyk]
token = "file-token"

[azure]
organization = "contoso"
project = "Security"
token = "pat"
work_item_type = "Issue"
area_path = "Security\\Snyk"

[http]
timeout_secs = 10
max_attempts = 2

[mapping]
min_severity = "medium"
extra_tags = ["team:web"]

[mapping.severity.high]
priority = 1
"#
        )
        .unwrap();

        let app = load_config(file.path()).unwrap();
        let config = RunConfig::resolve(
            &Overrides {
                org_id: Some("abc123".into()),
                ..Overrides::default()
            },
            &app,
            &no_env(),
        )
        .unwrap();

        assert_eq!(config.snyk.token, "file-token");
        let azure = config.azure.unwrap();
        assert_eq!(azure.organization, "contoso");
        assert_eq!(config.mapping.work_item_type, "Issue");
        assert_eq!(config.mapping.area_path.as_deref(), Some("Security\\Snyk"));
        assert_eq!(config.http.timeout, Duration::from_secs(10));
        assert_eq!(config.http.retry.max_attempts, 2);
        assert_eq!(config.mapping.min_severity, Some(Severity::Medium));
        assert_eq!(config.mapping.extra_tags, vec!["team:web"]);
        let high = config.mapping.rule(Severity::High).unwrap();
        assert_eq!(high.priority, 1);
        assert_eq!(high.azure_severity, "2 - High");
    }

    #[test]
    fn invalid_toml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[snyk\ntoken = ").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let app: AppConfig = toml::from_str(
            r#"
[mapping.severity.low]
priority = 9
"#,
        )
        .unwrap();
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let err = RunConfig::resolve(&overrides("abc123"), &app, &env).unwrap_err();
        assert!(err.to_string().contains("between 1 and 4"));
    }

    #[test]
    fn unknown_severity_rule_maps_informational_issues() {
        let app: AppConfig = toml::from_str(
            r#"
[mapping.severity.unknown]
priority = 4
severity = "4 - Low"
"#,
        )
        .unwrap();
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let config = RunConfig::resolve(&overrides("abc123"), &app, &env).unwrap();

        let issue = make_issue("snyk:lic:npm:foo:GPL-3.0", "p1", Severity::Unknown);
        let project = Project {
            id: "p1".into(),
            name: "web".into(),
            org_id: "abc123".into(),
            project_type: None,
        };
        let payload = map_issue(&issue, &project, &config.mapping).unwrap();
        assert_eq!(payload.fields.priority, 4);
        assert_eq!(payload.fields.severity, "4 - Low");
        assert!(payload.fields.tags.contains(&"severity:unknown".to_string()));
    }

    #[test]
    fn misspelled_severity_rule_is_rejected() {
        let app: AppConfig = toml::from_str("[mapping.severity.severe]\npriority = 1\n").unwrap();
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let err = RunConfig::resolve(&overrides("abc123"), &app, &env).unwrap_err();
        assert!(err.to_string().contains("severe"));
    }

    #[test]
    fn repeated_project_ids_keep_first_occurrence_order() {
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let ov = Overrides {
            project_ids: vec!["p1".into(), "p2".into(), " p1 ".into(), "p3".into(), "p2".into()],
            ..overrides("abc123")
        };
        let config = RunConfig::resolve(&ov, &AppConfig::default(), &env).unwrap();
        assert_eq!(config.project_ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn unknown_min_severity_is_rejected() {
        let app: AppConfig = toml::from_str("[mapping]\nmin_severity = \"severe\"\n").unwrap();
        let env = env_from(&[(SNYK_TOKEN_ENV, "tok")]);
        let err = RunConfig::resolve(&overrides("abc123"), &app, &env).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
