//! Deployment configuration file.
//!
//! A TOML document with `[workspace]`, `[parallel]`, `[retry]`, `[token]`,
//! `[publish]`, `[unpublish]` and `[retry_overrides]` sections. Values that
//! differ per target environment may be written as a table keyed by
//! environment name:
//!
//! ```toml
//! [workspace]
//! id = { dev = "1111-...", prod = "2222-..." }
//! ```
//!
//! `WSDEPLOY_WORKSPACE_ID`, `WSDEPLOY_API_ROOT` and `WSDEPLOY_MAX_WORKERS`
//! override the file when set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wsdeploy_client::token::{DEFAULT_REFRESH_MARGIN, DEFAULT_SCOPE};
use wsdeploy_client::RetryPolicy;

use crate::error::{DeployError, DeployResult};
use crate::item::ItemType;
use crate::parallel::ParallelConfig;
use crate::reconcile::OrphanFilter;
use crate::registry::CatalogSettings;

pub const ENV_WORKSPACE_ID: &str = "WSDEPLOY_WORKSPACE_ID";
pub const ENV_API_ROOT: &str = "WSDEPLOY_API_ROOT";
pub const ENV_MAX_WORKERS: &str = "WSDEPLOY_MAX_WORKERS";

pub const DEFAULT_API_ROOT: &str = "https://api.fabric.microsoft.com";

/// A value that is either shared by every environment or chosen per environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerEnvironment<T> {
    Single(T),
    ByEnvironment(BTreeMap<String, T>),
}

impl<T: Clone> PerEnvironment<T> {
    /// Value for `environment`; a per-environment table must name it.
    pub fn resolve(&self, environment: Option<&str>, field: &str) -> DeployResult<T> {
        match self {
            PerEnvironment::Single(value) => Ok(value.clone()),
            PerEnvironment::ByEnvironment(values) => {
                let environment = environment.ok_or_else(|| {
                    DeployError::Config(format!("{field} is per-environment but no environment was given"))
                })?;
                values.get(environment).cloned().ok_or_else(|| {
                    DeployError::Config(format!("{field} has no value for environment {environment:?}"))
                })
            }
        }
    }

    /// Like [`resolve`](Self::resolve), but environments missing from a
    /// table fall back to `default`.
    pub fn resolve_or(&self, environment: Option<&str>, default: T) -> T {
        match self {
            PerEnvironment::Single(value) => value.clone(),
            PerEnvironment::ByEnvironment(values) => environment
                .and_then(|environment| values.get(environment))
                .cloned()
                .unwrap_or(default),
        }
    }
}

impl<T: Default> Default for PerEnvironment<T> {
    fn default() -> Self {
        PerEnvironment::Single(T::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSection {
    pub id: PerEnvironment<String>,
    #[serde(default = "default_api_root")]
    pub api_root: String,
    #[serde(default = "default_repository_directory")]
    pub repository_directory: PathBuf,
    #[serde(default)]
    pub item_types_in_scope: Option<Vec<String>>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_root() -> String {
    DEFAULT_API_ROOT.to_string()
}

fn default_repository_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Optional overrides of [`RetryPolicy`] fields. Durations are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_throttle_retries: Option<u32>,
    pub default_retry_after_ms: Option<u64>,
    pub throttle_padding_ms: Option<u64>,
    pub max_transient_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter_ratio: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub max_poll_attempts: Option<u32>,
    /// API error codes retried on a 4xx, e.g. `ItemDisplayNameAlreadyInUse`
    pub retryable_error_codes: Option<Vec<String>>,
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let millis = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);
        RetryPolicy {
            max_throttle_retries: self.max_throttle_retries.unwrap_or(defaults.max_throttle_retries),
            default_retry_after: millis(self.default_retry_after_ms, defaults.default_retry_after),
            throttle_padding: millis(self.throttle_padding_ms, defaults.throttle_padding),
            max_transient_attempts: self
                .max_transient_attempts
                .unwrap_or(defaults.max_transient_attempts),
            base_delay: millis(self.base_delay_ms, defaults.base_delay),
            max_delay: millis(self.max_delay_ms, defaults.max_delay),
            jitter_ratio: self.jitter_ratio.unwrap_or(defaults.jitter_ratio),
            poll_interval: millis(self.poll_interval_ms, defaults.poll_interval),
            max_poll_attempts: self.max_poll_attempts.unwrap_or(defaults.max_poll_attempts),
            retryable_error_codes: self
                .retryable_error_codes
                .clone()
                .unwrap_or(defaults.retryable_error_codes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSection {
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_refresh_margin_secs() -> u64 {
    DEFAULT_REFRESH_MARGIN.as_secs()
}

impl Default for TokenSection {
    fn default() -> Self {
        TokenSection {
            scope: default_scope(),
            refresh_margin_secs: default_refresh_margin_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSection {
    /// Files whose item-relative path matches are not uploaded
    #[serde(default)]
    pub exclude_regex: Option<String>,
    #[serde(default)]
    pub skip: PerEnvironment<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpublishSection {
    /// Deployed items whose name matches are never removed
    #[serde(default)]
    pub exclude_regex: Option<String>,
    #[serde(default)]
    pub skip: PerEnvironment<bool>,
    /// Gated types whose orphans may be removed
    #[serde(default)]
    pub allow_types: Vec<String>,
}

fn default_retry_overrides() -> BTreeMap<String, u32> {
    [
        (ItemType::SEMANTIC_MODEL.to_string(), 10),
        (ItemType::REPORT.to_string(), 10),
    ]
    .into_iter()
    .collect()
}

/// Everything a deployment needs besides the credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub token: TokenSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub unpublish: UnpublishSection,
    #[serde(default = "default_retry_overrides")]
    pub retry_overrides: BTreeMap<String, u32>,
}

impl DeployConfig {
    /// Read a config file, apply environment variable overrides and validate.
    ///
    /// A relative `repository_directory` is taken relative to the file.
    pub fn load(path: &Path) -> DeployResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: DeployConfig = toml::from_str(&raw)?;
        if config.workspace.repository_directory.is_relative() {
            if let Some(parent) = path.parent() {
                config.workspace.repository_directory = parent.join(&config.workspace.repository_directory);
            }
        }
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded deployment config");
        Ok(config)
    }

    /// Parse and validate without touching the filesystem or environment.
    pub fn from_toml_str(raw: &str) -> DeployResult<Self> {
        let config: DeployConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WSDEPLOY_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> DeployResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(ENV_WORKSPACE_ID) {
            self.workspace.id = PerEnvironment::Single(id);
        }
        if let Some(api_root) = lookup(ENV_API_ROOT) {
            self.workspace.api_root = api_root;
        }
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            let max_workers = raw
                .trim()
                .parse::<usize>()
                .map_err(|err| DeployError::Config(format!("{ENV_MAX_WORKERS}={raw:?}: {err}")))?;
            self.parallel = ParallelConfig::new(max_workers, self.parallel.continue_on_failure())?;
        }
        Ok(())
    }

    pub fn validate(&self) -> DeployResult<()> {
        if self.workspace.api_root.trim().is_empty() {
            return Err(DeployError::Config("workspace.api_root must not be empty".to_string()));
        }
        if let PerEnvironment::Single(id) = &self.workspace.id {
            if id.trim().is_empty() {
                return Err(DeployError::Config("workspace.id must not be empty".to_string()));
            }
        }
        if self.workspace.request_timeout_secs == 0 {
            return Err(DeployError::Config(
                "workspace.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.retry_policy()?;
        compile(self.publish.exclude_regex.as_deref(), "publish.exclude_regex")?;
        compile(self.unpublish.exclude_regex.as_deref(), "unpublish.exclude_regex")?;
        Ok(())
    }

    pub fn workspace_id(&self, environment: Option<&str>) -> DeployResult<String> {
        self.workspace.id.resolve(environment, "workspace.id")
    }

    pub fn retry_policy(&self) -> DeployResult<RetryPolicy> {
        let policy = self.retry.policy();
        policy
            .validate()
            .map_err(|err| DeployError::Config(format!("retry: {err}")))?;
        Ok(policy)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.workspace.request_timeout_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token.refresh_margin_secs)
    }

    pub fn publish_skipped(&self, environment: Option<&str>) -> bool {
        self.publish.skip.resolve_or(environment, false)
    }

    pub fn unpublish_skipped(&self, environment: Option<&str>) -> bool {
        self.unpublish.skip.resolve_or(environment, false)
    }

    /// `None` means every type is in scope.
    pub fn item_types_in_scope(&self) -> Option<BTreeSet<ItemType>> {
        self.workspace
            .item_types_in_scope
            .as_ref()
            .map(|types| types.iter().map(|tag| ItemType::new(tag.clone())).collect())
    }

    pub fn catalog_settings(&self) -> DeployResult<CatalogSettings> {
        let retry_overrides: HashMap<ItemType, u32> = self
            .retry_overrides
            .iter()
            .map(|(tag, retries)| (ItemType::new(tag.clone()), *retries))
            .collect();
        Ok(CatalogSettings {
            exclude_files: compile(self.publish.exclude_regex.as_deref(), "publish.exclude_regex")?,
            retry_overrides,
        })
    }

    pub fn orphan_filter(&self) -> DeployResult<OrphanFilter> {
        Ok(OrphanFilter {
            exclude: compile(self.unpublish.exclude_regex.as_deref(), "unpublish.exclude_regex")?,
            allow_types: self
                .unpublish
                .allow_types
                .iter()
                .map(|tag| ItemType::new(tag.clone()))
                .collect(),
            in_scope: self.item_types_in_scope(),
        })
    }
}

fn compile(pattern: Option<&str>, field: &str) -> DeployResult<Option<Regex>> {
    pattern
        .map(|pattern| Regex::new(pattern).map_err(|err| DeployError::Config(format!("{field}: {err}"))))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [workspace]
        id = "ws-1"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = DeployConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.workspace.api_root, DEFAULT_API_ROOT);
        assert_eq!(config.parallel, ParallelConfig::default());
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::default());
        assert_eq!(config.token.scope, DEFAULT_SCOPE);
        assert_eq!(config.retry_overrides.get("SemanticModel"), Some(&10));
        assert_eq!(config.retry_overrides.get("Report"), Some(&10));
        assert!(!config.publish_skipped(None));
        assert!(config.item_types_in_scope().is_none());
        assert_eq!(config.workspace_id(Some("anything")).unwrap(), "ws-1");
    }

    #[test]
    fn per_environment_values_resolve() {
        let config = DeployConfig::from_toml_str(
            r#"
            [workspace]
            id = { dev = "ws-dev", prod = "ws-prod" }
            item_types_in_scope = ["Notebook", "Report"]

            [unpublish]
            skip = { prod = true }
            allow_types = ["Lakehouse"]
            exclude_regex = "^DO_NOT_DELETE"
            "#,
        )
        .unwrap();

        assert_eq!(config.workspace_id(Some("prod")).unwrap(), "ws-prod");
        assert!(matches!(config.workspace_id(Some("qa")), Err(DeployError::Config(_))));
        assert!(matches!(config.workspace_id(None), Err(DeployError::Config(_))));
        assert!(config.unpublish_skipped(Some("prod")));
        assert!(!config.unpublish_skipped(Some("dev")));

        let filter = config.orphan_filter().unwrap();
        assert!(filter.allow_types.contains(&ItemType::LAKEHOUSE));
        assert!(filter.exclude.unwrap().is_match("DO_NOT_DELETE_me"));
        assert_eq!(filter.in_scope.unwrap().len(), 2);
    }

    #[test]
    fn retry_section_overrides_policy_fields() {
        let config = DeployConfig::from_toml_str(
            r#"
            [workspace]
            id = "ws"

            [retry]
            max_throttle_retries = 2
            base_delay_ms = 50
            throttle_padding_ms = 5000
            retryable_error_codes = ["ItemDisplayNameAlreadyInUse"]
            "#,
        )
        .unwrap();

        let policy = config.retry_policy().unwrap();
        assert!(policy.retries_error_code("ItemDisplayNameAlreadyInUse"));
        assert!(!RetryPolicy::default().retries_error_code("ItemDisplayNameAlreadyInUse"));
        assert_eq!(policy.max_throttle_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
        assert_eq!(policy.throttle_padding, Duration::from_secs(5));
        assert_eq!(policy.max_poll_attempts, RetryPolicy::default().max_poll_attempts);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let zero_workers = "[workspace]\nid = \"ws\"\n[parallel]\nmax_workers = 0\n";
        assert!(DeployConfig::from_toml_str(zero_workers).is_err());

        let bad_regex = "[workspace]\nid = \"ws\"\n[publish]\nexclude_regex = \"(\"\n";
        assert!(matches!(
            DeployConfig::from_toml_str(bad_regex),
            Err(DeployError::Config(_))
        ));

        let no_attempts = "[workspace]\nid = \"ws\"\n[retry]\nmax_transient_attempts = 0\n";
        assert!(matches!(
            DeployConfig::from_toml_str(no_attempts),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = DeployConfig::from_toml_str(MINIMAL).unwrap();
        config
            .apply_overrides(|key| match key {
                ENV_WORKSPACE_ID => Some("ws-env".to_string()),
                ENV_MAX_WORKERS => Some("9".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.workspace_id(None).unwrap(), "ws-env");
        assert_eq!(config.parallel.max_workers(), 9);

        let err = config
            .apply_overrides(|key| (key == ENV_MAX_WORKERS).then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn load_resolves_repository_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(&path, "[workspace]\nid = \"ws\"\nrepository_directory = \"items\"\n").unwrap();

        let config = DeployConfig::load(&path).unwrap();
        assert_eq!(config.workspace.repository_directory, dir.path().join("items"));
    }
}
