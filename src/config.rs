use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{LabelSpec, RepositoryConfig};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    pub repository: RepositoryConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL to the API root (e.g. `https://api.github.com`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Value sent in the `X-GitHub-Api-Version` header.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Name of the environment variable that holds the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request transport timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_version: default_api_version(),
            token_env: default_token_env(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_api_version() -> String {
    "2022-11-28".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_user_agent() -> String {
    concat!("forgepublish/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Source tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Local directory whose contents are published.
    pub path: PathBuf,
    /// File names that are always collected, even inside excluded directories.
    #[serde(default = "default_always_include")]
    pub always_include: BTreeSet<String>,
    /// Directory names or file-name globs that are never collected.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Largest blob, in bytes, that will be sent to the remote.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_always_include() -> BTreeSet<String> {
    [
        "README.md",
        "LICENSE",
        ".gitignore",
        "CONTRIBUTING.md",
        "SECURITY.md",
        ".env.example",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_exclude() -> Vec<String> {
    [
        "node_modules",
        ".git",
        "target",
        "dist",
        "build",
        "__pycache__",
        ".venv",
        "venv",
        ".idea",
        ".vscode",
        "coverage",
        ".next",
        ".nuxt",
        ".env",
        ".env.local",
        "*.log",
        "*.tmp",
        "package-lock.json",
        "Cargo.lock",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Publish run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
    /// Run against an in-memory object store instead of the remote API.
    #[serde(default)]
    pub dry_run: bool,
    /// Exit non-zero when any file was skipped or failed, even though the
    /// branch was updated.
    #[serde(default)]
    pub fail_on_partial_upload: bool,
    /// How many times to poll for the auto-initialised head commit after the
    /// repository is created.
    #[serde(default = "default_init_poll_attempts")]
    pub init_poll_attempts: u32,
    #[serde(default = "default_init_poll_interval")]
    pub init_poll_interval_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            commit_message: default_commit_message(),
            dry_run: false,
            fail_on_partial_upload: false,
            init_poll_attempts: default_init_poll_attempts(),
            init_poll_interval_ms: default_init_poll_interval(),
        }
    }
}

fn default_commit_message() -> String {
    "Initial commit".to_string()
}

fn default_init_poll_attempts() -> u32 {
    10
}

fn default_init_poll_interval() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Request pacing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingMode {
    /// No delay between uploads.
    None,
    /// Fixed minimum interval between uploads.
    Fixed,
    /// Minimum interval plus waiting out the rate-limit window when the
    /// server reports the budget is nearly spent.
    #[default]
    Adaptive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    #[serde(default)]
    pub mode: PacingMode,
    /// Minimum gap between consecutive blob uploads.
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    /// Minimum number of API calls to keep in reserve before self-throttling.
    #[serde(default = "default_rate_limit_buffer")]
    pub rate_limit_buffer: u32,
    /// Upper bound on a single self-throttling sleep.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            mode: PacingMode::default(),
            min_interval_ms: default_min_interval(),
            rate_limit_buffer: default_rate_limit_buffer(),
            max_wait_secs: default_max_wait(),
        }
    }
}

fn default_min_interval() -> u64 {
    50
}

fn default_rate_limit_buffer() -> u32 {
    100
}

fn default_max_wait() -> u64 {
    900
}

// ---------------------------------------------------------------------------
// Logging / metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Write an OpenMetrics text snapshot here when the run finishes.
    pub textfile: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config =
        serde_yaml::from_str(contents).context("invalid YAML configuration")?;
    config.repository.topics = config
        .repository
        .topics
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let repo = &config.repository;
    anyhow::ensure!(!repo.name.is_empty(), "repository.name must not be empty");
    anyhow::ensure!(
        repo.name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "repository.name may only contain ASCII letters, digits, '-', '_' and '.'"
    );
    anyhow::ensure!(
        repo.topics.len() <= 20,
        "at most 20 repository topics are allowed"
    );
    for topic in &repo.topics {
        anyhow::ensure!(
            topic.len() <= 50 && topic.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'),
            "invalid topic '{topic}': use lowercase letters, digits and hyphens (max 50)"
        );
    }
    for label in &repo.labels {
        validate_label(label)?;
    }
    anyhow::ensure!(
        config.source.max_file_size > 0,
        "source.max_file_size must be positive"
    );
    anyhow::ensure!(
        !config.publish.commit_message.trim().is_empty(),
        "publish.commit_message must not be empty"
    );
    anyhow::ensure!(
        config.upstream.request_timeout_secs > 0,
        "upstream.request_timeout_secs must be positive"
    );
    for pattern in &config.source.exclude {
        glob::Pattern::new(pattern)
            .with_context(|| format!("invalid exclude pattern '{pattern}'"))?;
    }
    Ok(())
}

fn validate_label(label: &LabelSpec) -> Result<()> {
    anyhow::ensure!(!label.name.is_empty(), "label name must not be empty");
    anyhow::ensure!(
        label.color.len() == 6 && label.color.chars().all(|c| c.is_ascii_hexdigit()),
        "label '{}' color must be six hex digits",
        label.name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Visibility;

    const MINIMAL: &str = r#"
repository:
  name: demo
source:
  path: ./site
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.upstream.api_url, "https://api.github.com");
        assert_eq!(config.upstream.token_env, "GITHUB_TOKEN");
        assert_eq!(config.repository.visibility, Visibility::Public);
        assert!(config.source.always_include.contains("README.md"));
        assert!(config.source.exclude.iter().any(|p| p == "node_modules"));
        assert_eq!(config.source.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.pacing.mode, PacingMode::Adaptive);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.metrics.textfile.is_none());
        assert!(!config.publish.fail_on_partial_upload);
    }

    #[test]
    fn topics_are_normalized_into_a_set() {
        let config = parse_config(
            r#"
repository:
  name: demo
  visibility: private
  topics: ["Rust", "cli", "rust", " tauri "]
source:
  path: ./site
"#,
        )
        .unwrap();
        let topics: Vec<_> = config.repository.topics.iter().cloned().collect();
        assert_eq!(topics, vec!["cli", "rust", "tauri"]);
        assert_eq!(config.repository.visibility, Visibility::Private);
    }

    #[test]
    fn rejects_bad_repository_name() {
        let err = parse_config(
            r#"
repository:
  name: "has spaces"
source:
  path: ./site
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("repository.name"));
    }

    #[test]
    fn rejects_bad_label_color() {
        let err = parse_config(
            r#"
repository:
  name: demo
  labels:
    - name: bug
      color: red
source:
  path: ./site
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("six hex digits"));
    }

    #[test]
    fn rejects_invalid_exclude_glob() {
        let err = parse_config(
            r#"
repository:
  name: demo
source:
  path: ./site
  exclude: ["[unclosed"]
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid exclude pattern"));
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../forgepublish.example.yaml")).unwrap();
        assert_eq!(config.repository.name, "my-project");
        assert_eq!(config.repository.labels.len(), 1);
        assert_eq!(config.pacing.mode, PacingMode::Adaptive);
        assert_eq!(config.publish.init_poll_attempts, 10);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config("/nonexistent/forgepublish.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }
}
