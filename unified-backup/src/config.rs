//! Configuration management for the orchestrator.
//!
//! Loads configuration from a TOML file with `UNIFIED_BACKUP__SECTION__KEY`
//! environment overrides. Repository secrets never appear in the file itself:
//! it names the environment variables (or a file) to read them from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::RunOptions;
use crate::orchestrator::{Operation, Task};
use crate::repository::{Repository, RetentionWindow, PASSWORD_ENV};
use crate::retry::RetryPolicy;
use crate::utils::{OrchestratorError, Result};

const ENV_PREFIX: &str = "UNIFIED_BACKUP";
const HOSTNAME_PLACEHOLDER: &str = "{hostname}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine binary name (looked up on PATH) or absolute path
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Upper bound for a single engine call
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles for each further retry
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep snapshots newer than this (engine duration syntax, e.g. "7d")
    #[serde(default = "default_keep_within")]
    pub keep_within: String,

    #[serde(default = "default_true")]
    pub prune_after_backup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_true")]
    pub require_root: bool,

    #[serde(default = "default_max_concurrent_repositories")]
    pub max_concurrent_repositories: usize,

    #[serde(default)]
    pub unlock_before_restore: bool,

    /// Warn below this much free space on a restore target (0 disables)
    #[serde(default = "default_min_free_space_gb")]
    pub min_free_space_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file, created with mode 0600
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,

    /// Engine connection string; `{hostname}` expands to this host's name
    pub location: String,

    /// Variable holding the passphrase (defaults to RESTIC_PASSWORD)
    #[serde(default)]
    pub password_env: Option<String>,

    /// File holding the passphrase; takes precedence over `password_env`
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

/// One engine environment variable, copied from a host environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Name the engine expects, e.g. B2_ACCOUNT_ID
    pub variable: String,

    /// Host variable to read the value from; defaults to `variable`
    #[serde(default)]
    pub env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub repository: String,
    pub operation: Operation,

    /// Backup source or restore target
    pub path: PathBuf,

    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default)]
    pub verify_paths: Vec<PathBuf>,
}

// Default values
fn default_binary() -> String {
    "restic".to_string()
}

fn default_command_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_keep_within() -> String {
    "7d".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_repositories() -> usize {
    1
}

fn default_min_free_space_gb() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_within: default_keep_within(),
            prune_after_backup: true,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            require_root: true,
            max_concurrent_repositories: default_max_concurrent_repositories(),
            unlock_before_restore: false,
            min_free_space_gb: default_min_free_space_gb(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let source = config::File::from(path).format(config::FileFormat::Toml);
        Self::build(source)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::build(config::File::from_str(content, config::FileFormat::Toml))
    }

    fn build<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .add_source(source)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no secrets.
    pub fn validate(&self) -> Result<()> {
        let mut repo_names = HashSet::new();
        for repo in &self.repositories {
            if repo.location.trim().is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "repository '{}' has an empty location",
                    repo.name
                )));
            }
            if !repo_names.insert(repo.name.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "repository '{}' is defined more than once",
                    repo.name
                )));
            }
        }

        // Repeated task names are a per-task failure reported by the run.
        for task in &self.tasks {
            if !repo_names.contains(task.repository.as_str()) {
                return Err(OrchestratorError::UnknownRepository {
                    task: task.name.clone(),
                    repository: task.repository.clone(),
                });
            }
            if task.operation == Operation::Restore && !task.excludes.is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "restore task '{}' cannot have excludes",
                    task.name
                )));
            }
        }

        if self.run.max_concurrent_repositories == 0 {
            return Err(OrchestratorError::Config(
                "run.max_concurrent_repositories must be at least 1".to_string(),
            ));
        }

        self.retention.keep_within.parse::<RetentionWindow>()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_secs(self.retry.base_delay_secs),
        )
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.command_timeout_secs)
    }

    pub fn retention_window(&self) -> Result<RetentionWindow> {
        self.retention.keep_within.parse()
    }

    pub fn run_options(&self) -> Result<RunOptions> {
        Ok(RunOptions {
            retention: if self.retention.prune_after_backup {
                Some(self.retention_window()?)
            } else {
                None
            },
            unlock_before_restore: self.run.unlock_before_restore,
            min_free_space_gb: (self.run.min_free_space_gb > 0).then_some(self.run.min_free_space_gb),
            max_concurrent_repositories: self.run.max_concurrent_repositories,
        })
    }

    /// Resolve every repository's secrets from the process environment.
    pub fn repositories(&self) -> Result<Vec<Repository>> {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        self.repositories_with(|key| std::env::var(key).ok(), &host)
    }

    pub fn repositories_with<F>(&self, lookup: F, host: &str) -> Result<Vec<Repository>>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.repositories
            .iter()
            .map(|repo| resolve_repository(repo, &lookup, host))
            .collect()
    }

    /// Build tasks against already-resolved repositories, in file order.
    pub fn tasks(&self, repositories: &[Repository]) -> Result<Vec<Task>> {
        self.tasks
            .iter()
            .map(|task| {
                let repository = repositories
                    .iter()
                    .find(|r| r.name == task.repository)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::UnknownRepository {
                        task: task.name.clone(),
                        repository: task.repository.clone(),
                    })?;

                Ok(Task {
                    name: task.name.clone(),
                    repository,
                    local_path: task.path.clone(),
                    excludes: task.excludes.clone(),
                    operation: task.operation,
                    verify_paths: task.verify_paths.clone(),
                })
            })
            .collect()
    }
}

fn resolve_repository<F>(repo: &RepositoryConfig, lookup: &F, host: &str) -> Result<Repository>
where
    F: Fn(&str) -> Option<String>,
{
    let passphrase = match (&repo.password_file, &repo.password_env) {
        (Some(file), _) => std::fs::read_to_string(file)
            .map(|s| s.trim_end_matches(['\n', '\r']).to_string())
            .map_err(|e| {
                OrchestratorError::Config(format!(
                    "repository '{}': cannot read password file {}: {e}",
                    repo.name,
                    file.display()
                ))
            })?,
        (None, env) => {
            let var = env.as_deref().unwrap_or(PASSWORD_ENV);
            lookup(var).ok_or_else(|| {
                OrchestratorError::Config(format!(
                    "repository '{}': password variable {var} is not set",
                    repo.name
                ))
            })?
        }
    };

    let location = repo.location.replace(HOSTNAME_PLACEHOLDER, host);
    let mut resolved = Repository::new(&repo.name, location, passphrase);

    for cred in &repo.credentials {
        let source = cred.env.as_deref().unwrap_or(&cred.variable);
        let value = lookup(source).ok_or_else(|| {
            OrchestratorError::Config(format!(
                "repository '{}': credential variable {source} is not set",
                repo.name
            ))
        })?;
        resolved = resolved.with_credential(&cred.variable, value);
    }

    Ok(resolved)
}
