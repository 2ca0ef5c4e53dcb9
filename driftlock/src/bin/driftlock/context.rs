use anyhow::{Context, Result};
use driftlock::LockLease;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project context for driftlock operations
pub struct ProjectContext {
    /// Root directory of the project (where driftlock.toml is)
    pub project_root: PathBuf,
    /// Path to the migrations directory
    pub migrations_dir: PathBuf,
    /// Loaded configuration
    pub config: DriftlockConfig,
}

/// Configuration stored in driftlock.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftlockConfig {
    #[serde(default)]
    pub driftlock: DriftlockSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub lock: LockSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftlockSettings {
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: String,
    /// Key prefix for all driftlock-managed keys in the target database.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for DriftlockSettings {
    fn default() -> Self {
        Self {
            migrations_dir: default_migrations_dir(),
            prefix: default_prefix(),
        }
    }
}

fn default_migrations_dir() -> String {
    "migrations".to_string()
}

fn default_prefix() -> String {
    "driftlock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "${REDIS_URL}".to_string()
}

/// Lock lease tuning. Defaults match `LockLease::default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    250
}

pub const CONFIG_FILE: &str = "driftlock.toml";

impl ProjectContext {
    /// Find and load project context from current directory or ancestors
    pub fn find() -> Result<Self> {
        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::find_from(&current_dir)
    }

    /// Find project context starting from the given directory.
    ///
    /// Walks ancestors looking for driftlock.toml. When none exists the
    /// start directory becomes the root and defaults apply throughout.
    pub fn find_from(start: &Path) -> Result<Self> {
        let project_root = Self::find_project_root(start).unwrap_or_else(|| start.to_path_buf());
        Self::from_root(project_root)
    }

    /// Create context from a known project root
    pub fn from_root(project_root: PathBuf) -> Result<Self> {
        let config_path = project_root.join(CONFIG_FILE);

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {CONFIG_FILE}"))?;
            toml::from_str(&content).with_context(|| format!("Failed to parse {CONFIG_FILE}"))?
        } else {
            DriftlockConfig::default()
        };

        let migrations_dir = project_root.join(&config.driftlock.migrations_dir);

        Ok(Self {
            project_root,
            migrations_dir,
            config,
        })
    }

    fn find_project_root(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();

        loop {
            if current.join(CONFIG_FILE).exists() {
                return Some(current);
            }

            if !current.pop() {
                return None;
            }
        }
    }

    /// Get the Redis URL, expanding environment variables
    pub fn redis_url(&self) -> Result<String> {
        let url = self.config.redis.url.as_str();

        if url.starts_with("${") && url.ends_with('}') {
            let var_name = &url[2..url.len() - 1];
            std::env::var(var_name)
                .with_context(|| format!("Environment variable {var_name} not set"))
        } else {
            Ok(url.to_string())
        }
    }

    /// Lock lease built from the configured timings
    pub fn lock_lease(&self) -> LockLease {
        LockLease {
            ttl: Duration::from_secs(self.config.lock.ttl_secs),
            acquire_timeout: Duration::from_secs(self.config.lock.acquire_timeout_secs),
            retry_interval: Duration::from_millis(self.config.lock.retry_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = DriftlockConfig::default();
        assert_eq!(config.driftlock.migrations_dir, "migrations");
        assert_eq!(config.driftlock.prefix, "driftlock");
        assert_eq!(config.redis.url, "${REDIS_URL}");
        assert_eq!(config.lock.ttl_secs, 30);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: DriftlockConfig = toml::from_str(
            r#"
            [driftlock]
            prefix = "myapp"

            [lock]
            ttl_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.driftlock.prefix, "myapp");
        assert_eq!(config.driftlock.migrations_dir, "migrations");
        assert_eq!(config.lock.ttl_secs, 60);
        assert_eq!(config.lock.acquire_timeout_secs, 10);
    }

    #[test]
    fn config_is_found_in_an_ancestor_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE),
            "[driftlock]\nmigrations_dir = \"db/migrations\"\n",
        )
        .unwrap();

        let nested = root.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let ctx = ProjectContext::find_from(&nested).unwrap();
        assert_eq!(ctx.project_root, root.path());
        assert_eq!(ctx.migrations_dir, root.path().join("db/migrations"));
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::find_from(dir.path()).unwrap();
        assert_eq!(ctx.migrations_dir, dir.path().join("migrations"));
        assert_eq!(ctx.config.driftlock.prefix, "driftlock");
    }
}
