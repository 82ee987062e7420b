use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "articlestatus/0.1";
pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_COURSE_BATCH_SIZE: usize = 1000;
pub const DEFAULT_UPDATE_GRACE_DAYS: u64 = 30;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StatusConfig {
    #[serde(default)]
    pub status: StatusSection,
    #[serde(default)]
    pub remote: RemoteSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StatusSection {
    pub chunk_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub course_batch_size: Option<usize>,
    pub update_grace_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

/// Reconciliation knobs after env > config > default resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSettings {
    /// Page ids per remote lookup chunk.
    pub chunk_size: usize,
    /// Number of course groups processed in parallel.
    pub concurrency: usize,
    /// Articles fed to one reconciliation pass.
    pub course_batch_size: usize,
    /// Days after a course ends during which it is still considered current.
    pub update_grace_days: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            course_batch_size: DEFAULT_COURSE_BATCH_SIZE,
            update_grace_days: DEFAULT_UPDATE_GRACE_DAYS,
        }
    }
}

impl StatusConfig {
    pub fn settings(&self) -> Result<StatusSettings> {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn settings_with_lookup<F>(&self, lookup_env: F) -> Result<StatusSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = StatusSettings {
            chunk_size: resolve_number(
                &lookup_env,
                "ARTICLESTATUS_CHUNK_SIZE",
                self.status.chunk_size,
                DEFAULT_CHUNK_SIZE,
            )?,
            concurrency: resolve_number(
                &lookup_env,
                "ARTICLESTATUS_CONCURRENCY",
                self.status.concurrency,
                DEFAULT_CONCURRENCY,
            )?,
            course_batch_size: resolve_number(
                &lookup_env,
                "ARTICLESTATUS_COURSE_BATCH_SIZE",
                self.status.course_batch_size,
                DEFAULT_COURSE_BATCH_SIZE,
            )?,
            update_grace_days: resolve_number(
                &lookup_env,
                "ARTICLESTATUS_UPDATE_GRACE_DAYS",
                self.status.update_grace_days,
                DEFAULT_UPDATE_GRACE_DAYS,
            )?,
        };

        if settings.chunk_size == 0 {
            bail!("status.chunk_size must be greater than zero");
        }
        if settings.concurrency == 0 {
            bail!("status.concurrency must be greater than zero");
        }
        if settings.course_batch_size == 0 {
            bail!("status.course_batch_size must be greater than zero");
        }
        Ok(settings)
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.user_agent_with_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn user_agent_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup_env("WIKI_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.remote
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

pub(crate) fn resolve_number<F, T>(
    lookup_env: &F,
    key: &str,
    configured: Option<T>,
    default: T,
) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup_env(key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return trimmed.parse::<T>().map_err(|_| {
                anyhow::anyhow!("{key} must be a non-negative integer, got `{trimmed}`")
            });
        }
    }
    Ok(configured.unwrap_or(default))
}

/// Load and parse a StatusConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<StatusConfig> {
    if !config_path.exists() {
        return Ok(StatusConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: StatusConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_resolves_to_defaults() {
        let settings = StatusConfig::default()
            .settings_with_lookup(|_| None)
            .expect("settings");
        assert_eq!(settings, StatusSettings::default());
        assert_eq!(settings.chunk_size, 100);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, StatusConfig::default());
    }

    #[test]
    fn load_config_parses_status_and_remote_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[status]
chunk_size = 50
concurrency = 8

[remote]
user_agent = "test-agent/1.0"
max_retries = 5
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.status.chunk_size, Some(50));
        assert_eq!(config.status.concurrency, Some(8));
        assert_eq!(config.status.course_batch_size, None);
        assert_eq!(config.remote.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.remote.max_retries, Some(5));

        let settings = config.settings_with_lookup(|_| None).expect("settings");
        assert_eq!(settings.chunk_size, 50);
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.course_batch_size, DEFAULT_COURSE_BATCH_SIZE);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[status\nchunk_size = 1").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_overrides_config_values() {
        let config = StatusConfig {
            status: StatusSection {
                chunk_size: Some(20),
                ..StatusSection::default()
            },
            ..StatusConfig::default()
        };
        let env = HashMap::from([
            ("ARTICLESTATUS_CHUNK_SIZE".to_string(), " 7 ".to_string()),
            ("ARTICLESTATUS_CONCURRENCY".to_string(), "2".to_string()),
        ]);
        let settings = config
            .settings_with_lookup(|key| env.get(key).cloned())
            .expect("settings");
        assert_eq!(settings.chunk_size, 7);
        assert_eq!(settings.concurrency, 2);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = StatusConfig {
            status: StatusSection {
                chunk_size: Some(0),
                ..StatusSection::default()
            },
            ..StatusConfig::default()
        };
        let error = config.settings_with_lookup(|_| None).expect_err("must fail");
        assert!(error.to_string().contains("chunk_size"));
    }

    #[test]
    fn malformed_env_value_is_an_error() {
        let env = HashMap::from([("ARTICLESTATUS_CONCURRENCY".to_string(), "many".to_string())]);
        let error = StatusConfig::default()
            .settings_with_lookup(|key| env.get(key).cloned())
            .expect_err("must fail");
        assert!(error.to_string().contains("ARTICLESTATUS_CONCURRENCY"));
    }

    #[test]
    fn default_user_agent() {
        assert_eq!(
            StatusConfig::default().user_agent_with_lookup(|_| None),
            "articlestatus/0.1"
        );
    }

    #[test]
    fn user_agent_env_overrides_config() {
        let config = StatusConfig {
            remote: RemoteSection {
                user_agent: Some("from-config/1.0".to_string()),
                ..RemoteSection::default()
            },
            ..StatusConfig::default()
        };
        assert_eq!(config.user_agent_with_lookup(|_| None), "from-config/1.0");

        let env = HashMap::from([("WIKI_USER_AGENT".to_string(), "from-env/2.0".to_string())]);
        assert_eq!(
            config.user_agent_with_lookup(|key| env.get(key).cloned()),
            "from-env/2.0"
        );
    }
}
