// ABOUTME: Runtime configuration for the machine orchestrator
// ABOUTME: Loads workspace, runtime, logging and short-link settings from environment variables

pub mod constants;

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use constants::*;

pub const DEFAULT_WORKSPACE_DIR: &str = "workspace";
pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_LABEL_PREFIX: &str = "com.vmwebgui";
pub const DEFAULT_LOG_TAIL_LINES: usize = 500;
pub const DEFAULT_LOG_KILL_GRACE_MS: u64 = 1000;
pub const DEFAULT_USAGE_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_ACTIVITY_LOG: &str = "activity.log";
pub const DEFAULT_ACTIVITY_LOG_LIMIT: usize = 100;
pub const DEFAULT_SHORTLINK_URL: &str = "https://goto-tau.vercel.app";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("{0} cannot be empty")]
    Empty(&'static str),
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory holding one `container-<id>` directory per machine
    pub workspace_dir: PathBuf,
    /// Container runtime CLI binary
    pub docker_bin: String,
    /// Namespace for the labels attached to every machine container
    pub label_prefix: String,
    pub log_tail_lines: usize,
    /// How long a log follower gets to exit before it is killed
    pub log_kill_grace: Duration,
    pub usage_history_limit: usize,
    pub activity_log_path: PathBuf,
    pub activity_log_limit: usize,
    /// Directory holding `cloudflared` and `tunnel.sh`
    pub tunnel_assets_dir: PathBuf,
    pub shortlink_url: String,
    pub shortlink_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from(DEFAULT_WORKSPACE_DIR),
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
            log_kill_grace: Duration::from_millis(DEFAULT_LOG_KILL_GRACE_MS),
            usage_history_limit: DEFAULT_USAGE_HISTORY_LIMIT,
            activity_log_path: PathBuf::from(DEFAULT_ACTIVITY_LOG),
            activity_log_limit: DEFAULT_ACTIVITY_LOG_LIMIT,
            tunnel_assets_dir: PathBuf::from("."),
            shortlink_url: DEFAULT_SHORTLINK_URL.to_string(),
            shortlink_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Unset or blank
    /// variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = Config::default();

        let log_tail_lines = parse_limit(
            VMWEB_LOG_TAIL_LINES,
            get(VMWEB_LOG_TAIL_LINES),
            defaults.log_tail_lines,
        )?;
        let grace_ms = parse_limit(
            VMWEB_LOG_KILL_GRACE_MS,
            get(VMWEB_LOG_KILL_GRACE_MS),
            DEFAULT_LOG_KILL_GRACE_MS,
        )?;
        let usage_history_limit = parse_limit(
            VMWEB_USAGE_HISTORY_LIMIT,
            get(VMWEB_USAGE_HISTORY_LIMIT),
            defaults.usage_history_limit,
        )?;
        let activity_log_limit = parse_limit(
            VMWEB_ACTIVITY_LOG_LIMIT,
            get(VMWEB_ACTIVITY_LOG_LIMIT),
            defaults.activity_log_limit,
        )?;

        let label_prefix = get(VMWEB_LABEL_PREFIX).unwrap_or(defaults.label_prefix);
        if label_prefix.trim_matches('.').is_empty() {
            return Err(ConfigError::Empty(VMWEB_LABEL_PREFIX));
        }

        let shortlink_url = get(VMWEB_SHORTLINK_URL)
            .unwrap_or(defaults.shortlink_url)
            .trim_end_matches('/')
            .to_string();

        let config = Config {
            workspace_dir: get(VMWEB_WORKSPACE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_dir),
            docker_bin: get(VMWEB_DOCKER_BIN).unwrap_or(defaults.docker_bin),
            label_prefix,
            log_tail_lines,
            log_kill_grace: Duration::from_millis(grace_ms),
            usage_history_limit,
            activity_log_path: get(VMWEB_ACTIVITY_LOG)
                .map(PathBuf::from)
                .unwrap_or(defaults.activity_log_path),
            activity_log_limit,
            tunnel_assets_dir: get(VMWEB_TUNNEL_ASSETS_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.tunnel_assets_dir),
            shortlink_url,
            shortlink_token: get(VMWEB_SHORTLINK_TOKEN),
        };

        debug!(
            "Loaded configuration: workspace={}, runtime={}, labels={}",
            config.workspace_dir.display(),
            config.docker_bin,
            config.label_prefix
        );

        Ok(config)
    }

    /// Label key carrying the machine id, e.g. `com.vmwebgui.machine_id`
    pub fn label(&self, key: &str) -> String {
        format!("{}.{}", self.label_prefix.trim_end_matches('.'), key)
    }
}

fn parse_limit<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = ParseIntError> + PartialEq + Default,
{
    let Some(raw) = raw else {
        return Ok(default);
    };

    let value = raw
        .parse::<T>()
        .map_err(|source| ConfigError::InvalidNumber { name, source })?;

    if value == T::default() {
        return Err(ConfigError::ZeroLimit(name));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.usage_history_limit, 100);
        assert_eq!(config.log_tail_lines, 500);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            (VMWEB_WORKSPACE_DIR, "/srv/machines"),
            (VMWEB_DOCKER_BIN, "podman"),
            (VMWEB_LOG_KILL_GRACE_MS, "250"),
            (VMWEB_SHORTLINK_URL, "https://short.example/"),
            (VMWEB_SHORTLINK_TOKEN, "secret"),
        ]))
        .unwrap();

        assert_eq!(config.workspace_dir, PathBuf::from("/srv/machines"));
        assert_eq!(config.docker_bin, "podman");
        assert_eq!(config.log_kill_grace, Duration::from_millis(250));
        assert_eq!(config.shortlink_url, "https://short.example");
        assert_eq!(config.shortlink_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = Config::from_lookup(lookup(&[(VMWEB_DOCKER_BIN, "   ")])).unwrap();
        assert_eq!(config.docker_bin, DEFAULT_DOCKER_BIN);
    }

    #[rstest]
    #[case(VMWEB_LOG_TAIL_LINES, "lots")]
    #[case(VMWEB_USAGE_HISTORY_LIMIT, "-1")]
    #[case(VMWEB_ACTIVITY_LOG_LIMIT, "1.5")]
    fn test_invalid_numbers_rejected(#[case] name: &str, #[case] value: &str) {
        let result = Config::from_lookup(lookup(&[(name, value)]));
        assert!(matches!(result, Err(ConfigError::InvalidNumber { .. })));
    }

    #[rstest]
    #[case(VMWEB_LOG_TAIL_LINES)]
    #[case(VMWEB_USAGE_HISTORY_LIMIT)]
    #[case(VMWEB_LOG_KILL_GRACE_MS)]
    fn test_zero_limits_rejected(#[case] name: &str) {
        let result = Config::from_lookup(lookup(&[(name, "0")]));
        assert!(matches!(result, Err(ConfigError::ZeroLimit(_))));
    }

    #[test]
    fn test_label_keys() {
        let config = Config::default();
        assert_eq!(config.label("machine_id"), "com.vmwebgui.machine_id");
    }
}
