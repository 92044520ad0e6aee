//! Centralized configuration for the bridge.
//!
//! Constants live in [`RpcConfig`]; values operators can override at runtime
//! are read from the environment by [`RpcSettings::from_env`].

use std::path::PathBuf;
use std::time::Duration;

/// Bridge-wide constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 9998;
    pub const BLENDER_PORT: u16 = 9997;
    pub const UNREAL_PORT: u16 = 9998;

    /// How long a queued call may wait for the host main thread.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
    /// Interval between checks of a queued call's result slot.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Upper bound for a configured main-thread timeout.
    pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
    /// Extra time the HTTP client waits on top of the main-thread timeout.
    pub const HTTP_GRACE: Duration = Duration::from_secs(5);

    /// Recurring timer interval used by timer-driven hosts.
    pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);
    /// Maximum number of queued calls executed per host tick.
    pub const DRAIN_BUDGET: usize = 32;

    pub const RPC_PATH: &'static str = "/rpc";
    pub const HEALTH_PATH: &'static str = "/health";
}

/// Environment variable names understood by the bridge.
pub struct EnvVars;

impl EnvVars {
    pub const HOST: &'static str = "RPC_HOST";
    pub const PORT: &'static str = "RPC_PORT";
    pub const TIME_OUT: &'static str = "RPC_TIME_OUT";
    pub const SERVER_IP: &'static str = "RPC_SERVER_IP";
    pub const SERVER_LABEL_PREFIX: &'static str = "RPC_SERVER_";
    pub const ADDITIONAL_PATHS: &'static str = "RPC_ADDITIONAL_PYTHON_PATHS";
    pub const ADDITIONAL_SCRIPT_PATHS: &'static str = "RPC_ADDITIONAL_SCRIPT_PATHS";
    pub const DEBUG: &'static str = "RPC_DEBUG";
    pub const EXECUTION_HISTORY_FILE: &'static str = "RPC_EXECUTION_HISTORY_FILE";
    pub const TRACEBACK_FILE: &'static str = "RPC_TRACEBACK_FILE";
}

/// Runtime settings resolved from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcSettings {
    /// Address the server binds to.
    pub host: String,
    /// Port the server binds to.
    pub port: u16,
    /// Address clients connect to.
    pub server_ip: String,
    /// How long a queued call may wait for the host main thread.
    pub timeout: Duration,
    /// Explicit override for the search paths shipped with each callable.
    pub additional_paths: Vec<PathBuf>,
    pub debug: bool,
    pub execution_history_file: Option<PathBuf>,
    pub traceback_file: Option<PathBuf>,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            host: RpcConfig::DEFAULT_HOST.to_string(),
            port: RpcConfig::DEFAULT_PORT,
            server_ip: RpcConfig::DEFAULT_HOST.to_string(),
            timeout: RpcConfig::DEFAULT_TIMEOUT,
            additional_paths: Vec::new(),
            debug: false,
            execution_history_file: None,
            traceback_file: None,
        }
    }
}

impl RpcSettings {
    /// Read settings from the process environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let additional_paths = non_empty(EnvVars::ADDITIONAL_PATHS)
            .or_else(|| non_empty(EnvVars::ADDITIONAL_SCRIPT_PATHS))
            .map(|value| split_path_list(&value))
            .unwrap_or_default();

        Self {
            host: non_empty(EnvVars::HOST).unwrap_or(defaults.host),
            port: non_empty(EnvVars::PORT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            server_ip: non_empty(EnvVars::SERVER_IP).unwrap_or(defaults.server_ip),
            timeout: non_empty(EnvVars::TIME_OUT)
                .and_then(|v| v.parse::<f64>().ok())
                .and_then(parse_timeout)
                .unwrap_or(defaults.timeout),
            additional_paths,
            debug: non_empty(EnvVars::DEBUG)
                .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(false),
            execution_history_file: non_empty(EnvVars::EXECUTION_HISTORY_FILE).map(PathBuf::from),
            traceback_file: non_empty(EnvVars::TRACEBACK_FILE).map(PathBuf::from),
        }
    }
}

/// Human label for the server on `port`, used in connection errors.
///
/// Reads `RPC_SERVER_<port>` and falls back to a generic description.
pub fn server_label(port: u16) -> String {
    std::env::var(format!("{}{}", EnvVars::SERVER_LABEL_PREFIX, port))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("the RPC server on port {}", port))
}

/// Seconds to a timeout, capped at [`RpcConfig::MAX_TIMEOUT`].
fn parse_timeout(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(RpcConfig::MAX_TIMEOUT, |timeout| timeout.min(RpcConfig::MAX_TIMEOUT)),
    )
}

fn split_path_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = RpcSettings::from_lookup(|_| None);
        assert_eq!(settings, RpcSettings::default());
        assert_eq!(settings.timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_reads_environment_values() {
        let settings = RpcSettings::from_lookup(lookup(&[
            ("RPC_HOST", "0.0.0.0"),
            ("RPC_PORT", "9100"),
            ("RPC_TIME_OUT", "2.5"),
            ("RPC_SERVER_IP", "10.0.0.2"),
            ("RPC_ADDITIONAL_PYTHON_PATHS", "/a, /b,,"),
            ("RPC_DEBUG", "1"),
            ("RPC_TRACEBACK_FILE", "/tmp/tb.log"),
        ]));

        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.timeout, Duration::from_millis(2500));
        assert_eq!(settings.server_ip, "10.0.0.2");
        assert_eq!(
            settings.additional_paths,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert!(settings.debug);
        assert_eq!(settings.traceback_file, Some(PathBuf::from("/tmp/tb.log")));
        assert_eq!(settings.execution_history_file, None);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let settings = RpcSettings::from_lookup(lookup(&[
            ("RPC_PORT", "not-a-port"),
            ("RPC_TIME_OUT", "-3"),
            ("RPC_DEBUG", "false"),
        ]));
        assert_eq!(settings.port, RpcConfig::DEFAULT_PORT);
        assert_eq!(settings.timeout, RpcConfig::DEFAULT_TIMEOUT);
        assert!(!settings.debug);
    }

    #[test]
    fn test_huge_timeouts_are_capped() {
        for value in ["1e20", "1e300", "inf", "100000"] {
            let settings = RpcSettings::from_lookup(lookup(&[("RPC_TIME_OUT", value)]));
            assert_eq!(settings.timeout, RpcConfig::MAX_TIMEOUT, "{}", value);
        }
        let settings = RpcSettings::from_lookup(lookup(&[("RPC_TIME_OUT", "NaN")]));
        assert_eq!(settings.timeout, RpcConfig::DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_script_paths_alias() {
        let settings =
            RpcSettings::from_lookup(lookup(&[("RPC_ADDITIONAL_SCRIPT_PATHS", "/scripts")]));
        assert_eq!(settings.additional_paths, vec![PathBuf::from("/scripts")]);
    }

    #[test]
    fn test_server_label_default() {
        assert_eq!(server_label(1), "the RPC server on port 1");
    }
}
