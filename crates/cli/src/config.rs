use std::path::PathBuf;
use std::time::Duration;

use geoflip_transform::backoff::PollConfig;

/// Default Geoflip deployment.
pub const DEFAULT_API_URL: &str = "https://api.geoflip.io";

/// Errors while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("Cannot determine a state directory; set GEOFLIP_STATE_PATH")]
    NoStateDir,
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the Geoflip API.
    pub api_url: String,
    /// JSON file holding the export ledger and session.
    pub state_path: PathBuf,
    pub poll: PollConfig,
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                              |
    /// |----------------------------|--------------------------------------|
    /// | `GEOFLIP_API_URL`          | `https://api.geoflip.io`             |
    /// | `GEOFLIP_STATE_PATH`       | `<data dir>/geoflip/state.json`      |
    /// | `GEOFLIP_POLL_INITIAL_MS`  | `1000`                               |
    /// | `GEOFLIP_POLL_INTERVAL_MS` | `4000`                               |
    /// | `GEOFLIP_POLL_MAX_ERRORS`  | `10` (`0` retries forever)           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("GEOFLIP_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.into());

        let state_path = match lookup("GEOFLIP_STATE_PATH").filter(|v| !v.trim().is_empty()) {
            Some(path) => PathBuf::from(path),
            None => default_state_path().ok_or(ConfigError::NoStateDir)?,
        };

        let defaults = PollConfig::default();
        let initial_delay =
            millis(&lookup, "GEOFLIP_POLL_INITIAL_MS")?.unwrap_or(defaults.initial_delay);
        let interval = millis(&lookup, "GEOFLIP_POLL_INTERVAL_MS")?.unwrap_or(defaults.interval);
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "GEOFLIP_POLL_INTERVAL_MS",
                expected: "a positive number of milliseconds",
                value: "0".into(),
            });
        }

        let max_consecutive_errors = match lookup("GEOFLIP_POLL_MAX_ERRORS") {
            None => defaults.max_consecutive_errors,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(0) => None,
                Ok(n) => Some(n),
                Err(_) => {
                    return Err(ConfigError::Invalid {
                        var: "GEOFLIP_POLL_MAX_ERRORS",
                        expected: "a non-negative integer",
                        value: raw,
                    })
                }
            },
        };

        Ok(Self {
            api_url,
            state_path,
            poll: PollConfig {
                initial_delay,
                interval,
                max_consecutive_errors,
                ..defaults
            },
        })
    }
}

fn default_state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("geoflip").join("state.json"))
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::Invalid {
            var,
            expected: "a number of milliseconds",
            value: raw,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("GEOFLIP_STATE_PATH", "/tmp/geoflip.json")]).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.state_path, PathBuf::from("/tmp/geoflip.json"));
        assert_eq!(config.poll, PollConfig::default());
    }

    #[test]
    fn poll_settings_override() {
        let config = config(&[
            ("GEOFLIP_STATE_PATH", "/tmp/geoflip.json"),
            ("GEOFLIP_API_URL", "http://localhost:8000"),
            ("GEOFLIP_POLL_INITIAL_MS", "250"),
            ("GEOFLIP_POLL_INTERVAL_MS", "2000"),
            ("GEOFLIP_POLL_MAX_ERRORS", "0"),
        ])
        .unwrap();

        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.poll.initial_delay, Duration::from_millis(250));
        assert_eq!(config.poll.interval, Duration::from_secs(2));
        assert_eq!(config.poll.max_consecutive_errors, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            config(&[("GEOFLIP_STATE_PATH", "/tmp/x"), ("GEOFLIP_POLL_INTERVAL_MS", "soon")]),
            Err(ConfigError::Invalid { var: "GEOFLIP_POLL_INTERVAL_MS", .. })
        );
        assert_matches!(
            config(&[("GEOFLIP_STATE_PATH", "/tmp/x"), ("GEOFLIP_POLL_INTERVAL_MS", "0")]),
            Err(ConfigError::Invalid { .. })
        );
        assert_matches!(
            config(&[("GEOFLIP_STATE_PATH", "/tmp/x"), ("GEOFLIP_POLL_MAX_ERRORS", "-1")]),
            Err(ConfigError::Invalid { var: "GEOFLIP_POLL_MAX_ERRORS", .. })
        );
    }
}
