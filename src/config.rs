use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration for the credits engine. Every timing knob of the
/// reconciliation flow lives here so deployments can tune them without a
/// rebuild; the defaults are the contract values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditsConfig {
    pub backend_base_url: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub request_timeout_ms: u64,
    /// One-shot grace wait before giving up on an unloaded checkout widget.
    pub widget_ready_wait_ms: u64,
    /// The widget needs this long to internalize a pushed session before
    /// checkout can open.
    pub session_settle_ms: u64,
    pub balance_poll_interval_ms: u64,
    pub attempt_deadline_secs: u64,
    pub surface_watch_deadline_secs: u64,
    pub surface_poll_interval_ms: u64,
    pub surface_discovery_retry_ms: u64,
    /// Delays between balance re-fetches after an order-complete signal.
    /// The first entry is the wait before the initial fetch.
    pub completion_refresh_delays_ms: Vec<u64>,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            backend_base_url: "https://quillia.app".to_owned(),
            user_id: String::new(),
            user_email: None,
            request_timeout_ms: 5_000,
            widget_ready_wait_ms: 500,
            session_settle_ms: 200,
            balance_poll_interval_ms: 4_000,
            attempt_deadline_secs: 60,
            surface_watch_deadline_secs: 60,
            surface_poll_interval_ms: 500,
            surface_discovery_retry_ms: 1_000,
            completion_refresh_delays_ms: vec![0, 2_000, 2_500],
        }
    }
}

impl CreditsConfig {
    pub fn load_or_create() -> Result<(Self, PathBuf)> {
        let config_dir = dirs::config_dir()
            .context("unable to locate OS config directory")?
            .join("quillia-credits");
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed creating config dir at {}", config_dir.display()))?;

        let config_path = config_dir.join("config.json");
        if !config_path.exists() {
            let default = Self::default();
            default.save(&config_path)?;
            return Ok((default, config_path));
        }

        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("failed reading {}", config_path.display()))?;
        let config = serde_json::from_str::<Self>(&text)
            .with_context(|| format!("invalid json in {}", config_path.display()))?;
        Ok((config, config_path))
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("failed serializing config")?;
        fs::write(path, payload).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn widget_ready_wait(&self) -> Duration {
        Duration::from_millis(self.widget_ready_wait_ms)
    }

    pub fn session_settle(&self) -> Duration {
        Duration::from_millis(self.session_settle_ms)
    }

    pub fn balance_poll_interval(&self) -> Duration {
        Duration::from_millis(self.balance_poll_interval_ms.max(100))
    }

    pub fn attempt_deadline(&self) -> Duration {
        Duration::from_secs(self.attempt_deadline_secs.max(1))
    }

    pub fn surface_watch_deadline(&self) -> Duration {
        Duration::from_secs(self.surface_watch_deadline_secs.max(1))
    }

    pub fn surface_poll_interval(&self) -> Duration {
        Duration::from_millis(self.surface_poll_interval_ms.max(50))
    }

    pub fn surface_discovery_retry(&self) -> Duration {
        Duration::from_millis(self.surface_discovery_retry_ms)
    }

    pub fn completion_refresh_delays(&self) -> Vec<Duration> {
        self.completion_refresh_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::CreditsConfig;
    use std::time::Duration;

    #[test]
    fn parses_partial_config_with_defaults() {
        let raw = r#"{
            "backend_base_url": "https://staging.quillia.app",
            "user_id": "user-77"
        }"#;
        let parsed: CreditsConfig = serde_json::from_str(raw).expect("config should parse");
        assert_eq!(parsed.backend_base_url, "https://staging.quillia.app");
        assert_eq!(parsed.user_id, "user-77");
        assert_eq!(parsed.balance_poll_interval_ms, 4_000);
        assert_eq!(parsed.attempt_deadline_secs, 60);
        assert_eq!(parsed.completion_refresh_delays_ms, vec![0, 2_000, 2_500]);
    }

    #[test]
    fn duration_helpers_clamp_degenerate_values() {
        let config = CreditsConfig {
            balance_poll_interval_ms: 0,
            attempt_deadline_secs: 0,
            surface_poll_interval_ms: 0,
            ..CreditsConfig::default()
        };
        assert_eq!(config.balance_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.attempt_deadline(), Duration::from_secs(1));
        assert_eq!(config.surface_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn refresh_delays_convert_in_order() {
        let config = CreditsConfig::default();
        let delays = config.completion_refresh_delays();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(0),
                Duration::from_millis(2_000),
                Duration::from_millis(2_500)
            ]
        );
    }
}
