use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::CreditsConfig,
    error::{CreditsError, Result},
};

/// Read-only copy of the backend-owned balance. The client never treats
/// this as authoritative for local arithmetic; it only compares before
/// and after to infer purchase success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub credits: u64,
    pub is_low: bool,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BalanceWire {
    credits: u64,
    #[serde(rename = "isLow", default)]
    is_low: bool,
}

#[derive(Debug, Serialize)]
struct CheckoutAuditWire<'a> {
    user_id: &'a str,
    package_key: &'a str,
}

/// Backend REST surface the engine consumes: one side-effect-free balance
/// read that is safe to poll, and two fire-and-forget audit notifications.
#[async_trait]
pub trait CreditsApi: Send + Sync {
    async fn fetch_balance(&self) -> Result<BalanceSnapshot>;
    async fn notify_checkout_started(&self, package_key: &str) -> Result<()>;
    async fn notify_checkout_completed(&self, package_key: &str) -> Result<()>;
}

pub type DynCreditsApi = Arc<dyn CreditsApi>;

pub struct HttpCreditsApi {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
}

impl HttpCreditsApi {
    pub fn new(config: &CreditsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.backend_base_url.trim_end_matches('/').to_owned(),
            user_id: config.user_id.clone(),
        })
    }

    fn balance_endpoint(&self) -> String {
        format!("{}/api/users/{}/credits", self.base_url, self.user_id)
    }

    fn audit_endpoint(&self, leg: &str) -> String {
        format!("{}/api/checkout/{leg}", self.base_url)
    }

    async fn post_audit(&self, leg: &str, package_key: &str) -> Result<()> {
        let endpoint = self.audit_endpoint(leg);
        let response = self
            .client
            .post(&endpoint)
            .json(&CheckoutAuditWire {
                user_id: &self.user_id,
                package_key,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CreditsError::Backend {
                endpoint,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CreditsApi for HttpCreditsApi {
    async fn fetch_balance(&self) -> Result<BalanceSnapshot> {
        let endpoint = self.balance_endpoint();
        let response = self.client.get(&endpoint).send().await?;
        if !response.status().is_success() {
            return Err(CreditsError::Backend {
                endpoint,
                status: response.status().as_u16(),
            });
        }
        let wire = response.json::<BalanceWire>().await?;
        debug!(credits = wire.credits, is_low = wire.is_low, "fetched balance");
        Ok(BalanceSnapshot {
            credits: wire.credits,
            is_low: wire.is_low,
            fetched_at: Utc::now(),
        })
    }

    async fn notify_checkout_started(&self, package_key: &str) -> Result<()> {
        self.post_audit("started", package_key).await
    }

    async fn notify_checkout_completed(&self, package_key: &str) -> Result<()> {
        self.post_audit("completed", package_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::{BalanceWire, HttpCreditsApi};
    use crate::config::CreditsConfig;

    #[test]
    fn parses_balance_wire_payload() {
        let raw = r#"{"credits":150,"isLow":true}"#;
        let wire: BalanceWire = serde_json::from_str(raw).expect("expected wire parse");
        assert_eq!(wire.credits, 150);
        assert!(wire.is_low);
    }

    #[test]
    fn balance_wire_tolerates_missing_low_flag() {
        let raw = r#"{"credits":42}"#;
        let wire: BalanceWire = serde_json::from_str(raw).expect("expected wire parse");
        assert_eq!(wire.credits, 42);
        assert!(!wire.is_low);
    }

    #[test]
    fn endpoints_strip_trailing_base_slash() {
        let config = CreditsConfig {
            backend_base_url: "https://quillia.app/".to_owned(),
            user_id: "user-9".to_owned(),
            ..CreditsConfig::default()
        };
        let api = HttpCreditsApi::new(&config).expect("client should build");
        assert_eq!(
            api.balance_endpoint(),
            "https://quillia.app/api/users/user-9/credits"
        );
        assert_eq!(
            api.audit_endpoint("started"),
            "https://quillia.app/api/checkout/started"
        );
    }
}
