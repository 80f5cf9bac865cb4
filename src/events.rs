use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an attempt left the awaiting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Confirmed,
    Abandoned,
    TimedOut,
}

/// Updates published to the rest of the app. `BalanceChanged` is the one
/// other features subscribe to for cache invalidation; the purchase
/// lifecycle variants drive toasts and button state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CreditsUpdate {
    BalanceChanged {
        credits: u64,
        is_low: bool,
        at: DateTime<Utc>,
    },
    PurchasePending {
        package_key: String,
        at: DateTime<Utc>,
    },
    PurchaseSettled {
        package_key: String,
        outcome: PurchaseOutcome,
        credits: u64,
        at: DateTime<Utc>,
    },
    PurchaseFailed {
        package_key: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// The two observables the UI renders from: the processing overlay is a
/// pure function of `purchase_in_flight`, the numeric display of
/// `credits`/`is_low`. Only the reconciler writes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditsView {
    pub purchase_in_flight: bool,
    pub credits: u64,
    pub is_low: bool,
}
