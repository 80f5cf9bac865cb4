use tokio::time::Instant;

/// Internal tagged signal stream. Three independent producers (widget
/// event listeners, surface watcher, balance poller) feed these into the
/// reconcile loop, which is the only consumer and the only writer of
/// attempt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseSignal {
    /// The widget reported an explicit order-complete.
    Completed,
    /// The popup was closed, seen either as a widget event or inferred
    /// from the rendering surface disappearing.
    Closed,
    /// The backend balance rose above the pre-attempt snapshot.
    BalanceIncreased { credits: u64, is_low: bool },
    /// The attempt deadline lapsed with nothing conclusive.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Idle,
    AwaitingCompletion,
    Confirmed,
    Abandoned,
}

/// One in-flight purchase. Created by the initiator, mutated only by the
/// reconcile loop, gone once the attempt settles.
#[derive(Debug, Clone)]
pub struct PurchaseAttempt {
    pub package_key: String,
    pub balance_before: u64,
    pub status: AttemptStatus,
    pub started_at: Instant,
}

impl PurchaseAttempt {
    pub fn new(package_key: String, balance_before: u64) -> Self {
        Self {
            package_key,
            balance_before,
            status: AttemptStatus::AwaitingCompletion,
            started_at: Instant::now(),
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.status == AttemptStatus::AwaitingCompletion
    }
}

#[cfg(test)]
mod tests {
    use super::{AttemptStatus, PurchaseAttempt};

    #[test]
    fn new_attempt_starts_awaiting() {
        let attempt = PurchaseAttempt::new("novice-sack".to_owned(), 150);
        assert!(attempt.is_awaiting());
        assert_eq!(attempt.balance_before, 150);
    }

    #[test]
    fn non_awaiting_states_report_false() {
        let mut attempt = PurchaseAttempt::new("novice-sack".to_owned(), 150);
        attempt.status = AttemptStatus::Abandoned;
        assert!(!attempt.is_awaiting());
        attempt.status = AttemptStatus::Confirmed;
        assert!(!attempt.is_awaiting());
    }
}
