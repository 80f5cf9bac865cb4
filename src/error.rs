use thiserror::Error;

/// All errors the credits runtime can surface to its caller.
///
/// Audit-notification and balance-poll failures are deliberately absent:
/// both are recovered locally (logged, then retried or dropped) and never
/// reach the caller.
#[derive(Debug, Error)]
pub enum CreditsError {
    #[error("checkout widget unavailable; try again in a moment")]
    WidgetUnavailable,

    #[error("unknown credit package: {0}")]
    UnknownPackage(String),

    #[error("a purchase is already in flight")]
    PurchaseInFlight,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend returned status {status} for {endpoint}")]
    Backend { endpoint: String, status: u16 },
}

pub type Result<T> = std::result::Result<T, CreditsError>;

#[cfg(test)]
mod tests {
    use super::CreditsError;

    #[test]
    fn unknown_package_names_the_key() {
        let err = CreditsError::UnknownPackage("mystery-crate".to_owned());
        assert_eq!(err.to_string(), "unknown credit package: mystery-crate");
    }

    #[test]
    fn widget_unavailable_reads_as_user_alert() {
        let err = CreditsError::WidgetUnavailable;
        assert!(err.to_string().contains("try again"));
    }
}
