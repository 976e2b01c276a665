//! Error kinds surfaced by the appliance client and volume engine.

use thiserror::Error;

/// Internal error kind, mapped to an orchestrator-facing code by the CSI glue layer.
#[derive(Error, Debug)]
pub enum ApplianceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("network error (retryable): {0}")]
    NetworkRetryable(String),

    #[error("appliance API error (retryable): {0}")]
    ApiRetryable(String),

    #[error("resource busy: {0}")]
    BusyResource(String),

    #[error("not authenticated with appliance")]
    Unauthenticated,

    #[error("operation canceled")]
    Canceled,

    #[error("appliance API error: {0}")]
    ApiPermanent(String),

    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ApplianceError>,
    },
}

impl ApplianceError {
    /// Classify a raw appliance-reported message into the network/API retryable kind,
    /// per the naming used in `sharing.nfs.*`/`pool.dataset.*`/etc. error strings.
    pub fn from_wire_message(msg: &str) -> Self {
        let lower = msg.to_lowercase();
        if is_network_retryable_text(&lower) {
            ApplianceError::NetworkRetryable(msg.to_string())
        } else if is_busy_text(&lower) {
            ApplianceError::BusyResource(msg.to_string())
        } else if lower.contains("does not exist") || lower.contains("not found") {
            ApplianceError::NotFound(msg.to_string())
        } else if lower.contains("already exists") {
            ApplianceError::AlreadyExists(msg.to_string())
        } else {
            ApplianceError::ApiPermanent(msg.to_string())
        }
    }
}

pub(crate) fn is_network_retryable_text(lower: &str) -> bool {
    [
        "connection refused",
        "connection reset",
        "broken pipe",
        "i/o timeout",
        "unexpected eof",
        "use of closed network connection",
        "500",
        "502",
        "503",
        "504",
        "temporarily unavailable",
        "try again",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

pub(crate) fn is_busy_text(lower: &str) -> bool {
    [
        "dataset is busy",
        "resource busy",
        "ebusy",
        "pool is busy",
        "filesystem is busy",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

pub type Result<T> = std::result::Result<T, ApplianceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_busy_text() {
        let err = ApplianceError::from_wire_message("cannot destroy: dataset is busy");
        assert!(matches!(err, ApplianceError::BusyResource(_)));
    }

    #[test]
    fn classifies_network_retryable() {
        let err = ApplianceError::from_wire_message("connection reset by peer");
        assert!(matches!(err, ApplianceError::NetworkRetryable(_)));
    }

    #[test]
    fn classifies_not_found() {
        let err = ApplianceError::from_wire_message("dataset tank/foo does not exist");
        assert!(matches!(err, ApplianceError::NotFound(_)));
    }

    #[test]
    fn classifies_already_exists() {
        let err = ApplianceError::from_wire_message("dataset tank/foo already exists");
        assert!(matches!(err, ApplianceError::AlreadyExists(_)));
    }

    #[test]
    fn falls_back_to_permanent() {
        let err = ApplianceError::from_wire_message("encryption key required");
        assert!(matches!(err, ApplianceError::ApiPermanent(_)));
    }
}
