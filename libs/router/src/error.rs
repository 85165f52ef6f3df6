//! Router error taxonomy

use crate::handle::ResponseData;
use router_types::ErrorRecord;
use std::time::Duration;

/// Failure reported by a vendor session implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session host unreachable: {0}")]
    Unreachable(String),

    #[error("Session is not open")]
    NotOpen,

    #[error("Vendor error: {0}")]
    Vendor(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    /// Session could not be reached, started or a service could not be opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// Session ended while the request was pending
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// A fatal per-item error under `ErrorBehaviour::Raise`
    #[error("Request failed: {}", summarize(.errors))]
    RequestFailed {
        errors: Vec<ErrorRecord>,
        partial: ResponseData,
    },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Router is shutting down")]
    ShuttingDown,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Dispatcher stopped")]
    DispatcherStopped,
}

impl RouterError {
    /// Errors that end all pending work, whatever the error behaviour
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            RouterError::Connection(_) | RouterError::SessionClosed(_) | RouterError::DispatcherStopped
        )
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, RouterError::Connection(_))
    }

    /// Per-item errors accumulated before the request failed
    pub fn errors(&self) -> &[ErrorRecord] {
        match self {
            RouterError::RequestFailed { errors, .. } => errors,
            _ => &[],
        }
    }
}

impl From<SessionError> for RouterError {
    fn from(err: SessionError) -> Self {
        RouterError::Connection(err.to_string())
    }
}

fn summarize(errors: &[ErrorRecord]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use router_types::{ErrorScope, ThrottleKind};

    #[test]
    fn test_request_failed_lists_every_error() {
        let err = RouterError::RequestFailed {
            errors: vec![
                ErrorRecord::throttle(ThrottleKind::DailyLimit, None),
                ErrorRecord::new(ErrorScope::Security, "Unknown/Invalid security")
                    .with_security("BAD Equity"),
            ],
            partial: ResponseData::new(),
        };

        assert_eq!(
            err.to_string(),
            "Request failed: ThrottleError(DAILY_LIMIT_REACHED); SecurityError[BAD Equity]: Unknown/Invalid security"
        );
        assert_eq!(err.errors().len(), 2);
        assert!(!err.is_session_level());
    }

    #[test]
    fn test_session_errors_become_connection_errors() {
        let err = RouterError::from(SessionError::Unreachable("localhost:8194".into()));
        assert!(err.is_connection_error());
        assert!(err.is_session_level());
        assert!(err.to_string().contains("localhost:8194"));
    }
}
