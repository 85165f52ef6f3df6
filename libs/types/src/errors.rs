//! Error vocabulary shared by the router and its callers
//!
//! `SchemaError` reports a payload whose shape does not match what the reader
//! expected. `ErrorRecord` is the per-item error a request accumulates; its
//! scope and optional throttle kind decide how it is displayed and handled.

use crate::correlation::CorrelationId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Shape mismatch raised by typed element accessors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Required child element is absent
    #[error("missing child element '{name}'")]
    MissingChild { name: String },

    /// Element exists but has a different shape or scalar type
    #[error("expected {expected} element but found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

impl SchemaError {
    pub fn mismatch(expected: &'static str, found: &'static str) -> Self {
        SchemaError::TypeMismatch { expected, found }
    }
}

/// Level at which an error was reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// One field of one item (`fieldExceptions`, `fieldError`)
    Field,
    /// One security in a batch (`securityError`)
    Security,
    /// The whole (sub-)request (`responseError`, `RequestFailure`)
    Request,
    /// The transport itself
    Session,
}

/// Rate-limit signal reported by the vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThrottleKind {
    DailyLimit,
    MonthlyLimit,
    RateLimit,
}

impl ThrottleKind {
    /// Vendor subcategory string for this throttle
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleKind::DailyLimit => "DAILY_LIMIT_REACHED",
            ThrottleKind::MonthlyLimit => "MONTHLY_LIMIT_REACHED",
            ThrottleKind::RateLimit => "REQUEST_RATE_EXCEEDED",
        }
    }

    /// Map a vendor subcategory onto a throttle kind
    pub fn from_subcategory(subcategory: &str) -> Option<Self> {
        match subcategory {
            "DAILY_LIMIT_REACHED" => Some(ThrottleKind::DailyLimit),
            "MONTHLY_LIMIT_REACHED" => Some(ThrottleKind::MonthlyLimit),
            "REQUEST_RATE_EXCEEDED" | "RATE_LIMIT_REACHED" => Some(ThrottleKind::RateLimit),
            _ => None,
        }
    }
}

impl fmt::Display for ThrottleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error accumulated by a request or delivered on a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub scope: ErrorScope,
    /// Set when the error is a rate-limit signal
    pub throttle: Option<ThrottleKind>,
    /// Vendor category, e.g. `BAD_SEC`, `BAD_FLD`, `LIMIT`
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub message: String,
    pub correlation_id: Option<CorrelationId>,
    pub security: Option<String>,
    pub field: Option<String>,
}

impl ErrorRecord {
    pub fn new(scope: ErrorScope, message: impl Into<String>) -> Self {
        Self {
            scope,
            throttle: None,
            category: None,
            subcategory: None,
            message: message.into(),
            correlation_id: None,
            security: None,
            field: None,
        }
    }

    /// Rate-limit error for a whole request
    pub fn throttle(kind: ThrottleKind, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            throttle: Some(kind),
            subcategory: Some(kind.as_str().to_string()),
            correlation_id,
            ..Self::new(ErrorScope::Request, kind.as_str())
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_security(mut self, security: impl Into<String>) -> Self {
        self.security = Some(security.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn is_throttle(&self) -> bool {
        self.throttle.is_some()
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kind) = self.throttle {
            return write!(f, "ThrottleError({})", kind);
        }

        match self.scope {
            ErrorScope::Field => write!(
                f,
                "FieldError[{}/{}]: {}",
                self.security.as_deref().unwrap_or("-"),
                self.field.as_deref().unwrap_or("-"),
                self.message
            ),
            ErrorScope::Security => write!(
                f,
                "SecurityError[{}]: {}",
                self.security.as_deref().unwrap_or("-"),
                self.message
            ),
            ErrorScope::Request => write!(f, "RequestError: {}", self.message),
            ErrorScope::Session => write!(f, "SessionError: {}", self.message),
        }
    }
}
