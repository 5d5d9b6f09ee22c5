use serde::{Deserialize, Serialize};

/// Backend error codes that retrying can never fix.
///
/// Access, authentication and request-shape errors, plus a missing queue. Any
/// code not listed here is treated as transient.
pub const FATAL_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "AuthFailure",
    "InvalidAccessKeyId",
    "InvalidAction",
    "InvalidAddress",
    "InvalidHttpRequest",
    "InvalidRequest",
    "InvalidSecurity",
    "InvalidSecurityToken",
    "InvalidClientTokenId",
    "MissingClientTokenId",
    "MissingCredentials",
    "MissingParameter",
    "X509ParseError",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

/// Whether a backend failure can be absorbed or must stop the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureClassification {
    /// Expected to go away on its own: network hiccups, throttling, broker restarts.
    Transient,

    /// Configuration, permission or existence problem.
    Fatal,
}

impl FailureClassification {
    pub fn for_code(code: &str) -> Self {
        if FATAL_ERROR_CODES.contains(&code) {
            Self::Fatal
        } else {
            Self::Transient
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call against the queue backend.
///
/// `code` is the backend's machine-readable error code; it alone decides the
/// classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn classification(&self) -> FailureClassification {
        FailureClassification::for_code(&self.code)
    }

    pub fn is_fatal(&self) -> bool {
        self.classification().is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_codes_classify_as_fatal() {
        for code in FATAL_ERROR_CODES {
            let err = BackendError::new(*code, "nope");
            assert!(err.is_fatal(), "{code} should be fatal");
            assert_eq!(err.classification(), FailureClassification::Fatal);
        }
    }

    #[test]
    fn test_unknown_codes_default_to_transient() {
        for code in ["ServiceUnavailable", "RequestThrottled", "InternalError", "", "accessdenied"] {
            let classification = FailureClassification::for_code(code);
            assert!(classification.is_transient(), "{code:?} should be transient");
        }
    }

    #[test]
    fn test_display() {
        let err = BackendError::new("AccessDenied", "not allowed");
        assert_eq!(err.to_string(), "AccessDenied: not allowed");
        assert_eq!(FailureClassification::Fatal.to_string(), "fatal");
        assert_eq!(FailureClassification::Transient.as_str(), "transient");
    }
}
