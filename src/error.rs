//! Error Module
//!
//! Defines the local error type used throughout the proxy, and the structured error
//! returned by remote object store operations.

use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Main error type for local proxy failures
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failure reported by the remote object store.
///
/// Serialized as the JSON body of error responses surfaced to the build tool.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct RemoteStoreError {
    /// HTTP status returned by the store, absent for transport failures
    pub status_code: Option<u16>,
    /// Whether the failure is transient (network unreachable, throttling, 5xx)
    pub retryable: bool,
    pub code: String,
    pub message: String,
}

impl RemoteStoreError {
    /// Error for a non-success HTTP status from the store
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let code = status
            .canonical_reason()
            .map(|reason| reason.replace(' ', ""))
            .unwrap_or_else(|| format!("Http{}", status.as_u16()));
        Self {
            status_code: Some(status.as_u16()),
            retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            code,
            message: message.into(),
        }
    }

    /// Error for a request that never produced a response
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            retryable: true,
            code: "NetworkingError".to_string(),
            message: message.into(),
        }
    }

    /// Error for a request that did not complete within the store timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            retryable: true,
            code: "TimeoutError".to_string(),
            message: message.into(),
        }
    }

    /// Error for a request the proxy could not even construct
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            retryable: false,
            code: "InvalidRequest".to_string(),
            message: message.into(),
        }
    }

    /// A not-found answer is a successful negative lookup, not a store failure
    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(StatusCode::NOT_FOUND.as_u16())
    }

    /// Whether this error may be hidden from the caller under the given offline policy
    pub fn is_ignorable(&self, allow_offline: bool) -> bool {
        allow_offline && self.retryable
    }

    /// HTTP status used when the error is surfaced to the caller
    pub fn response_status(&self) -> StatusCode {
        self.status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::NOT_FOUND)
    }
}

/// Result type for remote object store operations
pub type StoreResult<T> = std::result::Result<T, RemoteStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classifies_retryable() {
        assert!(RemoteStoreError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").retryable);
        assert!(RemoteStoreError::from_status(StatusCode::TOO_MANY_REQUESTS, "").retryable);
        assert!(!RemoteStoreError::from_status(StatusCode::FORBIDDEN, "").retryable);
        assert!(!RemoteStoreError::from_status(StatusCode::NOT_FOUND, "").retryable);
    }

    #[test]
    fn test_from_status_code_name() {
        let err = RemoteStoreError::from_status(StatusCode::FORBIDDEN, "denied");
        assert_eq!(err.code, "Forbidden");
        assert_eq!(err.status_code, Some(403));
        assert_eq!(err.to_string(), "Forbidden: denied");
    }

    #[test]
    fn test_ignorable_requires_allow_offline_and_retryable() {
        let network = RemoteStoreError::network("connection refused");
        assert!(network.is_ignorable(true));
        assert!(!network.is_ignorable(false));

        let forbidden = RemoteStoreError::from_status(StatusCode::FORBIDDEN, "denied");
        assert!(!forbidden.is_ignorable(true));
    }

    #[test]
    fn test_response_status_defaults_to_not_found() {
        assert_eq!(
            RemoteStoreError::network("down").response_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RemoteStoreError::from_status(StatusCode::FORBIDDEN, "").response_status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_json_body_fields() {
        let err = RemoteStoreError::from_status(StatusCode::FORBIDDEN, "denied");
        let json: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(json["statusCode"], 403);
        assert_eq!(json["retryable"], false);
        assert_eq!(json["code"], "Forbidden");
        assert_eq!(json["message"], "denied");
    }
}
