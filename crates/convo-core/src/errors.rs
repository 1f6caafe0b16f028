use std::time::Duration;

/// Failures while establishing or driving the persistent connection.
/// The connection manager treats every variant as an abnormal close.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("handshake rejected with status {status}")]
    HandshakeRejected { status: u16 },
    #[error("malformed handshake response: {0}")]
    MalformedHandshake(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport io error: {0}")]
    Io(String),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Rejections that will keep failing until credentials change.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::HandshakeRejected { status: 401 | 403 })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::ConnectFailed(_) => "connect_failed",
            Self::HandshakeRejected { .. } => "handshake_rejected",
            Self::MalformedHandshake(_) => "malformed_handshake",
            Self::Timeout(_) => "timeout",
            Self::Io(_) => "io",
            Self::Closed => "closed",
        }
    }
}

/// Reasons an inbound frame could not be turned into an event.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is missing `{0}`")]
    MissingField(&'static str),
}

/// Failures from the REST collaborator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            _ => Self::Status { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Unauthorized(_) | Self::Decode(_) => false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Status { .. } => "status",
            Self::Network(_) => "network",
            Self::Decode(_) => "decode",
        }
    }
}

/// Errors surfaced to callers of the sync session.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("message content is empty")]
    EmptyMessage,
    #[error("session is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_classification() {
        assert!(TransportError::HandshakeRejected { status: 401 }.is_auth_failure());
        assert!(TransportError::HandshakeRejected { status: 403 }.is_auth_failure());
        assert!(!TransportError::HandshakeRejected { status: 502 }.is_auth_failure());
        assert!(!TransportError::ConnectFailed("refused".into()).is_auth_failure());
    }

    #[test]
    fn transport_error_kind_strings() {
        assert_eq!(TransportError::Closed.error_kind(), "closed");
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(10)).error_kind(),
            "timeout"
        );
        assert_eq!(
            TransportError::HandshakeRejected { status: 401 }.error_kind(),
            "handshake_rejected"
        );
    }

    #[test]
    fn api_from_status_mapping() {
        assert!(matches!(
            ApiError::from_status(401, "nope".into()),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from_status(404, "missing".into()),
            ApiError::Status { status: 404, .. }
        ));
    }

    #[test]
    fn api_retryable_classification() {
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::from_status(503, String::new()).is_retryable());
        assert!(ApiError::from_status(429, String::new()).is_retryable());
        assert!(!ApiError::from_status(400, String::new()).is_retryable());
        assert!(!ApiError::Unauthorized(String::new()).is_retryable());
    }

    #[test]
    fn sync_error_wraps_api_error() {
        let err: SyncError = ApiError::Network("down".into()).into();
        assert_eq!(err.to_string(), "network error: down");
    }
}
