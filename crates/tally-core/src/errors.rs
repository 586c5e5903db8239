use std::time::Duration;

/// Acquisition failures. Both variants are fatal for the process.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The store stayed unreachable for every allowed attempt.
    #[error("store unreachable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    /// A connection was obtained but the aggregate table could not be ensured.
    #[error("schema precondition failed: {0}")]
    Schema(String),
}

impl ConnectError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "exhausted",
            Self::Schema(_) => "schema",
        }
    }
}

/// A single poll tick's query failed. Recoverable: the tick is skipped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Failed(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    /// The handle can no longer reach the store; a new one must be acquired.
    #[error("store connection lost: {0}")]
    ConnectionLost(String),
    #[error("invalid count {count} for category {category:?}")]
    InvalidCount { category: String, count: i64 },
}

impl QueryError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Timeout(_) => "timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::InvalidCount { .. } => "invalid_count",
        }
    }
}

/// Delivery to a single subscriber failed. Never affects other subscribers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("send queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error("unknown connection")]
    UnknownConnection,
    #[error("encode failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_classification() {
        assert!(QueryError::ConnectionLost("gone".into()).is_connection_lost());
        assert!(!QueryError::Failed("syntax".into()).is_connection_lost());
        assert!(!QueryError::Timeout(Duration::from_secs(5)).is_connection_lost());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(QueryError::Timeout(Duration::from_secs(1)).error_kind(), "timeout");
        assert_eq!(
            QueryError::InvalidCount { category: "a".into(), count: -1 }.error_kind(),
            "invalid_count"
        );
        assert_eq!(ConnectError::Schema("denied".into()).error_kind(), "schema");
    }

    #[test]
    fn exhausted_message_mentions_attempts() {
        let err = ConnectError::Exhausted {
            attempts: 3,
            last_error: "no such file".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"), "got: {msg}");
        assert!(msg.contains("no such file"));
    }
}
