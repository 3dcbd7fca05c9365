use thiserror::Error;

pub type Result<T> = std::result::Result<T, DfsError>;

/// Unified error type for every Basalt component. Services map these onto
/// RPC status codes at the boundary; the stable `code()` string travels in
/// the JSON error body so clients can reconstruct the variant.
#[derive(Debug, Error)]
pub enum DfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("parent directory missing: {0}")]
    ParentMissing(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("no eligible datanodes: {0}")]
    NoEligibleNodes(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("checksum mismatch for block {block_id}: expected {expected}, got {actual}")]
    Corrupt {
        block_id: String,
        expected: String,
        actual: String,
    },

    #[error("block unavailable: {0}")]
    BlockUnavailable(String),

    #[error("not the metadata leader (leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("wire protocol error: {0}")]
    Wire(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DfsError {
    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NotEmpty(_) => "NOT_EMPTY",
            Self::ParentMissing(_) => "PARENT_MISSING",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::NoEligibleNodes(_) => "NO_ELIGIBLE_NODES",
            Self::Conflict(_) => "CONFLICT",
            Self::Corrupt { .. } => "CORRUPT",
            Self::BlockUnavailable(_) => "BLOCK_UNAVAILABLE",
            Self::NotLeader { .. } => "NOT_LEADER",
            Self::Transient(_) => "TRANSIENT",
            Self::Wire(_) => "WIRE",
            Self::Config(_) => "CONFIG",
            Self::Database(_) => "DATABASE",
            Self::Http(_) => "HTTP",
            Self::Io(_) => "IO",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Structured payload for the error body's `details` field, where a
    /// variant carries more than its message: the leader endpoint for
    /// `NotLeader`, the digest triple for `Corrupt`.
    pub fn details(&self) -> Option<String> {
        match self {
            Self::NotLeader { leader } => leader.clone(),
            Self::Corrupt {
                block_id,
                expected,
                actual,
            } => Some(
                serde_json::json!({
                    "block_id": block_id,
                    "expected": expected,
                    "actual": actual,
                })
                .to_string(),
            ),
            _ => None,
        }
    }

    /// Rebuild an error from a `{code, message, details?}` body received
    /// over the wire.
    pub fn from_code(code: &str, message: String, details: Option<&str>) -> Self {
        match code {
            "NOT_FOUND" => Self::NotFound(message),
            "ALREADY_EXISTS" => Self::AlreadyExists(message),
            "NOT_EMPTY" => Self::NotEmpty(message),
            "PARENT_MISSING" => Self::ParentMissing(message),
            "INVALID_PATH" => Self::InvalidPath(message),
            "CAPACITY_EXCEEDED" => Self::CapacityExceeded(message),
            "NO_ELIGIBLE_NODES" => Self::NoEligibleNodes(message),
            "CONFLICT" => Self::Conflict(message),
            "CORRUPT" => {
                #[derive(serde::Deserialize)]
                struct CorruptDetails {
                    block_id: String,
                    expected: String,
                    actual: String,
                }
                match details.and_then(|d| serde_json::from_str::<CorruptDetails>(d).ok()) {
                    Some(d) => Self::Corrupt {
                        block_id: d.block_id,
                        expected: d.expected,
                        actual: d.actual,
                    },
                    // A peer that sent no details still reported corruption.
                    None => Self::Corrupt {
                        block_id: message,
                        expected: String::new(),
                        actual: String::new(),
                    },
                }
            }
            "BLOCK_UNAVAILABLE" => Self::BlockUnavailable(message),
            "NOT_LEADER" => Self::NotLeader {
                leader: details.map(str::to_string),
            },
            "TRANSIENT" => Self::Transient(message),
            "WIRE" => Self::Wire(message),
            "CONFIG" => Self::Config(message),
            "DATABASE" => Self::Database(message),
            _ => Self::Http(message),
        }
    }

    /// Errors worth retrying against another endpoint or replica.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Http(_))
    }

    pub fn db(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }

    pub fn http(err: impl std::fmt::Display) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<serde_json::Error> for DfsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}

impl From<bincode::Error> for DfsError {
    fn from(err: bincode::Error) -> Self {
        Self::Wire(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_round_trips_through_details() {
        let err = DfsError::Corrupt {
            block_id: "b1".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        let details = err.details();
        let rebuilt = DfsError::from_code(err.code(), err.to_string(), details.as_deref());
        match rebuilt {
            DfsError::Corrupt {
                block_id,
                expected,
                actual,
            } => {
                assert_eq!(block_id, "b1");
                assert_eq!(expected, "aa");
                assert_eq!(actual, "bb");
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_without_details_keeps_variant() {
        let rebuilt = DfsError::from_code("CORRUPT", "block b2".to_string(), None);
        assert!(matches!(rebuilt, DfsError::Corrupt { .. }));
    }

    #[test]
    fn test_not_leader_carries_hint() {
        let err = DfsError::NotLeader {
            leader: Some("http://127.0.0.1:9000".to_string()),
        };
        let rebuilt = DfsError::from_code(err.code(), err.to_string(), err.details().as_deref());
        match rebuilt {
            DfsError::NotLeader { leader } => {
                assert_eq!(leader.as_deref(), Some("http://127.0.0.1:9000"));
            }
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }
}
