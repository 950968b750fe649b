//! Error types for Cumulus
//!
//! Every failure inside the coordination core is local: transport errors are
//! retried by background loops, protocol violations are logged and dropped,
//! and timeouts surface as empty results. `CumulusError` is the common
//! vocabulary for those cases.

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum CumulusError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("node '{0}' is not connected")]
    NotConnected(String),

    #[error("node '{0}' is unknown")]
    UnknownNode(String),

    #[error("illegal status transition for node '{node}': {from} -> {to}")]
    IllegalTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl CumulusError {
    /// Whether the error came from the transport layer and is worth retrying
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CumulusError::Transport(_) | CumulusError::NotConnected(_) | CumulusError::Io(_)
        )
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, CumulusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CumulusError::IllegalTransition {
            node: "a".to_string(),
            from: "CONNECTED".to_string(),
            to: "CONNECTING".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "illegal status transition for node 'a': CONNECTED -> CONNECTING"
        );
        assert_eq!(CumulusError::Timeout(50).to_string(), "timed out after 50 ms");
    }

    #[test]
    fn test_is_transport() {
        assert!(CumulusError::Transport("refused".to_string()).is_transport());
        assert!(CumulusError::NotConnected("b".to_string()).is_transport());
        assert!(!CumulusError::Timeout(1).is_transport());
    }

    #[test]
    fn test_codec_error_from() {
        let err: CumulusError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CumulusError::Codec(_)));
    }
}
