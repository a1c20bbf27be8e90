/// Errors returned by a peer node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create node: {0}")]
    Create(String),

    #[error("dial to {endpoint} failed: {reason}")]
    Dial { endpoint: String, reason: String },

    #[error("protocol unavailable: {0}")]
    ProtocolUnavailable(String),

    #[error("subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    #[error("node is stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_dial() {
        let err = TransportError::Dial {
            endpoint: "/dns4/boot-1".into(),
            reason: "unreachable".into(),
        };
        assert_eq!(err.to_string(), "dial to /dns4/boot-1 failed: unreachable");
    }

    #[test]
    fn test_display_stopped() {
        assert_eq!(TransportError::Stopped.to_string(), "node is stopped");
    }
}
