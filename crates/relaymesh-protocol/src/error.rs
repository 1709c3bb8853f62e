use relaymesh_transport::TransportError;

use crate::identifiers::DeviceId;

/// Protocol-level errors for relaymesh.
///
/// Every per-packet or per-command failure lands in one of the first five
/// variants; the rest wrap lower layers and startup concerns.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Malformed envelope, body or argument list.
    #[error("parse error: {0}")]
    Parse(String),

    /// Authentication, signature or AEAD tag failure.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Unknown route, dead device or unregistered agent.
    #[error("routing error: {0}")]
    Routing(String),

    /// Message type not valid for this relay's role.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Bad construction arguments or unknown device type.
    #[error("construction error: {0}")]
    Construction(String),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub(crate) fn routing(msg: impl Into<String>) -> Self {
        ProtocolError::Routing(msg.into())
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        ProtocolError::ProtocolViolation(msg.into())
    }

    /// Log level a dropped packet or failed command is reported at.
    pub fn severity(&self) -> tracing::Level {
        match self {
            ProtocolError::Parse(_) => tracing::Level::DEBUG,
            ProtocolError::Integrity(_) | ProtocolError::Routing(_) => tracing::Level::WARN,
            ProtocolError::Transport(_) => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }

    /// Emit the single log event for a dropped packet or failed command.
    pub fn report(&self, context: &str, device: Option<DeviceId>) {
        let device = device.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
        let level = self.severity();
        if level == tracing::Level::DEBUG {
            tracing::debug!(device = %device, error = %self, "{context}");
        } else if level == tracing::Level::WARN {
            tracing::warn!(device = %device, error = %self, "{context}");
        } else {
            tracing::error!(device = %device, error = %self, "{context}");
        }
    }
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Codec { reason } => ProtocolError::Parse(reason),
            TransportError::Construction(reason) => ProtocolError::Construction(reason),
            e @ TransportError::UnknownInterface { .. } => {
                ProtocolError::Construction(e.to_string())
            }
            TransportError::Closed => ProtocolError::Routing("device is closed".into()),
            other => ProtocolError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse() {
        let err = ProtocolError::Parse("truncated body".into());
        assert_eq!(err.to_string(), "parse error: truncated body");
    }

    #[test]
    fn test_display_integrity() {
        let err = ProtocolError::Integrity("tag mismatch".into());
        assert_eq!(err.to_string(), "integrity error: tag mismatch");
    }

    #[test]
    fn test_display_routing() {
        let err = ProtocolError::routing("no route to 0001:0002");
        assert_eq!(err.to_string(), "routing error: no route to 0001:0002");
    }

    #[test]
    fn test_display_violation() {
        let err = ProtocolError::violation("G2A received by gateway");
        assert_eq!(
            err.to_string(),
            "protocol violation: G2A received by gateway"
        );
    }

    #[test]
    fn test_transport_codec_maps_to_parse() {
        let err: ProtocolError = TransportError::Codec {
            reason: "short".into(),
        }
        .into();
        assert!(matches!(err, ProtocolError::Parse(r) if r == "short"));
    }

    #[test]
    fn test_transport_closed_maps_to_routing() {
        let err: ProtocolError = TransportError::Closed.into();
        assert!(matches!(err, ProtocolError::Routing(_)));
    }

    #[test]
    fn test_unknown_interface_maps_to_construction() {
        let err: ProtocolError = TransportError::UnknownInterface { hash: 1 }.into();
        assert!(matches!(err, ProtocolError::Construction(_)));
    }

    #[test]
    fn test_severity() {
        assert_eq!(ProtocolError::Parse(String::new()).severity(), tracing::Level::DEBUG);
        assert_eq!(ProtocolError::routing("x").severity(), tracing::Level::WARN);
        assert_eq!(ProtocolError::violation("x").severity(), tracing::Level::ERROR);
    }
}
