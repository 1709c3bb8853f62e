use crate::TypeHash;

/// Errors returned by the relaymesh transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("codec error: {reason}")]
    Codec { reason: String },

    #[error("qos error: {0}")]
    Qos(String),

    #[error("device construction failed: {0}")]
    Construction(String),

    #[error("unknown interface type hash {hash:08x}")]
    UnknownInterface { hash: TypeHash },

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("command not supported by device")]
    Unsupported,

    #[error("device is closed")]
    Closed,

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn codec(reason: impl Into<String>) -> Self {
        TransportError::Codec {
            reason: reason.into(),
        }
    }
}
