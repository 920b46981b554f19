//! Error kinds surfaced by the relay itself (connection, routing, resource
//! exhaustion). Identity/session/crypto errors live in `solconnect-crypto`;
//! frame errors live in `solconnect-proto`.

use solconnect_proto::CodecError;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("connection lost")]
    ConnectionLost,
    #[error("handshake failed")]
    HandshakeFailed,
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("malformed frame")]
    MalformedFrame,
    #[error("payload exceeds size cap")]
    PayloadTooLarge,
    #[error("ttl must be greater than zero")]
    InvalidTtl,
    #[error("delivery queue is full")]
    QueueFull,
    #[error("recipient wallet is not known to this relay")]
    RecipientUnknown,
    #[error("backpressure timeout waiting on outbound channel")]
    BackpressureTimeout,
    #[error("relay is shutting down")]
    ShuttingDown,
    #[error("signature does not verify under the claimed wallet")]
    InvalidSignature,
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::FrameTooLarge => RelayError::FrameTooLarge,
            CodecError::MalformedFrame => RelayError::MalformedFrame,
            CodecError::ConnectionClosed => RelayError::ConnectionLost,
            CodecError::Io => RelayError::ConnectionLost,
        }
    }
}
