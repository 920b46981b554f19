//! Framed, length-prefixed wire encoding for the SolConnect relay protocol.
//!
//! A frame on the wire is `[4-byte big-endian length][body]`. The body is a
//! `bincode`-encoded [`WireMessage`]. Bincode gives us a fixed, canonical byte
//! layout for a given value, which matters here: the `ChatMessage` signature
//! and the ratchet AAD are both computed over this encoding, so two honest
//! peers must always produce identical bytes for identical logical values.

mod ack;
mod chat;
mod control;
mod error;
mod framing;
mod handshake;

pub use ack::{Ack, AckStatus};
pub use chat::{ChatMessage, MessageId};
pub use control::{ControlKind, ControlMessage};
pub use error::CodecError;
pub use framing::{MAX_FRAME_LEN, read_frame, write_frame};
pub use handshake::{HandshakeRequest, HandshakeResponse, SessionParams};

use serde::{Deserialize, Serialize};

/// The tagged union carried by every frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireMessage {
    Chat(ChatMessage),
    Ack(Ack),
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Control(ControlMessage),
    /// Idle-connection liveness probe. Either side may send one; the
    /// receiver echoes the nonce back in a `Pong`.
    Ping([u8; 8]),
    Pong([u8; 8]),
}

impl WireMessage {
    /// Canonical byte encoding used for framing, and reused wherever a
    /// message's bytes must be reproducible (e.g. logging a message id).
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|_| CodecError::MalformedFrame)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::MalformedFrame);
        }
        bincode::deserialize(bytes).map_err(|_| CodecError::MalformedFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chat() -> ChatMessage {
        ChatMessage {
            message_id: [7u8; 16],
            sender_wallet: [1u8; 32],
            recipient_wallet: [2u8; 32],
            timestamp_ms: 1_700_000_000_000,
            encrypted_payload: vec![9, 9, 9, 9],
            attachment_url: None,
            ttl_seconds: 60,
            signature: [3u8; 64],
        }
    }

    #[test]
    fn round_trip_identity() {
        let msg = WireMessage::Chat(sample_chat());
        let encoded = msg.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = WireMessage::Chat(sample_chat());
        assert_eq!(msg.encode().unwrap(), msg.encode().unwrap());
    }

    #[test]
    fn empty_body_is_malformed() {
        assert!(matches!(
            WireMessage::decode(&[]),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn garbage_tag_is_malformed() {
        let garbage = vec![0xFFu8; 12];
        assert!(matches!(
            WireMessage::decode(&garbage),
            Err(CodecError::MalformedFrame)
        ));
    }

    #[test]
    fn truncated_valid_message_is_malformed() {
        let msg = WireMessage::Chat(sample_chat());
        let mut encoded = msg.encode().unwrap();
        encoded.truncate(encoded.len() / 2);
        assert!(matches!(
            WireMessage::decode(&encoded),
            Err(CodecError::MalformedFrame)
        ));
    }
}
