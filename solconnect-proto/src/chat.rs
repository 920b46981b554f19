use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

pub type MessageId = [u8; 16];
pub type Wallet = [u8; 32];

/// Wire form of a chat frame. `encrypted_payload` is the session payload
/// envelope described by the session protocol; the relay never looks inside
/// it. `signature` covers the canonical encoding of every other field and is
/// checked by the router before routing or queueing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub sender_wallet: Wallet,
    pub recipient_wallet: Wallet,
    pub timestamp_ms: u64,
    pub encrypted_payload: Vec<u8>,
    pub attachment_url: Option<String>,
    pub ttl_seconds: u32,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl ChatMessage {
    /// Bytes the sender signs and the router re-verifies. Excludes the
    /// signature itself; field order is fixed so both sides agree on the
    /// encoding without needing to share a schema out of band.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 32 + 32 + 8 + self.encrypted_payload.len() + 4 + 4);
        buf.extend_from_slice(&self.message_id);
        buf.extend_from_slice(&self.sender_wallet);
        buf.extend_from_slice(&self.recipient_wallet);
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&(self.encrypted_payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.encrypted_payload);
        match &self.attachment_url {
            Some(url) => {
                buf.push(1);
                buf.extend_from_slice(&(url.len() as u32).to_be_bytes());
                buf.extend_from_slice(url.as_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.ttl_seconds.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_bytes_are_deterministic() {
        let msg = ChatMessage {
            message_id: [1; 16],
            sender_wallet: [2; 32],
            recipient_wallet: [3; 32],
            timestamp_ms: 42,
            encrypted_payload: vec![1, 2, 3],
            attachment_url: Some("https://example.invalid/a".into()),
            ttl_seconds: 30,
            signature: [0; 64],
        };
        assert_eq!(msg.signing_bytes(), msg.signing_bytes());
    }

    #[test]
    fn attachment_presence_changes_signing_bytes() {
        let base = ChatMessage {
            message_id: [1; 16],
            sender_wallet: [2; 32],
            recipient_wallet: [3; 32],
            timestamp_ms: 42,
            encrypted_payload: vec![1, 2, 3],
            attachment_url: None,
            ttl_seconds: 30,
            signature: [0; 64],
        };
        let mut with_url = base.clone();
        with_url.attachment_url = Some("https://example.invalid/a".into());
        assert_ne!(base.signing_bytes(), with_url.signing_bytes());
    }
}
