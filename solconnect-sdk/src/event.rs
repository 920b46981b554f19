//! Events a subscriber receives for one session: inbound plaintext,
//! delivery acks for messages this client sent, and the session's own
//! lifecycle.

use solconnect_proto::{ControlKind, MessageId};

#[derive(Debug, Clone)]
pub enum Event {
    /// Decrypted plaintext from the peer.
    Message { message_id: MessageId, plaintext: Vec<u8> },
    /// An opaque control payload from the peer (typing, read receipt,
    /// reaction). The relay never interprets these; neither does this
    /// struct beyond carrying `kind` through for the handler to branch on.
    Control { kind: ControlKind, payload: Vec<u8> },
    /// The relay's terminal disposition for a message this client sent.
    Ack { message_id: MessageId, status: DeliveryStatus },
    /// The underlying connection to the relay dropped. Existing sessions
    /// stay usable locally (encrypt/decrypt don't need the network); only
    /// sending is affected until the client reconnects.
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Queued,
    Failed,
}

impl From<solconnect_proto::AckStatus> for DeliveryStatus {
    fn from(status: solconnect_proto::AckStatus) -> Self {
        match status {
            solconnect_proto::AckStatus::Delivered => DeliveryStatus::Sent,
            solconnect_proto::AckStatus::Queued => DeliveryStatus::Queued,
            solconnect_proto::AckStatus::Failed
            | solconnect_proto::AckStatus::Expired
            | solconnect_proto::AckStatus::Rejected => DeliveryStatus::Failed,
        }
    }
}
