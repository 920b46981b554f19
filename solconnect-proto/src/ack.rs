use serde::{Deserialize, Serialize};

use crate::chat::MessageId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckStatus {
    Delivered,
    Queued,
    Failed,
    Expired,
    Rejected,
}

/// Emitted by the relay (and, for end-to-end read state, by the recipient
/// endpoint) to report the disposition of a prior [`crate::ChatMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub ack_id: [u8; 16],
    pub ref_message_id: MessageId,
    pub status: AckStatus,
}
