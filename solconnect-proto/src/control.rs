use serde::{Deserialize, Serialize};

use crate::chat::Wallet;

/// Opaque application-level hint routed end-to-end. The relay forwards these
/// exactly like a [`crate::ChatMessage`] but never inspects `payload` beyond
/// routing it to `recipient_wallet` — typing indicators, read receipts, and
/// reactions all travel as one of these with their own `kind` tag, chosen by
/// the client SDK, not interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlMessage {
    pub control_id: [u8; 16],
    pub sender_wallet: Wallet,
    pub recipient_wallet: Wallet,
    pub kind: ControlKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlKind {
    Typing,
    ReadReceipt,
    Reaction,
}
