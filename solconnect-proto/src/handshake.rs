use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::chat::Wallet;

/// Client response to the server's challenge. `signature` is
/// `Ed25519(wallet_private, server_challenge ++ client_nonce)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub wallet: Wallet,
    pub client_nonce: [u8; 32],
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub session_params: Option<SessionParams>,
}

/// Server-side tunables the client needs to honor, handed over once on a
/// successful handshake rather than hardcoded into the SDK.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionParams {
    pub max_frame_len: u32,
    pub max_payload_len: u32,
}
