//! Errors surfaced by the client facade.

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("not connected to a relay")]
    NotConnected,
    #[error("handshake with relay failed")]
    HandshakeFailed,
    #[error("connection to relay lost")]
    ConnectionLost,
    #[error("no session with that id")]
    UnknownSession,
    #[error("no prekey bundle on file for that wallet")]
    PeerUnknown,
    #[error("plaintext exceeds the relay's payload cap")]
    PayloadTooLarge,
    #[error("crypto error: {0}")]
    Crypto(#[from] solconnect_crypto::CryptoError),
    #[error("session error: {0}")]
    Session(#[from] solconnect_crypto::SessionError),
    #[error("identity error: {0}")]
    Identity(#[from] solconnect_crypto::IdentityError),
    #[error("relay did not acknowledge the message in time")]
    AckTimeout,
    #[error("background connection task is gone")]
    ClientShutDown,
}
