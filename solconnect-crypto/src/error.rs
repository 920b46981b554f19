use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD decryption or tag verification failed")]
    DecryptAuthFailure,
    #[error("signature does not verify under the claimed key")]
    InvalidSignature,
    #[error("key material has the wrong length")]
    InvalidKeyLength,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("pre-key bundle is malformed or its signature does not verify")]
    BundleInvalid,
    #[error("one-time prekey {0} was already consumed")]
    PreKeyAlreadyConsumed(u32),
    #[error("no wallet identity has been created for this address")]
    UnknownWallet,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("x3dh handshake failed to establish a usable session")]
    SessionHandshakeFailed,
    #[error("session has already been terminated")]
    SessionTerminated,
    #[error("a message key for this (ratchet key, counter) pair was already consumed")]
    DuplicateCounter,
    #[error("no message key is available for this counter (evicted or never skipped)")]
    MessageKeyNotAvailable,
    #[error("session is not in a state that permits this operation")]
    InvalidState,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
