//! Crypto primitives, identity/prekey storage, and the Double Ratchet
//! session protocol that sits underneath every SolConnect chat message.

pub mod envelope;
pub mod error;
pub mod identity;
pub mod primitives;
pub mod session;

pub use envelope::{EnvelopeError, SessionEnvelope};
pub use error::{CryptoError, IdentityError, SessionError};
pub use identity::{
    DerivedKeyAgreementKey, IdentityKeyPair, IdentityStore, InMemoryIdentityStore, PreKeyBundle,
    WalletAddress,
};
pub use session::{InitialHandshake, RatchetHeader, Session, SessionState};
