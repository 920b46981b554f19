//! Facade configuration: where to connect and which identity to present.

use std::sync::Arc;

use solconnect_crypto::{IdentityKeyPair, IdentityStore, InMemoryIdentityStore};

use crate::directory::{InMemoryPeerDirectory, PeerDirectory};

#[derive(Clone)]
pub struct SdkConfig {
    pub relay_endpoint: String,
    pub tls: bool,
    /// Verify the relay's certificate against the system trust store.
    /// Disabling is for local development against a self-signed relay.
    pub tls_insecure: bool,
    /// Long-term wallet identity presented during the relay handshake and
    /// used as this client's session identity.
    pub identity: IdentityKeyPair,
    /// Where this client's own prekeys and responder-side ratchet state
    /// live. Defaults to an in-memory store; a persistent implementation
    /// is a host-application concern.
    pub identity_store: Arc<dyn IdentityStore>,
    /// Source of peers' published pre-key bundles.
    pub peer_directory: Arc<dyn PeerDirectory>,
}

impl SdkConfig {
    pub fn new(relay_endpoint: impl Into<String>, identity: IdentityKeyPair) -> Self {
        Self {
            relay_endpoint: relay_endpoint.into(),
            tls: false,
            tls_insecure: false,
            identity,
            identity_store: Arc::new(InMemoryIdentityStore::new()),
            peer_directory: Arc::new(InMemoryPeerDirectory::new()),
        }
    }

    pub fn with_tls(mut self, insecure: bool) -> Self {
        self.tls = true;
        self.tls_insecure = insecure;
        self
    }

    pub fn with_peer_directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.peer_directory = directory;
        self
    }
}
