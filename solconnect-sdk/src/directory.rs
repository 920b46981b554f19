//! Lookup of a peer's published pre-key bundle. Nothing in this workspace
//! runs a prekey directory service: the relay is a stateless router and
//! never sees bundles. Real deployments back this with whatever the wallet
//! ecosystem uses to publish bundles (an on-chain account, a signed
//! attestation service); `start_session` only needs *some* source of a
//! verifiable bundle, so that source is an injected collaborator.

use solconnect_crypto::{IdentityError, PreKeyBundle, WalletAddress};
use std::collections::HashMap;
use std::sync::Mutex;

pub trait PeerDirectory: Send + Sync {
    fn fetch(&self, wallet: WalletAddress) -> Result<PreKeyBundle, IdentityError>;
}

/// Reference directory for single-process use (tests, demos): bundles are
/// registered directly rather than fetched over the network.
#[derive(Default)]
pub struct InMemoryPeerDirectory {
    bundles: Mutex<HashMap<WalletAddress, PreKeyBundle>>,
}

impl InMemoryPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, bundle: PreKeyBundle) {
        self.bundles.lock().unwrap().insert(bundle.wallet, bundle);
    }
}

impl PeerDirectory for InMemoryPeerDirectory {
    fn fetch(&self, wallet: WalletAddress) -> Result<PreKeyBundle, IdentityError> {
        self.bundles
            .lock()
            .unwrap()
            .get(&wallet)
            .cloned()
            .ok_or(IdentityError::UnknownWallet)
    }
}
