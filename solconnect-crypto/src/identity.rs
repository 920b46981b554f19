//! Per-wallet long-term identity keys, signed prekeys, and one-time
//! prekeys (C3).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use aes_gcm::aead::OsRng;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::IdentityError;
use crate::primitives;

/// How long an outgoing generation's signed prekey stays acceptable for
/// *inbound* session initiation after a newer one has been published.
/// Chosen as a tunable default, not dictated by the protocol itself.
pub const SIGNED_PREKEY_GRACE_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const X25519_DERIVATION_INFO: &[u8] = b"SolConnect-X25519-Derivation";

/// A 32-byte Ed25519 public key, used as both identity and routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalletAddress(pub [u8; 32]);

impl WalletAddress {
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        let bytes = bs58::decode(s).into_vec().ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// Long-lived Ed25519 keypair for a wallet. The private half never leaves
/// this struct; it is zeroized on drop by `ed25519_dalek::SigningKey`.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn wallet(&self) -> WalletAddress {
        WalletAddress(self.signing_key.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Deterministically derives the X25519 key-agreement keypair used for
    /// X3DH and the Double Ratchet. Never reused for signing: a distinct
    /// domain-separation string keeps this derivation independent of any
    /// other HKDF expansion keyed off the same identity.
    pub fn derive_agreement_key(&self) -> DerivedKeyAgreementKey {
        let ikm = self.signing_key.to_bytes();
        let salt = self.signing_key.verifying_key().to_bytes();
        let secret_bytes: [u8; 32] =
            primitives::hkdf_expand::<32>(&salt, &ikm, X25519_DERIVATION_INFO)
                .expect("32-byte HKDF expansion cannot fail");
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        DerivedKeyAgreementKey { secret, public }
    }
}

/// X25519 keypair derived from an [`IdentityKeyPair`]; used only for key
/// agreement, never for signing.
#[derive(Clone)]
pub struct DerivedKeyAgreementKey {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

#[derive(Clone)]
struct SignedPreKey {
    generation: u32,
    secret: StaticSecret,
    public: PublicKey,
    signature: [u8; 64],
    rotated_at: SystemTime,
}

impl SignedPreKey {
    fn generate(generation: u32, identity: &IdentityKeyPair) -> Self {
        let (secret, public) = primitives::generate_x25519_keypair();
        let signature = identity.sign(public.as_bytes());
        Self {
            generation,
            secret,
            public,
            signature,
            rotated_at: SystemTime::now(),
        }
    }
}

/// Published by a wallet so others can initiate sessions with it.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub wallet: WalletAddress,
    pub identity_public: VerifyingKey,
    /// X25519 form of the identity key, derived via
    /// [`IdentityKeyPair::derive_agreement_key`]. Published alongside the
    /// signing key because the derivation needs the private identity key as
    /// input material — peers cannot recompute it from `identity_public`
    /// alone.
    pub identity_agreement_public: PublicKey,
    pub signed_prekey_generation: u32,
    pub signed_prekey: PublicKey,
    pub signed_prekey_signature: [u8; 64],
    pub one_time_prekey_id: Option<u32>,
    pub one_time_prekey: Option<PublicKey>,
}

impl PreKeyBundle {
    /// Verifies the signed prekey's signature under the claimed identity key.
    /// Every initiator must call this before starting X3DH.
    pub fn verify(&self) -> Result<(), IdentityError> {
        self.identity_public
            .verify(self.signed_prekey.as_bytes(), &ed25519_dalek::Signature::from_bytes(&self.signed_prekey_signature))
            .map_err(|_| IdentityError::BundleInvalid)
    }
}

struct WalletRecord {
    identity: IdentityKeyPair,
    current_spk: SignedPreKey,
    previous_spk: Option<SignedPreKey>,
    one_time_prekeys: HashMap<u32, StaticSecret>,
    next_otk_id: u32,
}

impl WalletRecord {
    fn new(identity: IdentityKeyPair) -> Self {
        let current_spk = SignedPreKey::generate(0, &identity);
        let mut record = Self {
            identity,
            current_spk,
            previous_spk: None,
            one_time_prekeys: HashMap::new(),
            next_otk_id: 0,
        };
        for _ in 0..10 {
            record.add_one_time_prekey();
        }
        record
    }

    fn add_one_time_prekey(&mut self) -> u32 {
        let id = self.next_otk_id;
        self.next_otk_id += 1;
        let (secret, _public) = primitives::generate_x25519_keypair();
        self.one_time_prekeys.insert(id, secret);
        id
    }

    fn prune_expired_previous_spk(&mut self) {
        if let Some(prev) = &self.previous_spk {
            if prev
                .rotated_at
                .elapsed()
                .map(|age| age > SIGNED_PREKEY_GRACE_PERIOD)
                .unwrap_or(false)
            {
                self.previous_spk = None;
            }
        }
    }

    fn accepts_generation(&self, generation: u32) -> bool {
        if generation == self.current_spk.generation {
            return true;
        }
        self.previous_spk
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false)
    }
}

/// Storage contract for per-wallet identity/prekey material. The default
/// in-memory implementation is sufficient for the relay's own tests and for
/// a single-process SDK; a persistent implementation is a client concern
/// this crate does not provide (see persisted-state notes in the workspace
/// spec document).
pub trait IdentityStore: Send + Sync {
    fn get_or_create_identity(&self, wallet: WalletAddress) -> IdentityKeyPair;
    /// Seeds the store with an identity the caller already holds (e.g. a
    /// real wallet signing key), generating its first signed prekey and
    /// one-time prekeys. A no-op if that wallet already has a record.
    fn insert_identity(&self, identity: IdentityKeyPair) -> WalletAddress;
    fn publish_prekey_bundle(&self, wallet: WalletAddress) -> Result<PreKeyBundle, IdentityError>;
    fn consume_one_time_prekey(
        &self,
        wallet: WalletAddress,
        id: u32,
    ) -> Result<Option<StaticSecret>, IdentityError>;
    fn rotate_signed_prekey(&self, wallet: WalletAddress) -> Result<(), IdentityError>;
    fn accepts_signed_prekey_generation(
        &self,
        wallet: WalletAddress,
        generation: u32,
    ) -> Result<bool, IdentityError>;
    /// Retrieves the X25519 secret for a signed prekey generation still
    /// inside the rotation grace period. Used by the responder side of the
    /// session handshake to perform the mirror DH computations.
    fn signed_prekey_secret(
        &self,
        wallet: WalletAddress,
        generation: u32,
    ) -> Result<StaticSecret, IdentityError>;
}

/// Reference in-memory `IdentityStore`. Holds every wallet identity this
/// process has generated; nothing survives a restart.
pub struct InMemoryIdentityStore {
    wallets: Mutex<HashMap<WalletAddress, WalletRecord>>,
}

impl Default for InMemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            wallets: Mutex::new(HashMap::new()),
        }
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn get_or_create_identity(&self, wallet: WalletAddress) -> IdentityKeyPair {
        let mut wallets = self.wallets.lock();
        wallets
            .entry(wallet)
            .or_insert_with(|| WalletRecord::new(IdentityKeyPair::generate()))
            .identity
            .clone()
    }

    fn insert_identity(&self, identity: IdentityKeyPair) -> WalletAddress {
        let wallet = identity.wallet();
        let mut wallets = self.wallets.lock();
        wallets
            .entry(wallet)
            .or_insert_with(|| WalletRecord::new(identity));
        wallet
    }

    fn publish_prekey_bundle(&self, wallet: WalletAddress) -> Result<PreKeyBundle, IdentityError> {
        let mut wallets = self.wallets.lock();
        let record = wallets
            .get_mut(&wallet)
            .ok_or(IdentityError::UnknownWallet)?;
        record.prune_expired_previous_spk();

        let otk_id = record
            .one_time_prekeys
            .keys()
            .min()
            .copied()
            .unwrap_or_else(|| record.add_one_time_prekey());
        let otk_public = record
            .one_time_prekeys
            .get(&otk_id)
            .map(PublicKey::from);

        Ok(PreKeyBundle {
            wallet,
            identity_public: record.identity.verifying_key(),
            identity_agreement_public: record.identity.derive_agreement_key().public,
            signed_prekey_generation: record.current_spk.generation,
            signed_prekey: record.current_spk.public,
            signed_prekey_signature: record.current_spk.signature,
            one_time_prekey_id: otk_public.map(|_| otk_id),
            one_time_prekey: otk_public,
        })
    }

    fn consume_one_time_prekey(
        &self,
        wallet: WalletAddress,
        id: u32,
    ) -> Result<Option<StaticSecret>, IdentityError> {
        let mut wallets = self.wallets.lock();
        let record = wallets
            .get_mut(&wallet)
            .ok_or(IdentityError::UnknownWallet)?;
        match record.one_time_prekeys.remove(&id) {
            Some(secret) => Ok(Some(secret)),
            None => Err(IdentityError::PreKeyAlreadyConsumed(id)),
        }
    }

    fn rotate_signed_prekey(&self, wallet: WalletAddress) -> Result<(), IdentityError> {
        let mut wallets = self.wallets.lock();
        let record = wallets
            .get_mut(&wallet)
            .ok_or(IdentityError::UnknownWallet)?;
        let next_generation = record.current_spk.generation + 1;
        let new_spk = SignedPreKey::generate(next_generation, &record.identity);
        let retiring = std::mem::replace(&mut record.current_spk, new_spk);
        record.previous_spk = Some(retiring);
        Ok(())
    }

    fn accepts_signed_prekey_generation(
        &self,
        wallet: WalletAddress,
        generation: u32,
    ) -> Result<bool, IdentityError> {
        let mut wallets = self.wallets.lock();
        let record = wallets
            .get_mut(&wallet)
            .ok_or(IdentityError::UnknownWallet)?;
        record.prune_expired_previous_spk();
        Ok(record.accepts_generation(generation))
    }

    fn signed_prekey_secret(
        &self,
        wallet: WalletAddress,
        generation: u32,
    ) -> Result<StaticSecret, IdentityError> {
        let mut wallets = self.wallets.lock();
        let record = wallets
            .get_mut(&wallet)
            .ok_or(IdentityError::UnknownWallet)?;
        record.prune_expired_previous_spk();
        if record.current_spk.generation == generation {
            return Ok(record.current_spk.secret.clone());
        }
        record
            .previous_spk
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| p.secret.clone())
            .ok_or(IdentityError::BundleInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_signature_verifies() {
        let store = InMemoryIdentityStore::new();
        let wallet = IdentityKeyPair::generate().wallet();
        store.get_or_create_identity(wallet);
        let bundle = store.publish_prekey_bundle(wallet).unwrap();
        bundle.verify().unwrap();
    }

    #[test]
    fn one_time_prekey_is_single_use() {
        let store = InMemoryIdentityStore::new();
        let wallet = IdentityKeyPair::generate().wallet();
        store.get_or_create_identity(wallet);
        let bundle = store.publish_prekey_bundle(wallet).unwrap();
        let id = bundle.one_time_prekey_id.unwrap();

        store.consume_one_time_prekey(wallet, id).unwrap();
        assert!(matches!(
            store.consume_one_time_prekey(wallet, id),
            Err(IdentityError::PreKeyAlreadyConsumed(_))
        ));
    }

    #[test]
    fn rotation_keeps_previous_generation_in_grace_period() {
        let store = InMemoryIdentityStore::new();
        let wallet = IdentityKeyPair::generate().wallet();
        store.get_or_create_identity(wallet);
        let before = store.publish_prekey_bundle(wallet).unwrap();

        store.rotate_signed_prekey(wallet).unwrap();
        let after = store.publish_prekey_bundle(wallet).unwrap();

        assert_ne!(
            before.signed_prekey_generation,
            after.signed_prekey_generation
        );
        assert!(
            store
                .accepts_signed_prekey_generation(wallet, before.signed_prekey_generation)
                .unwrap()
        );
        assert!(
            store
                .accepts_signed_prekey_generation(wallet, after.signed_prekey_generation)
                .unwrap()
        );
    }

    #[test]
    fn wallet_round_trips_through_base58() {
        let wallet = IdentityKeyPair::generate().wallet();
        let encoded = wallet.to_base58();
        assert_eq!(WalletAddress::from_base58(&encoded), Some(wallet));
    }

    #[test]
    fn insert_identity_preserves_the_given_signing_key() {
        let store = InMemoryIdentityStore::new();
        let identity = IdentityKeyPair::generate();
        let wallet = identity.wallet();

        let inserted = store.insert_identity(identity.clone());
        assert_eq!(inserted, wallet);

        let bundle = store.publish_prekey_bundle(wallet).unwrap();
        assert_eq!(bundle.identity_public, identity.verifying_key());
        bundle.verify().unwrap();
    }

    #[test]
    fn insert_identity_is_a_no_op_for_an_existing_wallet() {
        let store = InMemoryIdentityStore::new();
        let identity = IdentityKeyPair::generate();
        let wallet = identity.wallet();

        store.insert_identity(identity.clone());
        let before = store.publish_prekey_bundle(wallet).unwrap();

        // A second insert for the same wallet must not clobber the
        // already-generated prekeys with a fresh set.
        store.insert_identity(identity);
        let after = store.publish_prekey_bundle(wallet).unwrap();
        assert_eq!(before.signed_prekey, after.signed_prekey);
    }
}
