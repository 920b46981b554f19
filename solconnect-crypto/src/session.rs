//! X3DH-style handshake and Double Ratchet session protocol (C4).

use std::collections::{HashMap, VecDeque};

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::SessionError;
use crate::identity::{IdentityKeyPair, IdentityStore, PreKeyBundle, WalletAddress};
use crate::primitives;

/// Cap on the skipped-message-key map, shared by every session. Bounds
/// memory under an adversarial or badly-behaved peer that inflates counters.
pub const MAX_SKIPPED_KEYS: u32 = 1000;

const ROOT_KEY_INFO: &[u8] = b"SolConnect-Root-Key";
const SESSION_ID_INFO: &[u8] = b"SolConnect-Session-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initiating,
    Established,
    Terminated,
}

/// Clear-text header attached to every ratcheted message. Authenticated as
/// AAD, never encrypted, needed by the receiver to pick the right chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    pub dh_public: [u8; 32],
    pub previous_counter: u32,
    pub counter: u32,
}

impl RatchetHeader {
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.dh_public);
        out[32..36].copy_from_slice(&self.previous_counter.to_be_bytes());
        out[36..].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SessionError> {
        if data.len() != 40 {
            return Err(SessionError::InvalidState);
        }
        let mut dh_public = [0u8; 32];
        dh_public.copy_from_slice(&data[..32]);
        Ok(Self {
            dh_public,
            previous_counter: u32::from_be_bytes(data[32..36].try_into().unwrap()),
            counter: u32::from_be_bytes(data[36..].try_into().unwrap()),
        })
    }
}

/// Carried only on the first message of a session so the responder can
/// perform the mirror X3DH computation. `sender_identity_agreement_public`
/// travels here rather than being looked up separately, since the core does
/// not model a prekey-bundle directory lookup as part of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialHandshake {
    pub ephemeral_public: [u8; 32],
    pub sender_identity_agreement_public: [u8; 32],
    pub signed_prekey_generation: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// Per-ordered-pair Double Ratchet session.
pub struct Session {
    session_id: [u8; 32],
    local_wallet: WalletAddress,
    remote_wallet: WalletAddress,
    state: SessionState,
    is_initiator: bool,

    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    sending_dh_keypair: (StaticSecret, PublicKey),
    remote_dh_public: Option<PublicKey>,

    send_counter: u32,
    recv_counter: u32,
    previous_counter: u32,

    skipped_message_keys: HashMap<([u8; 32], u32), [u8; 32]>,
    skip_insertion_order: VecDeque<([u8; 32], u32)>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(key) = self.sending_chain_key.as_mut() {
            key.zeroize();
        }
        if let Some(key) = self.receiving_chain_key.as_mut() {
            key.zeroize();
        }
        for key in self.skipped_message_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl Session {
    pub fn session_id(&self) -> [u8; 32] {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_wallet(&self) -> WalletAddress {
        self.local_wallet
    }

    pub fn remote_wallet(&self) -> WalletAddress {
        self.remote_wallet
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_message_keys.len()
    }

    /// Deterministic id for the ordered pair `(local, remote)` — both
    /// endpoints of a session compute the same id regardless of which side
    /// initiated.
    pub fn compute_session_id(a: WalletAddress, b: WalletAddress) -> [u8; 32] {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        let mut ikm = Vec::with_capacity(64);
        ikm.extend_from_slice(&lo.0);
        ikm.extend_from_slice(&hi.0);
        primitives::hkdf_expand::<32>(&[0u8; 32], &ikm, SESSION_ID_INFO)
            .expect("32-byte HKDF expansion cannot fail")
    }

    /// Initiator side of the handshake: verifies `responder_bundle`, runs
    /// X3DH, and performs the first DH ratchet step so the session is ready
    /// to encrypt immediately. Returns the session alongside the handshake
    /// reference that must ride on the first outgoing message.
    pub fn initiate(
        local_identity: &IdentityKeyPair,
        responder_bundle: &PreKeyBundle,
    ) -> Result<(Session, InitialHandshake), SessionError> {
        responder_bundle
            .verify()
            .map_err(|_| SessionError::SessionHandshakeFailed)?;

        let local_wallet = local_identity.wallet();
        let remote_wallet = responder_bundle.wallet;
        let local_agreement = local_identity.derive_agreement_key();
        let (ephemeral_secret, ephemeral_public) = primitives::generate_x25519_keypair();

        let dh1 = primitives::diffie_hellman(&local_agreement.secret, &responder_bundle.signed_prekey);
        let dh2 = primitives::diffie_hellman(
            &ephemeral_secret,
            &responder_bundle.identity_agreement_public,
        );
        let dh3 = primitives::diffie_hellman(&ephemeral_secret, &responder_bundle.signed_prekey);

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(&dh1);
        ikm.extend_from_slice(&dh2);
        ikm.extend_from_slice(&dh3);
        if let Some(otk_public) = responder_bundle.one_time_prekey {
            ikm.extend_from_slice(&primitives::diffie_hellman(&ephemeral_secret, &otk_public));
        }

        let root_key = kdf_initial_root(&ikm)?;

        // First DH ratchet step: Alice's initial sending-chain partner is
        // Bob's signed prekey, matching the remote key he'll recognize.
        let (ratchet_secret, ratchet_public) = primitives::generate_x25519_keypair();
        let dh_out = primitives::diffie_hellman(&ratchet_secret, &responder_bundle.signed_prekey);
        let (root_key, sending_chain_key) = kdf_root(&root_key, &dh_out)?;

        let session = Session {
            session_id: Self::compute_session_id(local_wallet, remote_wallet),
            local_wallet,
            remote_wallet,
            state: SessionState::Initiating,
            is_initiator: true,
            root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            sending_dh_keypair: (ratchet_secret, ratchet_public),
            remote_dh_public: Some(responder_bundle.signed_prekey),
            send_counter: 0,
            recv_counter: 0,
            previous_counter: 0,
            skipped_message_keys: HashMap::new(),
            skip_insertion_order: VecDeque::new(),
        };

        let handshake = InitialHandshake {
            ephemeral_public: ephemeral_public.to_bytes(),
            sender_identity_agreement_public: local_agreement.public.to_bytes(),
            signed_prekey_generation: responder_bundle.signed_prekey_generation,
            one_time_prekey_id: responder_bundle.one_time_prekey_id,
        };

        Ok((session, handshake))
    }

    /// Responder side: mirrors the initiator's DH computations using the
    /// referenced signed-prekey generation and one-time prekey, then waits
    /// for the first `decrypt` call to confirm the handshake. No session
    /// state is retained if this fails.
    pub fn respond(
        local_identity: &IdentityKeyPair,
        store: &dyn IdentityStore,
        sender_wallet: WalletAddress,
        handshake: &InitialHandshake,
    ) -> Result<Session, SessionError> {
        let local_wallet = local_identity.wallet();

        if !store
            .accepts_signed_prekey_generation(local_wallet, handshake.signed_prekey_generation)
            .map_err(|_| SessionError::SessionHandshakeFailed)?
        {
            return Err(SessionError::SessionHandshakeFailed);
        }
        let spk_secret = store
            .signed_prekey_secret(local_wallet, handshake.signed_prekey_generation)
            .map_err(|_| SessionError::SessionHandshakeFailed)?;
        let spk_public = PublicKey::from(&spk_secret);

        let otk_secret = match handshake.one_time_prekey_id {
            Some(id) => Some(
                store
                    .consume_one_time_prekey(local_wallet, id)
                    .map_err(|_| SessionError::SessionHandshakeFailed)?
                    .ok_or(SessionError::SessionHandshakeFailed)?,
            ),
            None => None,
        };

        let identity_agreement = local_identity.derive_agreement_key();
        let ephemeral_public = PublicKey::from(handshake.ephemeral_public);
        let sender_identity_agreement_public =
            PublicKey::from(handshake.sender_identity_agreement_public);

        let dh1 = primitives::diffie_hellman(&spk_secret, &sender_identity_agreement_public);
        let dh2 = primitives::diffie_hellman(&identity_agreement.secret, &ephemeral_public);
        let dh3 = primitives::diffie_hellman(&spk_secret, &ephemeral_public);

        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(&dh1);
        ikm.extend_from_slice(&dh2);
        ikm.extend_from_slice(&dh3);
        if let Some(otk_secret) = &otk_secret {
            ikm.extend_from_slice(&primitives::diffie_hellman(otk_secret, &ephemeral_public));
        }

        let root_key = kdf_initial_root(&ikm)?;

        Ok(Session {
            session_id: Self::compute_session_id(local_wallet, sender_wallet),
            local_wallet,
            remote_wallet: sender_wallet,
            state: SessionState::Initiating,
            is_initiator: false,
            root_key,
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_dh_keypair: (spk_secret, spk_public),
            remote_dh_public: None,
            send_counter: 0,
            recv_counter: 0,
            previous_counter: 0,
            skipped_message_keys: HashMap::new(),
            skip_insertion_order: VecDeque::new(),
        })
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), SessionError> {
        self.ensure_ready_for_crypto()?;
        let chain_key = self.sending_chain_key.ok_or(SessionError::InvalidState)?;
        let (next_chain_key, message_key) = primitives::kdf_chain_step(&chain_key);
        self.sending_chain_key = Some(next_chain_key);

        let header = RatchetHeader {
            dh_public: self.sending_dh_keypair.1.to_bytes(),
            previous_counter: self.previous_counter,
            counter: self.send_counter,
        };
        self.send_counter += 1;

        let nonce = primitives::nonce_from_counter(header.counter);
        let ciphertext =
            primitives::aead_encrypt(&message_key, &nonce, plaintext, &header.to_bytes())?;

        self.mark_established_if_initiating();
        Ok((header, ciphertext))
    }

    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_ready_for_crypto()?;

        let skip_key = (header.dh_public, header.counter);
        if let Some(message_key) = self.skipped_message_keys.remove(&skip_key) {
            self.skip_insertion_order.retain(|k| *k != skip_key);
            let nonce = primitives::nonce_from_counter(header.counter);
            let plaintext =
                primitives::aead_decrypt(&message_key, &nonce, ciphertext, &header.to_bytes())?;
            self.mark_established_if_initiating();
            return Ok(plaintext);
        }

        let remote_changed = match &self.remote_dh_public {
            Some(current) => current.to_bytes() != header.dh_public,
            None => true,
        };
        if remote_changed {
            self.perform_dh_ratchet_step(header)?;
        }

        if header.counter < self.recv_counter {
            let is_current_chain = self
                .remote_dh_public
                .map(|k| k.to_bytes() == header.dh_public)
                .unwrap_or(false);
            return Err(if is_current_chain && header.counter + 1 == self.recv_counter {
                SessionError::DuplicateCounter
            } else {
                SessionError::MessageKeyNotAvailable
            });
        }
        if header.counter > self.recv_counter {
            self.skip_to(header.dh_public, header.counter)?;
        }

        let chain_key = self.receiving_chain_key.ok_or(SessionError::InvalidState)?;
        let (next_chain_key, message_key) = primitives::kdf_chain_step(&chain_key);
        self.receiving_chain_key = Some(next_chain_key);
        self.recv_counter = header.counter + 1;

        let nonce = primitives::nonce_from_counter(header.counter);
        let plaintext =
            primitives::aead_decrypt(&message_key, &nonce, ciphertext, &header.to_bytes())?;
        self.mark_established_if_initiating();
        Ok(plaintext)
    }

    pub fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        self.root_key.zeroize();
        if let Some(key) = self.sending_chain_key.as_mut() {
            key.zeroize();
        }
        if let Some(key) = self.receiving_chain_key.as_mut() {
            key.zeroize();
        }
        self.sending_chain_key = None;
        self.receiving_chain_key = None;
        for key in self.skipped_message_keys.values_mut() {
            key.zeroize();
        }
        self.skipped_message_keys.clear();
        self.skip_insertion_order.clear();
    }

    fn ensure_ready_for_crypto(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Initiating | SessionState::Established => Ok(()),
            SessionState::Uninitialized => Err(SessionError::InvalidState),
            SessionState::Terminated => Err(SessionError::SessionTerminated),
        }
    }

    fn mark_established_if_initiating(&mut self) {
        if self.state == SessionState::Initiating {
            self.state = SessionState::Established;
        }
    }

    fn perform_dh_ratchet_step(&mut self, header: &RatchetHeader) -> Result<(), SessionError> {
        if let (Some(chain_key), Some(remote_public)) =
            (self.receiving_chain_key, self.remote_dh_public)
        {
            self.skip_chain(chain_key, remote_public.to_bytes(), header.previous_counter)?;
        }

        let their_new_public = PublicKey::from(header.dh_public);
        let dh_out = primitives::diffie_hellman(&self.sending_dh_keypair.0, &their_new_public);
        let (new_root, new_receiving_chain) = kdf_root(&self.root_key, &dh_out)?;
        self.root_key = new_root;
        self.receiving_chain_key = Some(new_receiving_chain);
        self.recv_counter = 0;
        self.remote_dh_public = Some(their_new_public);

        self.previous_counter = self.send_counter;
        self.send_counter = 0;
        let (new_secret, new_public) = primitives::generate_x25519_keypair();
        let dh_out = primitives::diffie_hellman(&new_secret, &their_new_public);
        let (new_root, new_sending_chain) = kdf_root(&self.root_key, &dh_out)?;
        self.root_key = new_root;
        self.sending_chain_key = Some(new_sending_chain);
        self.sending_dh_keypair = (new_secret, new_public);
        Ok(())
    }

    /// Skips forward in the *current* receiving chain, storing each
    /// intermediate message key so a later out-of-order message can still
    /// be decrypted.
    fn skip_to(&mut self, dh_public: [u8; 32], until: u32) -> Result<(), SessionError> {
        let from = self.recv_counter;
        let chain_key = self.receiving_chain_key.ok_or(SessionError::InvalidState)?;
        let mut chain_key = chain_key;
        for n in from..until {
            let (next_chain_key, message_key) = primitives::kdf_chain_step(&chain_key);
            self.insert_skipped((dh_public, n), message_key);
            chain_key = next_chain_key;
        }
        self.receiving_chain_key = Some(chain_key);
        self.recv_counter = until;
        Ok(())
    }

    /// Skips to the end of a chain that is about to be replaced by a DH
    /// ratchet step, so messages still in flight on the old chain remain
    /// decryptable.
    fn skip_chain(
        &mut self,
        mut chain_key: [u8; 32],
        dh_public: [u8; 32],
        until: u32,
    ) -> Result<(), SessionError> {
        let from = self.recv_counter;
        for n in from..until {
            let (next_chain_key, message_key) = primitives::kdf_chain_step(&chain_key);
            self.insert_skipped((dh_public, n), message_key);
            chain_key = next_chain_key;
        }
        Ok(())
    }

    fn insert_skipped(&mut self, key: ([u8; 32], u32), value: [u8; 32]) {
        if self.skipped_message_keys.len() as u32 >= MAX_SKIPPED_KEYS {
            if let Some(oldest) = self.skip_insertion_order.pop_front() {
                if let Some(mut evicted) = self.skipped_message_keys.remove(&oldest) {
                    evicted.zeroize();
                }
            }
        }
        self.skip_insertion_order.push_back(key);
        self.skipped_message_keys.insert(key, value);
    }
}

fn kdf_initial_root(ikm: &[u8]) -> Result<[u8; 32], SessionError> {
    primitives::hkdf_expand::<32>(&[0u8; 32], ikm, ROOT_KEY_INFO).map_err(SessionError::from)
}

fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), SessionError> {
    let expanded: [u8; 64] = primitives::hkdf_expand::<64>(root_key, dh_out, ROOT_KEY_INFO)?;
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&expanded[..32]);
    chain_key.copy_from_slice(&expanded[32..]);
    Ok((new_root, chain_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryIdentityStore;

    fn handshake() -> (
        IdentityKeyPair,
        InMemoryIdentityStore,
        WalletAddress,
        Session,
        InitialHandshake,
    ) {
        let responder_store = InMemoryIdentityStore::new();
        let responder_identity = IdentityKeyPair::generate();
        let responder_wallet = responder_identity.wallet();
        responder_store.get_or_create_identity(responder_wallet);
        let bundle = responder_store.publish_prekey_bundle(responder_wallet).unwrap();

        let initiator_identity = IdentityKeyPair::generate();
        let (session, handshake) = Session::initiate(&initiator_identity, &bundle).unwrap();
        (
            initiator_identity,
            responder_store,
            responder_wallet,
            session,
            handshake,
        )
    }

    fn established_pair() -> (Session, Session) {
        let (initiator_identity, responder_store, responder_wallet, mut alice, handshake) =
            handshake();
        let responder_identity = responder_store.get_or_create_identity(responder_wallet);
        let mut bob = Session::respond(
            &responder_identity,
            &responder_store,
            initiator_identity.wallet(),
            &handshake,
        )
        .unwrap();

        let (header, ciphertext) = alice.encrypt(b"hello").unwrap();
        assert_eq!(bob.decrypt(&header, &ciphertext).unwrap(), b"hello");
        (alice, bob)
    }

    #[test]
    fn basic_handshake_and_round_trip() {
        let (mut alice, mut bob) = established_pair();
        assert_eq!(alice.state(), SessionState::Established);
        assert_eq!(bob.state(), SessionState::Established);

        let (header, ct) = bob.encrypt(b"hi back").unwrap();
        assert_eq!(alice.decrypt(&header, &ct).unwrap(), b"hi back");
    }

    #[test]
    fn both_sides_compute_same_session_id() {
        let (alice, bob) = established_pair();
        assert_eq!(alice.session_id(), bob.session_id());
    }

    #[test]
    fn bundle_with_invalid_signature_is_rejected() {
        let store = InMemoryIdentityStore::new();
        let responder_wallet = IdentityKeyPair::generate().wallet();
        store.get_or_create_identity(responder_wallet);
        let mut bundle = store.publish_prekey_bundle(responder_wallet).unwrap();
        bundle.signed_prekey_signature[0] ^= 0xFF;

        let initiator = IdentityKeyPair::generate();
        assert!(matches!(
            Session::initiate(&initiator, &bundle),
            Err(SessionError::SessionHandshakeFailed)
        ));
    }

    #[test]
    fn many_messages_one_direction() {
        let (mut alice, mut bob) = established_pair();
        for i in 0..50u32 {
            let msg = format!("message {i}");
            let (header, ct) = alice.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&header, &ct).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn out_of_order_delivery_all_decrypt() {
        let (mut alice, mut bob) = established_pair();
        let (h0, c0) = alice.encrypt(b"m0").unwrap();
        let (h1, c1) = alice.encrypt(b"m1").unwrap();
        let (h2, c2) = alice.encrypt(b"m2").unwrap();

        assert_eq!(bob.decrypt(&h2, &c2).unwrap(), b"m2");
        assert_eq!(bob.decrypt(&h0, &c0).unwrap(), b"m0");
        assert_eq!(bob.decrypt(&h1, &c1).unwrap(), b"m1");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn replaying_a_consumed_message_fails() {
        let (mut alice, mut bob) = established_pair();
        let (header, ct) = alice.encrypt(b"once").unwrap();
        bob.decrypt(&header, &ct).unwrap();
        assert!(bob.decrypt(&header, &ct).is_err());
    }

    #[test]
    fn dh_ratchet_round_trip_and_post_compromise_secrecy() {
        let (mut alice, mut bob) = established_pair();

        let (h, c) = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&h, &c).unwrap();

        let (h, c) = alice.encrypt(b"another").unwrap();
        bob.decrypt(&h, &c).unwrap();

        assert_ne!(alice.sending_dh_keypair.1.to_bytes(), [0u8; 32]);
    }

    #[test]
    fn skipped_key_cap_evicts_oldest_but_the_chain_still_advances() {
        let (mut alice, mut bob) = established_pair();
        let mut sent = Vec::new();
        for i in 0..(MAX_SKIPPED_KEYS + 5) {
            let (header, ct) = alice.encrypt(format!("message {i}").as_bytes()).unwrap();
            sent.push((header, ct));
        }

        // Decrypting only the newest message forces bob to skip over every
        // earlier counter in one jump; the cache can only hold the most
        // recent MAX_SKIPPED_KEYS of them.
        let (last_header, last_ct) = sent.last().unwrap().clone();
        bob.decrypt(&last_header, &last_ct).unwrap();

        let (oldest_header, oldest_ct) = sent.first().unwrap().clone();
        assert!(matches!(
            bob.decrypt(&oldest_header, &oldest_ct),
            Err(SessionError::MessageKeyNotAvailable)
        ));

        // A counter within the retained window still decrypts.
        let (recent_header, recent_ct) = sent[sent.len() - 2].clone();
        bob.decrypt(&recent_header, &recent_ct).unwrap();
    }

    #[test]
    fn terminated_session_rejects_crypto() {
        let (mut alice, _bob) = established_pair();
        alice.terminate();
        assert!(matches!(
            alice.encrypt(b"too late"),
            Err(SessionError::SessionTerminated)
        ));
    }
}
