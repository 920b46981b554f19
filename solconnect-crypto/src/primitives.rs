//! Thin, zeroizing wrappers around the raw crypto operations the session
//! protocol is built from: Ed25519 signing, X25519 key agreement,
//! HKDF-SHA256 derivation, and AES-256-GCM authenticated encryption.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, AeadCore, Nonce};
use ed25519_dalek::{Signer, Verifier};
use hmac::Mac;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = hmac::Hmac<Sha256>;

pub fn generate_x25519_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Raw X25519 Diffie-Hellman. The output is zeroized by the caller once
/// folded into a derived key.
pub fn diffie_hellman(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

pub fn sign(signing_key: &ed25519_dalek::SigningKey, message: &[u8]) -> [u8; 64] {
    signing_key.sign(message).to_bytes()
}

pub fn verify(
    verifying_key: &ed25519_dalek::VerifyingKey,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// HKDF-SHA256 extract-and-expand with explicit salt and info, producing
/// exactly `N` bytes. Used for every key derivation in the session protocol
/// so the domain-separation strings live at the call site, not here.
pub fn hkdf_expand<const N: usize>(
    salt: &[u8],
    ikm: &[u8],
    info: &[u8],
) -> Result<[u8; N], CryptoError> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; N];
    hk.expand(info, &mut out)
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(out)
}

/// `message_key = HMAC-SHA256(chain_key, 0x01)`, `next_chain_key =
/// HMAC-SHA256(chain_key, 0x02)`. Returns `(next_chain_key, message_key)`.
pub fn kdf_chain_step(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let message_key = hmac_once(chain_key, &[0x01]);
    let next_chain_key = hmac_once(chain_key, &[0x02]);
    (next_chain_key, message_key)
}

fn hmac_once(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as hmac::digest::KeyInit>::new_from_slice(key)
        .expect("32-byte key is valid for HMAC-SHA256");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

/// Nonce for message counter `counter`: big-endian, left-padded to 96 bits.
/// Never transmitted — both sides derive it from the header's counter field.
pub fn nonce_from_counter(counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

pub fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptAuthFailure)
}

pub fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptAuthFailure)
}

/// Generates a fresh AES-GCM nonce. Only used where the nonce has no other
/// source of uniqueness (none of the session-protocol paths use this; it
/// exists for direct callers of the primitives, e.g. encrypting prekey
/// bundle storage on the client).
pub fn random_nonce() -> [u8; 12] {
    Aes256Gcm::generate_nonce(&mut OsRng).into()
}

/// Best-effort zeroization helper for stack-local secret buffers that don't
/// already implement `Zeroize` via the crates that own them (`StaticSecret`
/// and `SigningKey` zeroize themselves on drop).
pub fn zeroize_bytes(buf: &mut [u8]) {
    buf.zeroize();
}
