//! Fixed binary layout of the bytes that ride inside a chat frame's
//! `encrypted_payload` field: `{version, sender_wallet, header, ciphertext,
//! optional handshake reference}`. This is what the session protocol hands
//! the SDK to send, and what the SDK hands back to decrypt.

use crate::identity::WalletAddress;
use crate::session::{InitialHandshake, RatchetHeader};

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnvelope {
    pub version: u8,
    pub sender_wallet: WalletAddress,
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
    pub handshake: Option<InitialHandshake>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope version is not supported")]
    UnsupportedVersion,
    #[error("envelope bytes are truncated or malformed")]
    Malformed,
}

impl SessionEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 40 + 4 + self.ciphertext.len() + 1 + 69);
        out.push(self.version);
        out.extend_from_slice(&self.sender_wallet.0);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        match &self.handshake {
            Some(h) => {
                out.push(1);
                out.extend_from_slice(&h.ephemeral_public);
                out.extend_from_slice(&h.sender_identity_agreement_public);
                out.extend_from_slice(&h.signed_prekey_generation.to_be_bytes());
                match h.one_time_prekey_id {
                    Some(id) => {
                        out.push(1);
                        out.extend_from_slice(&id.to_be_bytes());
                    }
                    None => out.push(0),
                }
            }
            None => out.push(0),
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut cursor = 0usize;
        let version = *data.get(cursor).ok_or(EnvelopeError::Malformed)?;
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion);
        }
        cursor += 1;

        let sender_wallet = read_array::<32>(data, &mut cursor)?;
        let header = RatchetHeader::from_bytes(read_slice(data, &mut cursor, 40)?)
            .map_err(|_| EnvelopeError::Malformed)?;

        let ct_len = u32::from_be_bytes(read_array::<4>(data, &mut cursor)?) as usize;
        let ciphertext = read_slice(data, &mut cursor, ct_len)?.to_vec();

        let has_handshake = *data.get(cursor).ok_or(EnvelopeError::Malformed)?;
        cursor += 1;
        let handshake = if has_handshake == 1 {
            let ephemeral_public = read_array::<32>(data, &mut cursor)?;
            let sender_identity_agreement_public = read_array::<32>(data, &mut cursor)?;
            let signed_prekey_generation = u32::from_be_bytes(read_array::<4>(data, &mut cursor)?);
            let has_otk = *data.get(cursor).ok_or(EnvelopeError::Malformed)?;
            cursor += 1;
            let one_time_prekey_id = if has_otk == 1 {
                Some(u32::from_be_bytes(read_array::<4>(data, &mut cursor)?))
            } else {
                None
            };
            Some(InitialHandshake {
                ephemeral_public,
                sender_identity_agreement_public,
                signed_prekey_generation,
                one_time_prekey_id,
            })
        } else {
            None
        };

        Ok(Self {
            version,
            sender_wallet: WalletAddress(sender_wallet),
            header,
            ciphertext,
            handshake,
        })
    }
}

fn read_slice<'a>(
    data: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], EnvelopeError> {
    let end = cursor.checked_add(len).ok_or(EnvelopeError::Malformed)?;
    let slice = data.get(*cursor..end).ok_or(EnvelopeError::Malformed)?;
    *cursor = end;
    Ok(slice)
}

fn read_array<const N: usize>(data: &[u8], cursor: &mut usize) -> Result<[u8; N], EnvelopeError> {
    let slice = read_slice(data, cursor, N)?;
    slice.try_into().map_err(|_| EnvelopeError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RatchetHeader {
        RatchetHeader {
            dh_public: [9u8; 32],
            previous_counter: 3,
            counter: 7,
        }
    }

    #[test]
    fn round_trips_without_handshake() {
        let envelope = SessionEnvelope {
            version: ENVELOPE_VERSION,
            sender_wallet: WalletAddress([1u8; 32]),
            header: sample_header(),
            ciphertext: vec![1, 2, 3, 4, 5],
            handshake: None,
        };
        let bytes = envelope.to_bytes();
        assert_eq!(SessionEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn round_trips_with_handshake_and_otk() {
        let envelope = SessionEnvelope {
            version: ENVELOPE_VERSION,
            sender_wallet: WalletAddress([2u8; 32]),
            header: sample_header(),
            ciphertext: vec![],
            handshake: Some(InitialHandshake {
                ephemeral_public: [3u8; 32],
                sender_identity_agreement_public: [4u8; 32],
                signed_prekey_generation: 5,
                one_time_prekey_id: Some(9),
            }),
        };
        let bytes = envelope.to_bytes();
        assert_eq!(SessionEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let bytes = vec![ENVELOPE_VERSION, 1, 2, 3];
        assert_eq!(
            SessionEnvelope::from_bytes(&bytes).unwrap_err(),
            EnvelopeError::Malformed
        );
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let bytes = vec![99u8; 100];
        assert_eq!(
            SessionEnvelope::from_bytes(&bytes).unwrap_err(),
            EnvelopeError::UnsupportedVersion
        );
    }
}
