//! *ring*-backed packet protection
//!
//! Initial keys are derived from the client's first DCID per the draft-24 HKDF schedule
//! (AES-128-GCM payload protection, AES-based header protection).

use ::ring::{aead, hkdf, hmac};
use bytes::BytesMut;
use thiserror::Error;

use super::{KeyPair, Keys};
use crate::packet::LONG_HEADER_FORM;
use crate::shared::{ConnectionId, ResetToken};
use crate::{Side, RESET_TOKEN_SIZE};

const INITIAL_SALT: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63,
    0x65, 0xbe, 0xf9, 0xf5, 0x02,
];

/// Protection could not be applied or removed
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("cryptographic operation failed")]
pub struct CryptoError;

impl From<::ring::error::Unspecified> for CryptoError {
    fn from(_: ::ring::error::Unspecified) -> Self {
        Self
    }
}

/// Derive initial-level keys for both directions from the first Initial packet's DCID
pub fn initial_keys(dst_cid: &ConnectionId, side: Side) -> Keys {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
    let initial_secret = salt.extract(dst_cid);

    let client_secret = expand_secret(&initial_secret, b"client in");
    let server_secret = expand_secret(&initial_secret, b"server in");
    let (local, remote) = match side {
        Side::Client => (&client_secret, &server_secret),
        Side::Server => (&server_secret, &client_secret),
    };

    Keys {
        header: KeyPair {
            local: HeaderKey::from_secret(local),
            remote: HeaderKey::from_secret(remote),
        },
        packet: KeyPair {
            local: PacketKey::from_secret(local),
            remote: PacketKey::from_secret(remote),
        },
    }
}

/// Derive the stateless reset token bound to a connection ID
///
/// Deterministic in `(server_id, cid)` so a restarted server can reproduce it statelessly.
pub fn reset_token_for(server_id: &[u8], cid: &ConnectionId) -> ResetToken {
    let key = hmac::Key::new(hmac::HMAC_SHA256, server_id);
    let tag = hmac::sign(&key, cid);
    let mut token = [0; RESET_TOKEN_SIZE];
    token.copy_from_slice(&tag.as_ref()[..RESET_TOKEN_SIZE]);
    token.into()
}

/// Keys protecting packet payloads at one level, in one direction
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: [u8; 12],
}

impl PacketKey {
    pub(crate) fn from_secret(secret: &hkdf::Prk) -> Self {
        let mut key = [0; 16];
        expand_label(secret, b"quic key", &mut key);
        let mut iv = [0; 12];
        expand_label(secret, b"quic iv", &mut iv);
        Self {
            key: aead::LessSafeKey::new(
                aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap(),
            ),
            iv,
        }
    }

    fn nonce(&self, packet: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, pn) in nonce[4..].iter_mut().zip(packet.to_be_bytes()) {
            *b ^= pn;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Seal the payload in place, appending the authentication tag
    pub fn encrypt(&self, packet: u64, buf: &mut Vec<u8>, header_len: usize) {
        let nonce = self.nonce(packet);
        let (header, payload) = buf.split_at_mut(header_len);
        let aad = aead::Aad::from(&*header);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, aad, payload)
            .unwrap();
        buf.extend_from_slice(tag.as_ref());
    }

    /// Open the payload in place, stripping the authentication tag
    pub fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        if payload.len() < self.tag_len() {
            return Err(CryptoError);
        }
        let nonce = self.nonce(packet);
        let aad = aead::Aad::from(header);
        let plain_len = self.key.open_in_place(nonce, aad, payload.as_mut())?.len();
        payload.truncate(plain_len);
        Ok(())
    }

    /// The length of the AEAD tag appended on encryption
    pub fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

/// Keys protecting packet headers at one level, in one direction
pub struct HeaderKey(aead::quic::HeaderProtectionKey);

impl HeaderKey {
    pub(crate) fn from_secret(secret: &hkdf::Prk) -> Self {
        let mut hp = [0; 16];
        expand_label(secret, b"quic hp", &mut hp);
        Self(aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &hp).unwrap())
    }

    /// Remove header protection, exposing the first byte's low bits and the packet number
    pub fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self.0.new_mask(&sample[0..self.sample_size()]).unwrap();
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            // Long header: 4 bits masked
            header[0] ^= mask[0] & 0x0f;
        } else {
            // Short header: 5 bits masked
            header[0] ^= mask[0] & 0x1f;
        }
        let pn_length = 1 + (header[0] & 0x03) as usize;
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    /// Apply header protection over the packet-number field and first-byte low bits
    pub fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (header, sample) = packet.split_at_mut(pn_offset + 4);
        let mask = self.0.new_mask(&sample[0..self.sample_size()]).unwrap();
        let pn_length = 1 + (header[0] & 0x03) as usize;
        if header[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            header[0] ^= mask[0] & 0x0f;
        } else {
            header[0] ^= mask[0] & 0x1f;
        }
        for (out, inp) in header[pn_offset..pn_offset + pn_length]
            .iter_mut()
            .zip(&mask[1..])
        {
            *out ^= inp;
        }
    }

    /// Number of payload bytes sampled to derive the protection mask
    pub fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }
}

fn expand_secret(prk: &hkdf::Prk, label: &[u8]) -> hkdf::Prk {
    let mut secret = [0; 32];
    expand_label(prk, label, &mut secret);
    hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secret)
}

fn expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const BASE_LABEL: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(2 + 1 + BASE_LABEL.len() + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((BASE_LABEL.len() + label.len()) as u8);
    info.extend_from_slice(BASE_LABEL);
    info.extend_from_slice(label);
    info.push(0);
    prk.expand(&[&info], OkmLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}
