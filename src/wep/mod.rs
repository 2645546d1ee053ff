//! WEP protection of shared-key authentication frame bodies
//!
//! Encrypted body layout:
//!   IV(3) | KeyId(1, id in bits 6-7) | RC4(seed = IV|key)[ body | ICV(4) ]
//!
//! The ICV is the CRC-32 of the plaintext body. Decryption recomputes it and
//! rejects the frame on any mismatch.

pub mod crc;
pub mod rc4;

use bytes::{BufMut, BytesMut};
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::{LimError, Result};
use crate::keys::EdType;

/// IV(3) plus the key id octet
pub const WEP_IV_LEN: usize = 4;
pub const WEP_ICV_LEN: usize = 4;
/// Challenge text length used in shared-key authentication
pub const CHALLENGE_TEXT_LEN: usize = 128;
/// IV(3) + WEP-104 key
const MAX_SEED_LEN: usize = 16;

/// A WEP-40 or WEP-104 key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WepKey {
    bytes: Vec<u8>,
}

impl WepKey {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            5 | 13 => Ok(Self {
                bytes: bytes.to_vec(),
            }),
            n => Err(LimError::invalid(format!(
                "WEP key must be 5 or 13 bytes, got {}",
                n
            ))),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| LimError::invalid(format!("bad WEP key hex: {}", e)))?;
        Self::new(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn ed_type(&self) -> EdType {
        if self.bytes.len() == 5 {
            EdType::Wep40
        } else {
            EdType::Wep104
        }
    }

    /// IV followed by the key
    fn seed(&self, iv: [u8; 3]) -> ([u8; MAX_SEED_LEN], usize) {
        let mut seed = [0u8; MAX_SEED_LEN];
        seed[..3].copy_from_slice(&iv);
        seed[3..3 + self.bytes.len()].copy_from_slice(&self.bytes);
        (seed, 3 + self.bytes.len())
    }
}

/// Source of per-frame initialisation vectors
pub trait IvSource {
    fn next_iv(&mut self) -> [u8; 3];
}

/// IVs taken from the low bytes of a free-running microsecond counter,
/// the way a TSF timer is sampled on transmit.
#[derive(Debug)]
pub struct TsfIvSource {
    epoch: Instant,
}

impl TsfIvSource {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for TsfIvSource {
    fn default() -> Self {
        Self::new()
    }
}

impl IvSource for TsfIvSource {
    fn next_iv(&mut self) -> [u8; 3] {
        let tsf = self.epoch.elapsed().as_micros() as u64;
        let b = tsf.to_le_bytes();
        [b[0], b[1], b[2]]
    }
}

/// Encrypt an authentication frame body with a fresh IV
pub fn encrypt_auth_body(
    key: &WepKey,
    key_id: u8,
    body: &[u8],
    ivs: &mut dyn IvSource,
) -> Result<Vec<u8>> {
    encrypt_with_iv(key, key_id, body, ivs.next_iv())
}

/// Encrypt with a caller-chosen IV; returns `IV | KeyId | ciphertext`
pub fn encrypt_with_iv(key: &WepKey, key_id: u8, body: &[u8], iv: [u8; 3]) -> Result<Vec<u8>> {
    if key_id > 3 {
        return Err(LimError::invalid(format!("key id {} out of range 0..=3", key_id)));
    }

    let (seed, seed_len) = key.seed(iv);

    let mut plain = BytesMut::with_capacity(body.len() + WEP_ICV_LEN);
    plain.put_slice(body);
    plain.put_slice(&crc::compute_icv(body));

    let mut out = BytesMut::with_capacity(WEP_IV_LEN + plain.len());
    out.put_slice(&iv);
    out.put_u8(key_id << 6);
    out.put_slice(&rc4::rc4(&seed[..seed_len], &plain, plain.len()));

    debug!(
        "WEP encrypted {} byte auth body (key id {}, IV {})",
        body.len(),
        key_id,
        hex::encode(iv)
    );
    Ok(out.to_vec())
}

/// Decrypt `IV | KeyId | ciphertext` and verify the ICV.
///
/// Returns the plaintext body without its ICV trailer.
pub fn decrypt_auth_body(key: &WepKey, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < WEP_IV_LEN + WEP_ICV_LEN {
        return Err(LimError::invalid(format!(
            "encrypted auth body too short: {} bytes",
            frame.len()
        )));
    }

    let iv = [frame[0], frame[1], frame[2]];
    let (seed, seed_len) = key.seed(iv);
    let ciphertext = &frame[WEP_IV_LEN..];

    let plain = rc4::rc4(&seed[..seed_len], ciphertext, ciphertext.len());
    let (body, rx_icv) = plain.split_at(plain.len() - WEP_ICV_LEN);

    let icv = crc::compute_icv(body);
    if icv != rx_icv {
        warn!(
            "ICV mismatch: computed {} received {}",
            hex::encode(icv),
            hex::encode(rx_icv)
        );
        return Err(LimError::IntegrityCheckFailed);
    }

    Ok(body.to_vec())
}

/// Key id carried in bits 6-7 of the fourth IV octet
pub fn key_id_of(frame: &[u8]) -> Option<u8> {
    frame.get(3).map(|b| b >> 6)
}

/// Pseudo-random challenge text: RC4 keystream seeded from an IV and the BSSID
pub fn challenge_text(ivs: &mut dyn IvSource, salt: &[u8]) -> Vec<u8> {
    let mut seed = ivs.next_iv().to_vec();
    seed.extend_from_slice(salt);
    rc4::rc4(&seed, &[], CHALLENGE_TEXT_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct FixedIv([u8; 3]);

    impl IvSource for FixedIv {
        fn next_iv(&mut self) -> [u8; 3] {
            self.0
        }
    }

    #[test]
    fn test_key_length_validation() {
        assert!(WepKey::new(&[0; 5]).is_ok());
        assert!(WepKey::new(&[0; 13]).is_ok());
        assert!(matches!(
            WepKey::new(&[0; 8]),
            Err(LimError::InvalidParameters(_))
        ));
        assert_eq!(WepKey::from_hex("0102030405").unwrap().ed_type(), EdType::Wep40);
    }

    #[test]
    fn test_encrypted_layout() {
        let key = WepKey::from_hex("0102030405").unwrap();
        let body = b"hello";
        let frame = encrypt_auth_body(&key, 2, body, &mut FixedIv([0xaa, 0xbb, 0xcc])).unwrap();

        assert_eq!(frame.len(), WEP_IV_LEN + body.len() + WEP_ICV_LEN);
        assert_eq!(&frame[..3], &[0xaa, 0xbb, 0xcc]);
        assert_eq!(frame[3], 0x80);
        assert_eq!(key_id_of(&frame), Some(2));

        // Ciphertext is the same RC4 run over body | ICV
        let mut plain = body.to_vec();
        plain.extend_from_slice(&crc::compute_icv(body));
        let seed = [0xaa, 0xbb, 0xcc, 1, 2, 3, 4, 5];
        assert_eq!(&frame[4..], rc4::rc4(&seed, &plain, plain.len()).as_slice());
    }

    #[test]
    fn test_bad_key_id_rejected() {
        let key = WepKey::new(&[7; 13]).unwrap();
        assert!(encrypt_with_iv(&key, 4, b"x", [0; 3]).is_err());
    }

    #[test]
    fn test_wrong_key_fails_icv() {
        let key = WepKey::from_hex("0102030405").unwrap();
        let other = WepKey::from_hex("0102030406").unwrap();
        let frame = encrypt_with_iv(&key, 0, &[0x11; 32], [1, 2, 3]).unwrap();
        assert_eq!(
            decrypt_auth_body(&other, &frame),
            Err(LimError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let key = WepKey::from_hex("0102030405").unwrap();
        assert!(matches!(
            decrypt_auth_body(&key, &[1, 2, 3, 0, 9, 9, 9]),
            Err(LimError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_empty_body_round_trips() {
        let key = WepKey::from_hex("0102030405").unwrap();
        let frame = encrypt_with_iv(&key, 0, &[], [9, 9, 9]).unwrap();
        assert_eq!(decrypt_auth_body(&key, &frame).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_challenge_text_is_deterministic_per_iv() {
        let a = challenge_text(&mut FixedIv([1, 2, 3]), b"bssid!");
        let b = challenge_text(&mut FixedIv([1, 2, 3]), b"bssid!");
        let c = challenge_text(&mut FixedIv([1, 2, 4]), b"bssid!");
        assert_eq!(a.len(), CHALLENGE_TEXT_LEN);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    fn wep_key() -> impl Strategy<Value = WepKey> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 5),
            proptest::collection::vec(any::<u8>(), 13),
        ]
        .prop_map(|k| WepKey::new(&k).unwrap())
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(
            key in wep_key(),
            iv in any::<[u8; 3]>(),
            key_id in 0u8..4,
            body in proptest::collection::vec(any::<u8>(), 0..300),
        ) {
            let frame = encrypt_with_iv(&key, key_id, &body, iv).unwrap();
            prop_assert_eq!(decrypt_auth_body(&key, &frame).unwrap(), body);
        }

        #[test]
        fn any_bit_flip_fails_icv(
            key in wep_key(),
            iv in any::<[u8; 3]>(),
            body in proptest::collection::vec(any::<u8>(), 1..200),
            bit in any::<proptest::sample::Index>(),
        ) {
            let mut frame = encrypt_with_iv(&key, 0, &body, iv).unwrap();
            // Flip a bit in the ciphertext (body or ICV), never the IV octets
            let ct_bits = (frame.len() - WEP_IV_LEN) * 8;
            let n = bit.index(ct_bits);
            frame[WEP_IV_LEN + n / 8] ^= 1 << (n % 8);
            prop_assert_eq!(decrypt_auth_body(&key, &frame), Err(LimError::IntegrityCheckFailed));
        }
    }
}
