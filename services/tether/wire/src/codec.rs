//! AES-GCM envelope codec for the encrypted channel.
//!
//! After the nonce exchange every WebSocket message carries one envelope:
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 cipher_len       | big-endian                 |
//! +----------------------+----------------------------+
//! | ciphertext + tag     | cipher_len bytes           |
//! +----------------------+----------------------------+
//! ```
//!
//! Each direction keeps its own 96-bit nonce counter which is incremented
//! after every seal/open. A counter value must never be used twice under the
//! same key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::WireError;

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-128 key size in bytes
pub const KEY_SIZE: usize = 16;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Size of the ciphertext length prefix
pub const ENVELOPE_PREFIX_SIZE: usize = 2;

/// Largest ciphertext an envelope can describe
pub const MAX_CIPHERTEXT: usize = u16::MAX as usize;

/// Width of the time bucket mixed into the channel key
pub const KEY_TIME_BUCKET: Duration = Duration::from_secs(100);

/// Per-direction nonce counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCounter([u8; NONCE_SIZE]);

impl NonceCounter {
    /// Start counting from the given value
    pub fn new(initial: [u8; NONCE_SIZE]) -> Self {
        Self(initial)
    }

    /// Start counting from a fresh random value
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Current counter value
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Big-endian increment with carry, wrapping at the array boundary
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

/// Index of the key rotation bucket containing `now`
pub fn time_bucket(now: SystemTime) -> u64 {
    let millis = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    (millis / KEY_TIME_BUCKET.as_millis()) as u64
}

/// Derive the channel key: HMAC-SHA512(secret, decimal bucket) truncated to 16 bytes
pub fn derive_key(secret: &[u8], bucket: u64) -> Result<[u8; KEY_SIZE], WireError> {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(secret).map_err(|_| WireError::Key)?;
    mac.update(bucket.to_string().as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    Ok(key)
}

/// AEAD state shared by the sealing and opening sides of one connection
#[derive(Clone)]
pub struct EnvelopeCipher {
    aead: Aes128Gcm,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher").finish_non_exhaustive()
    }
}

impl EnvelopeCipher {
    /// Create a cipher from derived key material
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            aead: Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key)),
        }
    }

    /// Encrypt `plaintext` into a length-prefixed envelope, consuming one nonce
    pub fn seal(&self, nonce: &mut NonceCounter, plaintext: &[u8]) -> Result<Bytes, WireError> {
        if plaintext.len() + TAG_SIZE > MAX_CIPHERTEXT {
            return Err(WireError::FieldTooLarge {
                field: "envelope plaintext",
                value: plaintext.len(),
                max: MAX_CIPHERTEXT - TAG_SIZE,
            });
        }

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| WireError::Crypto)?;
        nonce.increment();

        let mut buf = BytesMut::with_capacity(ENVELOPE_PREFIX_SIZE + ciphertext.len());
        buf.put_u16(ciphertext.len() as u16);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    /// Decrypt one envelope body (without its length prefix), consuming one nonce
    pub fn open(&self, nonce: &mut NonceCounter, ciphertext: &[u8]) -> Result<Bytes, WireError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(WireError::Envelope("ciphertext shorter than tag"));
        }

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| WireError::Crypto)?;
        nonce.increment();

        Ok(Bytes::from(plaintext))
    }
}

/// Parse the envelope length prefix
pub fn envelope_len(prefix: [u8; ENVELOPE_PREFIX_SIZE]) -> Result<usize, WireError> {
    let len = u16::from_be_bytes(prefix) as usize;
    if len < TAG_SIZE {
        return Err(WireError::Envelope("length prefix shorter than tag"));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_increment_carry() {
        let mut nonce = NonceCounter::new([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff]);
        nonce.increment();
        assert_eq!(nonce.as_bytes(), &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x02, 0x00]);

        let mut full = NonceCounter::new([0xff; NONCE_SIZE]);
        full.increment();
        assert_eq!(full.as_bytes(), &[0u8; NONCE_SIZE]);
    }

    #[test]
    fn test_seal_advances_nonce_once_per_envelope() {
        let cipher = EnvelopeCipher::new(&[9u8; KEY_SIZE]);
        let start = NonceCounter::new([0u8; NONCE_SIZE]);
        let mut nonce = start;
        let mut seen = std::collections::HashSet::new();

        for _ in 0..300 {
            assert!(seen.insert(*nonce.as_bytes()));
            cipher.seal(&mut nonce, b"frame").unwrap();
        }

        let mut expected = start;
        for _ in 0..300 {
            expected.increment();
        }
        assert_eq!(nonce, expected);
        assert_eq!(nonce.as_bytes()[NONCE_SIZE - 2..], [0x01, 0x2c]);
    }

    #[test]
    fn test_seal_open() {
        let cipher = EnvelopeCipher::new(&derive_key(b"secret", 17_000_000).unwrap());
        let mut send = NonceCounter::new([3u8; NONCE_SIZE]);
        let mut recv = send;

        let envelope = cipher.seal(&mut send, b"hello").unwrap();
        let len = envelope_len([envelope[0], envelope[1]]).unwrap();
        assert_eq!(len, 5 + TAG_SIZE);
        assert_eq!(envelope.len(), ENVELOPE_PREFIX_SIZE + len);

        let opened = cipher.open(&mut recv, &envelope[ENVELOPE_PREFIX_SIZE..]).unwrap();
        assert_eq!(opened.as_ref(), b"hello");
        assert_eq!(send, recv);
    }

    #[test]
    fn test_open_rejects_wrong_nonce_and_tampering() {
        let cipher = EnvelopeCipher::new(&[1u8; KEY_SIZE]);
        let mut send = NonceCounter::new([0u8; NONCE_SIZE]);
        let envelope = cipher.seal(&mut send, b"payload").unwrap();

        let mut stale = NonceCounter::new([0u8; NONCE_SIZE]);
        stale.increment();
        assert_eq!(
            cipher.open(&mut stale, &envelope[ENVELOPE_PREFIX_SIZE..]),
            Err(WireError::Crypto)
        );

        let mut tampered = envelope.to_vec();
        tampered[ENVELOPE_PREFIX_SIZE] ^= 0x01;
        let mut recv = NonceCounter::new([0u8; NONCE_SIZE]);
        assert_eq!(
            cipher.open(&mut recv, &tampered[ENVELOPE_PREFIX_SIZE..]),
            Err(WireError::Crypto)
        );
        assert_eq!(recv, NonceCounter::new([0u8; NONCE_SIZE]));
    }

    #[test]
    fn test_derive_key() {
        let a = derive_key(b"secret", 16_000_000).unwrap();
        let b = derive_key(b"secret", 16_000_000).unwrap();
        let c = derive_key(b"secret", 16_000_001).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_derive_key_known_value() {
        let key = derive_key(b"hunter2", 17_000_000).unwrap();
        assert_eq!(
            key,
            [220, 133, 103, 241, 156, 124, 201, 120, 109, 3, 89, 13, 171, 174, 88, 210]
        );
    }

    #[test]
    fn test_time_bucket() {
        let now = UNIX_EPOCH + Duration::from_millis(1_600_000_099_999);
        assert_eq!(time_bucket(now), 16_000_000);
        assert_eq!(time_bucket(now + Duration::from_millis(1)), 16_000_001);
    }

    #[test]
    fn test_envelope_len_rejects_short_prefix() {
        assert!(envelope_len([0x00, 0x0f]).is_err());
        assert_eq!(envelope_len([0x01, 0x00]).unwrap(), 256);
    }
}
