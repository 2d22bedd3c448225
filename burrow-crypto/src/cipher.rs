//! AES-256-CBC record encryption.
//!
//! A record payload is `iv(16) ‖ ciphertext`, where the ciphertext is the
//! PKCS#7-padded plaintext (padding always appends 1–16 bytes, a full block
//! when the plaintext is already aligned).

use std::fmt;

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::keys::SessionKey;

/// Symmetric key size in bytes (AES-256).
pub const KEY_SIZE: usize = 32;
/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// IV size in bytes (one block, prepended to every record payload).
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors from [`decrypt`].
#[derive(Clone, Debug, PartialEq)]
pub enum CipherError {
    /// The record payload is shorter than one IV.
    TooShort {
        /// Observed payload length.
        len: usize,
    },
    /// The ciphertext length is zero or not a multiple of the block size.
    Misaligned {
        /// Observed ciphertext length.
        len: usize,
    },
    /// PKCS#7 padding did not verify.
    BadPadding,
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len }   => write!(f, "record payload too short: {len} bytes"),
            Self::Misaligned { len } => write!(f, "ciphertext length {len} is not a positive multiple of 16"),
            Self::BadPadding         => write!(f, "malformed PKCS#7 padding"),
        }
    }
}
impl std::error::Error for CipherError {}

// ─── encrypt / decrypt ────────────────────────────────────────────────────────

/// Encrypt `plaintext` under `key`, returning `iv ‖ ciphertext`.
///
/// The IV is drawn fresh from the system CSPRNG for every call, so two
/// encryptions of identical inputs never produce identical outputs.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    getrandom::getrandom(&mut iv).expect("getrandom failed");

    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a record payload (`iv ‖ ciphertext`) under `key`.
///
/// Verifies and strips the PKCS#7 padding.
pub fn decrypt(record: &[u8], key: &SessionKey) -> Result<Vec<u8>, CipherError> {
    if record.len() < IV_SIZE {
        return Err(CipherError::TooShort { len: record.len() });
    }
    let (iv, ciphertext) = record.split_at(IV_SIZE);
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::Misaligned { len: ciphertext.len() });
    }

    Aes256CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::BadPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([7u8; KEY_SIZE])
    }

    #[test]
    fn roundtrip() {
        let plain = b"GET / HTTP/1.1\r\n\r\n";
        let record = encrypt(plain, &key());
        assert_eq!(decrypt(&record, &key()).unwrap(), plain);
    }

    #[test]
    fn fresh_iv_per_record() {
        let record_a = encrypt(b"same input", &key());
        let record_b = encrypt(b"same input", &key());
        assert_ne!(record_a, record_b);
        // Ciphertext differs too, not just the IV
        assert_ne!(record_a[IV_SIZE..], record_b[IV_SIZE..]);
    }

    #[test]
    fn aligned_plaintext_gains_a_full_pad_block() {
        let plain = [0u8; 32];
        let record = encrypt(&plain, &key());
        assert_eq!(record.len(), IV_SIZE + 32 + BLOCK_SIZE);
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let record = encrypt(b"", &key());
        assert_eq!(record.len(), IV_SIZE + BLOCK_SIZE);
        assert_eq!(decrypt(&record, &key()).unwrap(), b"");
    }

    #[test]
    fn rejects_short_record() {
        assert_eq!(
            decrypt(&[0u8; 15], &key()),
            Err(CipherError::TooShort { len: 15 })
        );
    }

    #[test]
    fn rejects_bare_iv() {
        assert_eq!(
            decrypt(&[0u8; 16], &key()),
            Err(CipherError::Misaligned { len: 0 })
        );
    }

    #[test]
    fn rejects_misaligned_ciphertext() {
        assert_eq!(
            decrypt(&[0u8; 37], &key()),
            Err(CipherError::Misaligned { len: 21 })
        );
    }

    #[test]
    fn rejects_malformed_padding() {
        use aes::cipher::block_padding::NoPadding;
        // A block whose final byte is 0x00 can never carry valid PKCS#7
        // padding (pad length must be 1..=16).
        let iv = [3u8; IV_SIZE];
        let block = [0u8; BLOCK_SIZE];
        let ciphertext = Aes256CbcEnc::new(key().as_bytes().into(), &iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&block);
        let mut record = iv.to_vec();
        record.extend_from_slice(&ciphertext);
        assert_eq!(decrypt(&record, &key()), Err(CipherError::BadPadding));
    }
}
