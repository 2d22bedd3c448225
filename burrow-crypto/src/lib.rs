//! Cryptographic primitives for the burrow tunnel.
//!
//! Provides:
//! - AES-256-CBC record encryption with PKCS#7 padding and a fresh per-record IV
//! - `SessionKey` — 32-byte symmetric session key, zeroised on drop
//! - RSA-2048-OAEP (MGF1-SHA256) session-key wrap/unwrap
//! - PEM (SubjectPublicKeyInfo) serialisation of the server identity key
//!
//! CBC gives confidentiality but not integrity; records carry no MAC. The
//! only domain separation between records is the fresh IV.

#![deny(unsafe_code)]

mod cipher;
mod keys;

pub use cipher::{CipherError, decrypt, encrypt, BLOCK_SIZE, IV_SIZE, KEY_SIZE};
pub use keys::{KeyExchangeError, ServerIdentity, SessionKey, wrap_key};
