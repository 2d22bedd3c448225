//! Session and identity keys.

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::cipher::KEY_SIZE;

/// RSA modulus size in bits for the server identity key.
const RSA_BITS: usize = 2048;

// ─── SessionKey ──────────────────────────────────────────────────────────────

/// A 32-byte symmetric session key.
///
/// One key per session, generated by the client from the system CSPRNG and
/// transported under RSA-OAEP wrap. The bytes are zeroised when the key is
/// dropped, and the `Debug` impl never prints them.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh key from the system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from the RSA key-exchange operations.
#[derive(Debug)]
pub enum KeyExchangeError {
    /// PEM (SubjectPublicKeyInfo) encode/decode failure.
    Pem(rsa::pkcs8::spki::Error),
    /// RSA keygen / OAEP failure.
    Rsa(rsa::Error),
    /// The unwrapped secret was not exactly [`KEY_SIZE`] bytes.
    BadKeyLength {
        /// Observed secret length.
        len: usize,
    },
}

impl fmt::Display for KeyExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pem(e)              => write!(f, "public key PEM: {e}"),
            Self::Rsa(e)              => write!(f, "rsa: {e}"),
            Self::BadKeyLength { len } => write!(f, "unwrapped session key is {len} bytes, expected {KEY_SIZE}"),
        }
    }
}
impl std::error::Error for KeyExchangeError {}

impl From<rsa::pkcs8::spki::Error> for KeyExchangeError {
    fn from(e: rsa::pkcs8::spki::Error) -> Self { Self::Pem(e) }
}
impl From<rsa::Error> for KeyExchangeError {
    fn from(e: rsa::Error) -> Self { Self::Rsa(e) }
}

// ─── ServerIdentity ──────────────────────────────────────────────────────────

/// The server's RSA-2048 identity keypair.
///
/// The private half lives for the process lifetime only; the public half is
/// serialised to PEM and offered to every connecting peer as the first frame
/// on the wire. Regeneration on restart is acceptable — no long-term pinning
/// is promised.
pub struct ServerIdentity {
    private: RsaPrivateKey,
    public:  RsaPublicKey,
}

impl ServerIdentity {
    /// Generate a fresh RSA-2048 keypair.
    pub fn generate() -> Result<Self, KeyExchangeError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// PEM (SubjectPublicKeyInfo) encoding of the public key.
    pub fn public_key_pem(&self) -> Result<String, KeyExchangeError> {
        Ok(self.public.to_public_key_pem(LineEnding::LF)?)
    }

    /// Unwrap an RSA-OAEP-wrapped session key received from a client.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<SessionKey, KeyExchangeError> {
        let secret = self.private.decrypt(Oaep::new::<Sha256>(), wrapped)?;
        let bytes: [u8; KEY_SIZE] = secret
            .as_slice()
            .try_into()
            .map_err(|_| KeyExchangeError::BadKeyLength { len: secret.len() })?;
        Ok(SessionKey::from_bytes(bytes))
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerIdentity(rsa-{RSA_BITS})")
    }
}

/// Wrap a session key under a peer's PEM-encoded RSA public key
/// (OAEP, MGF1-SHA256, no label).
pub fn wrap_key(key: &SessionKey, public_key_pem: &str) -> Result<Vec<u8>, KeyExchangeError> {
    let public = RsaPublicKey::from_public_key_pem(public_key_pem)?;
    Ok(public.encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())?)
}
