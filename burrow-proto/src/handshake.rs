//! Sans-IO tunnel handshake.
//!
//! Four strictly ordered frames; any deviation is fatal for the connection.
//!
//! # Flow
//!
//! ```text
//! server                                   client
//!   offer(&identity) ── pem record ──────────▶
//!   ◀─────────── wrapped session key ── start(&pem, &credentials)
//!   ◀─────────── encrypted credentials ─ (same call)
//!   verify_credentials(…) ── auth response ──▶ finish(&key, &record)
//! ```
//!
//! The functions here never touch a socket: callers frame and ship the
//! records. The client drives `start`/`finish`, the server drives
//! `offer`/`accept_session_key`/`verify_credentials`.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use burrow_crypto::{
    CipherError, KeyExchangeError, ServerIdentity, SessionKey, decrypt, encrypt, wrap_key,
};

use crate::wire::{AuthRequest, AuthResponse, ServerInfo, STATUS_ERROR, STATUS_SUCCESS};

/// Version string the client reports in its credentials record.
pub const CLIENT_VERSION: &str = "2.0";

/// Auth response message on success.
pub const GRANTED_MESSAGE: &str = "VPN tunnel established - Full forwarding enabled";
/// Auth response message on any rejection. One message for every failure
/// mode, so the response never becomes a username-enumeration oracle.
pub const REJECTED_MESSAGE: &str = "Authentication failed: Invalid credentials";

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that can occur while driving the handshake.
#[derive(Debug)]
pub enum HandshakeError {
    /// RSA wrap/unwrap or PEM failure.
    KeyExchange(KeyExchangeError),
    /// A record failed to decrypt.
    Cipher(CipherError),
    /// A peer record was not the UTF-8 JSON the protocol calls for.
    Malformed(String),
    /// The server rejected the credentials.
    Rejected {
        /// The server's `message` field, surfaced to the user.
        message: String,
    },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyExchange(e)       => write!(f, "key exchange: {e}"),
            Self::Cipher(e)            => write!(f, "record decrypt: {e}"),
            Self::Malformed(what)      => write!(f, "malformed handshake record: {what}"),
            Self::Rejected { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<KeyExchangeError> for HandshakeError {
    fn from(e: KeyExchangeError) -> Self { Self::KeyExchange(e) }
}
impl From<CipherError> for HandshakeError {
    fn from(e: CipherError) -> Self { Self::Cipher(e) }
}

// ─── Credentials ─────────────────────────────────────────────────────────────

/// What the client authenticates with.
#[derive(Clone, Debug)]
pub struct Credentials {
    /// Principal name.
    pub username: String,
    /// Shared secret.
    pub password: String,
}

impl Credentials {
    /// Bundle a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

/// The credential oracle consulted at handshake step 4.
///
/// Implementations must be safe for concurrent reads; the server shares one
/// oracle across all sessions.
pub trait CredentialOracle: Send + Sync {
    /// Whether `(username, password)` is a valid pair.
    fn check(&self, username: &str, password: &str) -> bool;
}

impl CredentialOracle for HashMap<String, String> {
    fn check(&self, username: &str, password: &str) -> bool {
        self.get(username).is_some_and(|secret| secret == password)
    }
}

// ─── Client side ─────────────────────────────────────────────────────────────

/// The two records the client sends after receiving the server's public key.
pub struct ClientHello {
    /// Frame 2: the RSA-OAEP-wrapped session key.
    pub wrapped_key: Vec<u8>,
    /// Frame 3: credentials JSON encrypted under the session key.
    pub auth_record: Vec<u8>,
}

/// A successful handshake, as seen by the client.
#[derive(Clone, Debug)]
pub struct AuthGrant {
    /// The server's `message` field.
    pub message: String,
    /// Advertised server capabilities.
    pub server_info: ServerInfo,
}

/// Process the server's PEM record: generate a fresh session key, wrap it,
/// and encrypt the credentials. Returns the records to send and the key that
/// will protect the session.
pub fn start(
    public_key_pem: &[u8],
    credentials: &Credentials,
) -> Result<(ClientHello, SessionKey), HandshakeError> {
    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|_| HandshakeError::Malformed("public key record is not UTF-8 PEM".into()))?;

    let key = SessionKey::generate();
    let wrapped_key = wrap_key(&key, pem)?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs_f64();
    let request = AuthRequest {
        username: credentials.username.clone(),
        password: credentials.password.clone(),
        timestamp,
        client_version: CLIENT_VERSION.into(),
    };
    let auth_json = serde_json::to_string(&request).expect("auth request serialises");
    let auth_record = encrypt(auth_json.as_bytes(), &key);

    Ok((ClientHello { wrapped_key, auth_record }, key))
}

/// Process the server's auth response record (frame 4).
pub fn finish(key: &SessionKey, record: &[u8]) -> Result<AuthGrant, HandshakeError> {
    let plaintext = decrypt(record, key)?;
    let response: AuthResponse = serde_json::from_slice(&plaintext)
        .map_err(|e| HandshakeError::Malformed(format!("auth response: {e}")))?;

    if response.status == STATUS_SUCCESS {
        Ok(AuthGrant {
            message: response.message,
            server_info: response.server_info.unwrap_or_default(),
        })
    } else {
        Err(HandshakeError::Rejected { message: response.message })
    }
}

// ─── Server side ─────────────────────────────────────────────────────────────

/// Frame 1: the server's PEM-serialised public key.
pub fn offer(identity: &ServerIdentity) -> Result<Vec<u8>, HandshakeError> {
    Ok(identity.public_key_pem()?.into_bytes())
}

/// Process frame 2: unwrap the client's session key.
pub fn accept_session_key(
    identity: &ServerIdentity,
    record: &[u8],
) -> Result<SessionKey, HandshakeError> {
    Ok(identity.unwrap_key(record)?)
}

/// How the server answers frame 3.
pub enum AuthOutcome {
    /// Credentials verified; send the response and bind the session.
    Granted {
        /// The authenticated principal.
        username: String,
        /// Frame 4, ready to send.
        response_record: Vec<u8>,
    },
    /// Verification failed; send the response and close the connection.
    Rejected {
        /// Frame 4, ready to send.
        response_record: Vec<u8>,
    },
}

/// Process frame 3: decrypt the credentials record and consult the oracle.
///
/// Every failure mode — decrypt failure, non-UTF-8, non-JSON, wrong
/// credentials — produces the same rejected response.
pub fn verify_credentials(
    key: &SessionKey,
    record: &[u8],
    oracle: &dyn CredentialOracle,
    server_info: ServerInfo,
) -> AuthOutcome {
    let request = decrypt(record, key)
        .ok()
        .and_then(|plain| serde_json::from_slice::<AuthRequest>(&plain).ok());

    match request {
        Some(request) if oracle.check(&request.username, &request.password) => {
            let response = AuthResponse {
                status: STATUS_SUCCESS.into(),
                message: GRANTED_MESSAGE.into(),
                server_info: Some(server_info),
            };
            AuthOutcome::Granted {
                username: request.username,
                response_record: encrypt(
                    serde_json::to_string(&response).expect("auth response serialises").as_bytes(),
                    key,
                ),
            }
        }
        _ => {
            let response = AuthResponse {
                status: STATUS_ERROR.into(),
                message: REJECTED_MESSAGE.into(),
                server_info: None,
            };
            AuthOutcome::Rejected {
                response_record: encrypt(
                    serde_json::to_string(&response).expect("auth response serialises").as_bytes(),
                    key,
                ),
            }
        }
    }
}
