//! Burrow tunnel protocol.
//!
//! This crate handles everything between the TCP socket and the dispatcher:
//! * Record framing (`len:u32_be ‖ payload`, 10 MiB cap)
//! * The three-phase handshake (key agreement → session key → credentials)
//! * Classification of in-session plaintext into [`Command`]s
//! * Wire JSON schemas for replies and statistics
//! * Per-session flow/congestion accounting ([`FlowController`])
//!
//! It is intentionally IO-light: the handshake is sans-IO (state-in/state-out
//! step functions), and only the framing layer touches tokio streams.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod flow;
pub mod framing;
pub mod handshake;
pub mod wire;

pub use command::{Command, CommandError};
pub use flow::FlowController;
pub use framing::{FrameError, FrameReader, FrameWriter, FramedStream, MAX_RECORD_LEN};
pub use handshake::{AuthGrant, AuthOutcome, CredentialOracle, HandshakeError};
