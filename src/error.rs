//! Error handling
use std::result;
use std::time::Duration;
use thiserror::Error;

use crate::{nip04, nip44};

/// Simple `Result` type for errors in this crate
pub type Result<T, E = Error> = result::Result<T, E>;

/// Errors surfaced by the access-control core.
///
/// Callers are expected to tell apart "no access" ([`Error::Decryption`]),
/// "the form is corrupted" ([`Error::MalformedEvent`]) and "the network is
/// unreachable" ([`Error::TransportTimeout`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Ciphertext could not be opened with the supplied key.
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// An operation needing a form identifier was called without one.
    #[error("missing or empty form identifier")]
    InvalidFormId,
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("event has an invalid signature")]
    InvalidSignature,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The grant does not carry the key this operation needs.
    #[error("capability not held: {0}")]
    MissingCapability(&'static str),
    /// No relay answered within the bounded wait.
    #[error("no relay responded within {0:?}")]
    TransportTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<nip44::Error> for Error {
    fn from(e: nip44::Error) -> Self {
        match e {
            nip44::Error::DecryptionFailed => Error::Decryption,
            nip44::Error::InvalidKey => Error::InvalidKey("nip44 conversation key".to_owned()),
            other => Error::Encryption(other.to_string()),
        }
    }
}

impl From<nip04::Error> for Error {
    fn from(e: nip04::Error) -> Self {
        match e {
            nip04::Error::DecryptionFailed => Error::Decryption,
            other => Error::Encryption(other.to_string()),
        }
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::InvalidKey(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidKey(e.to_string())
    }
}
