//! Error taxonomy for the authority engine.
//!
//! Every fallible operation in the library returns [`AuthorityError`]. The
//! variants follow the failure classes of the engine: configuration, key
//! access, parsing, cryptography and storage. Authority-level failures are
//! fatal to a run (see [`AuthorityError::is_fatal`]); the rest only abort the
//! item being processed.

use std::fmt::Display;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthorityError>;

#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Authority configuration unreadable, corrupt or not persistable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wrong passphrase or corrupted key material.
    #[error("private key access failed: {0}")]
    KeyAccess(String),

    /// Malformed request, certificate or CRL.
    #[error("parse error: {0}")]
    Parse(String),

    /// Key generation, encryption or signing failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Storage read/write failure.
    #[error("storage error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Passphrase does not satisfy the length policy.
    #[error("passphrase rejected: {0}")]
    Passphrase(String),

    /// No usable authority certificate.
    #[error("authority certificate unavailable: {0}")]
    MissingCertificate(String),
}

impl AuthorityError {
    pub fn config(context: &str, err: impl Display) -> Self {
        Self::Config(format!("{}: {}", context, err))
    }

    pub fn key_access(context: &str, err: impl Display) -> Self {
        Self::KeyAccess(format!("{}: {}", context, err))
    }

    pub fn parse(context: &str, err: impl Display) -> Self {
        Self::Parse(format!("{}: {}", context, err))
    }

    pub fn crypto(context: &str, err: impl Display) -> Self {
        Self::Crypto(format!("{}: {}", context, err))
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the whole run rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::KeyAccess(_) | Self::MissingCertificate(_) | Self::Passphrase(_)
        )
    }
}
