//! Passphrase handling using the secrecy crate
//!
//! The passphrase protecting the authority key is kept in a [`SecretBox`] so it
//! never shows up in debug output and is zeroized when dropped. It is only
//! exposed to the key custodian.

use crate::error::{AuthorityError, Result};
use secrecy::{ExposeSecret, SecretBox};
use std::fmt;

/// Minimum accepted passphrase length in bytes.
pub const MIN_PASSPHRASE_LEN: usize = 12;

/// Default environment variable read by [`EnvPassphrase`].
pub const PASSPHRASE_ENV: &str = "TINY_PASSPHRASE";

/// A passphrase that satisfied the length policy.
pub struct Passphrase {
    secret: SecretBox<Vec<u8>>,
}

impl Passphrase {
    /// Wrap raw passphrase bytes, enforcing [`MIN_PASSPHRASE_LEN`].
    ///
    /// The policy applies regardless of log verbosity.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        let secret = SecretBox::new(Box::new(bytes));
        if secret.expose_secret().len() < MIN_PASSPHRASE_LEN {
            return Err(AuthorityError::Passphrase(format!(
                "must be at least {} bytes",
                MIN_PASSPHRASE_LEN
            )));
        }
        Ok(Self { secret })
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.secret.expose_secret()
    }
}

impl TryFrom<String> for Passphrase {
    type Error = AuthorityError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passphrase")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Source of the authority passphrase.
pub trait PassphraseProvider {
    fn passphrase(&self) -> Result<Passphrase>;
}

/// Reads the passphrase from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvPassphrase {
    var: String,
}

impl EnvPassphrase {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    /// Whether the variable is currently set.
    pub fn is_available(&self) -> bool {
        std::env::var_os(&self.var).is_some()
    }
}

impl Default for EnvPassphrase {
    fn default() -> Self {
        Self::new(PASSPHRASE_ENV)
    }
}

impl PassphraseProvider for EnvPassphrase {
    fn passphrase(&self) -> Result<Passphrase> {
        let value = std::env::var(&self.var).map_err(|e| {
            AuthorityError::Passphrase(format!("Failed to read {}: {}", self.var, e))
        })?;
        Passphrase::try_from(value)
    }
}

/// Fixed passphrase, for embedding and tests.
pub struct StaticPassphrase {
    bytes: SecretBox<Vec<u8>>,
}

impl StaticPassphrase {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: SecretBox::new(Box::new(bytes.into())),
        }
    }
}

impl PassphraseProvider for StaticPassphrase {
    fn passphrase(&self) -> Result<Passphrase> {
        Passphrase::new(self.bytes.expose_secret().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_passphrase() {
        let err = Passphrase::new(b"short".to_vec()).unwrap_err();
        assert!(matches!(err, AuthorityError::Passphrase(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_accepts_minimum_length() {
        let pass = Passphrase::new(vec![b'a'; MIN_PASSPHRASE_LEN]).unwrap();
        assert_eq!(pass.expose().len(), MIN_PASSPHRASE_LEN);
    }

    #[test]
    fn test_debug_no_leak() {
        let pass = Passphrase::try_from("correct horse battery".to_string()).unwrap();
        let debug_str = format!("{:?}", pass);
        assert!(!debug_str.contains("horse"));
        assert!(debug_str.contains("redacted"));
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticPassphrase::new("a long enough secret");
        assert_eq!(
            provider.passphrase().unwrap().expose(),
            b"a long enough secret"
        );
        assert!(StaticPassphrase::new("tiny").passphrase().is_err());
    }

    #[test]
    fn test_env_provider_missing_variable() {
        let provider = EnvPassphrase::new("TINYCA_TEST_UNSET_PASSPHRASE_VAR");
        assert!(!provider.is_available());
        assert!(matches!(
            provider.passphrase(),
            Err(AuthorityError::Passphrase(_))
        ));
    }
}
