//! Authority configuration
//!
//! Identity of the authority and its two monotonic counters, persisted as
//! `config.json` in the authority folder:
//!
//! ```json
//! {
//!   "common_name": "Example Root CA",
//!   "country_iso": "DE",
//!   "organization": "Example",
//!   "organizational_unit": "PKI",
//!   "base_url": "https://pki.example.com",
//!   "last_issued_serial": 0,
//!   "last_crl_number": 0
//! }
//! ```
//!
//! Missing or `null` counters read as 0.

use crate::error::{AuthorityError, Result};
use crate::storage::{ArtifactStore, Folder};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use url::Url;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    pub common_name: String,
    #[serde(default)]
    pub country_iso: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub organizational_unit: String,
    pub base_url: String,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub last_issued_serial: u128,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub last_crl_number: u128,
}

fn null_as_zero<'de, D>(deserializer: D) -> std::result::Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u128>::deserialize(deserializer)?.unwrap_or(0))
}

impl AuthorityConfig {
    /// Fresh identity with both counters at 0.
    pub fn new(common_name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            country_iso: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            base_url: base_url.into(),
            last_issued_serial: 0,
            last_crl_number: 0,
        }
    }

    /// Decode a configuration document and check the identity fields.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: AuthorityConfig = serde_json::from_slice(data)
            .map_err(|e| AuthorityError::config("Failed to parse authority configuration", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(AuthorityError::Config("common name must not be empty".into()));
        }
        // the common name is also the publish file name
        if self.common_name.starts_with('.') || self.common_name.contains(['/', '\\', '\0']) {
            return Err(AuthorityError::Config(format!(
                "common name '{}' must not start with '.' or contain path separators",
                self.common_name.escape_default()
            )));
        }
        if self.country_iso.len() > 2 {
            return Err(AuthorityError::Config(format!(
                "country code '{}' is not a two letter ISO code",
                self.country_iso
            )));
        }
        self.base()?;
        Ok(())
    }

    pub fn load<S: ArtifactStore>(store: &S) -> Result<Self> {
        let data = store
            .read(Folder::Authority, CONFIG_FILE)
            .map_err(|e| AuthorityError::config("Failed to read authority configuration", e))?
            .ok_or_else(|| {
                AuthorityError::Config(format!(
                    "{} not found in {}",
                    CONFIG_FILE,
                    store.describe(Folder::Authority)
                ))
            })?;
        let config = Self::from_json(&data)?;
        debug!(
            "Loaded configuration for {} (serial {}, crl {})",
            config.common_name, config.last_issued_serial, config.last_crl_number
        );
        Ok(config)
    }

    /// Persist the configuration. Any failure is a configuration error
    /// because the counters can no longer be trusted.
    pub fn save<S: ArtifactStore>(&self, store: &S) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| AuthorityError::config("Failed to encode authority configuration", e))?;
        store
            .write(Folder::Authority, CONFIG_FILE, &data)
            .map_err(|e| AuthorityError::config("Failed to save authority configuration", e))
    }

    /// Publish name of the authority certificate, `<CN>.cer`.
    pub fn certificate_file_name(&self) -> String {
        format!("{}.cer", self.common_name)
    }

    /// Publish name of the authority CRL, `<CN>.crl`.
    pub fn crl_file_name(&self) -> String {
        format!("{}.crl", self.common_name)
    }

    /// Certificate download location embedded as AIA caIssuers.
    pub fn aia_url(&self) -> Result<String> {
        self.join_base(&self.certificate_file_name())
    }

    /// CRL location embedded as CRL distribution point.
    pub fn cdp_url(&self) -> Result<String> {
        self.join_base(&self.crl_file_name())
    }

    fn base(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| AuthorityError::config(&format!("Invalid base URL '{}'", self.base_url), e))?;
        if url.cannot_be_a_base() {
            return Err(AuthorityError::Config(format!(
                "base URL '{}' cannot be joined",
                self.base_url
            )));
        }
        Ok(url)
    }

    fn join_base(&self, file_name: &str) -> Result<String> {
        let mut url = self.base()?;
        url.path_segments_mut()
            .map_err(|_| AuthorityError::Config(format!("base URL '{}' cannot be joined", self.base_url)))?
            .pop_if_empty()
            .push(file_name);
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArtifactStore;

    #[test]
    fn test_url_derivation() {
        let config = AuthorityConfig::new("Example Root CA", "https://pki.example.com");
        assert_eq!(
            config.cdp_url().unwrap(),
            "https://pki.example.com/Example%20Root%20CA.crl"
        );
        assert_eq!(
            config.aia_url().unwrap(),
            "https://pki.example.com/Example%20Root%20CA.cer"
        );

        let nested = AuthorityConfig::new("Sub", "https://example.com/pki/");
        assert_eq!(nested.cdp_url().unwrap(), "https://example.com/pki/Sub.crl");
    }

    #[test]
    fn test_missing_and_null_counters() {
        let json = br#"{"common_name":"CA","base_url":"https://x.test","last_issued_serial":null}"#;
        let config = AuthorityConfig::from_json(json).unwrap();
        assert_eq!(config.last_issued_serial, 0);
        assert_eq!(config.last_crl_number, 0);
        assert_eq!(config.organization, "");
    }

    #[test]
    fn test_large_counter_round_trip() {
        let store = MemoryArtifactStore::new();
        let mut config = AuthorityConfig::new("CA", "https://x.test");
        config.last_issued_serial = u64::MAX as u128 + 7;
        config.save(&store).unwrap();
        assert_eq!(AuthorityConfig::load(&store).unwrap(), config);
    }

    #[test]
    fn test_load_failures_are_config_errors() {
        let store = MemoryArtifactStore::new();
        assert!(matches!(
            AuthorityConfig::load(&store),
            Err(AuthorityError::Config(_))
        ));

        store.write(Folder::Authority, CONFIG_FILE, b"{not json").unwrap();
        let err = AuthorityConfig::load(&store).unwrap_err();
        assert!(matches!(err, AuthorityError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validation() {
        assert!(AuthorityConfig::new("", "https://x.test").validate().is_err());
        assert!(AuthorityConfig::new("CA", "not a url").validate().is_err());
        let mut config = AuthorityConfig::new("CA", "https://x.test");
        config.country_iso = "DEU".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_common_name_must_be_a_file_name() {
        for name in ["Ops/Root CA", "Ops\\Root CA", ".hidden CA", "nul\0CA"] {
            let err = AuthorityConfig::new(name, "https://x.test").validate().unwrap_err();
            assert!(matches!(err, AuthorityError::Config(_)), "{}", name);
        }
        let config = AuthorityConfig::new("Ops Root CA 2", "https://x.test");
        config.validate().unwrap();
        assert_eq!(config.certificate_file_name(), "Ops Root CA 2.cer");
        assert_eq!(config.crl_file_name(), "Ops Root CA 2.crl");
    }

    #[test]
    fn test_save_failure_is_config_error() {
        let store = MemoryArtifactStore::new();
        store.set_read_only(Folder::Authority, true);
        let err = AuthorityConfig::new("CA", "https://x.test").save(&store).unwrap_err();
        assert!(matches!(err, AuthorityError::Config(_)));
    }
}
