//! Root CA Certificate Generation Module
//!
//! This module builds the self-signed root certificate, the trust anchor of
//! the authority.
//!
//! # PKI Hierarchy Position
//! ```text
//! Root CA (self-signed) ← This module
//!   ├── Subordinate CA (intermediate profile, pathlen 0)
//!   └── Leaf certificates (webserver, server, client, code, ocsp)
//! ```
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Serial Number**: fixed initial value 2019
//! - **Key Usage**: keyCertSign, cRLSign
//! - **Basic Constraints**: CA=true, no path length constraint
//! - **Key Identifiers**: SKI and AKI are both SHA-256 of the public key
//! - **AIA / CDP**: `<base_url>/<name>.cer` and `<base_url>/<name>.crl`
//! - **Default Validity**: 10 years
//!
//! # Example
//! ```rust,no_run
//! # use tinyca::generate_root_ca::EcRootCABuilder;
//! # fn example(key: &openssl::pkey::PKey<openssl::pkey::Private>) -> tinyca::Result<()> {
//! let root_cert = EcRootCABuilder::new()
//!     .subject_common_name("Example Root CA".to_string())
//!     .organization("Example Corporation".to_string())
//!     .organizational_unit("Security".to_string())
//!     .country("US".to_string())
//!     .base_url("https://pki.example.com".to_string())
//!     .build(key)?;
//! # Ok(())
//! # }
//! ```

use crate::authority_config::AuthorityConfig;
use crate::certificate_template::{authority_name, CertificateTemplate};
use crate::error::{AuthorityError, Result};
use crate::profiles::{CertificateUsage, KeyUsageBit};
use openssl::pkey::{PKey, Private, Public};
use openssl::x509::X509;

/// Serial number of every root certificate.
pub const ROOT_CA_SERIAL: u128 = 2019;
const ROOT_CA_VALIDITY_YEARS: u32 = 10;

/// Builder for the self-signed root CA certificate over an existing key.
pub struct EcRootCABuilder {
    subject_common_name: String,
    organization: String,
    organizational_unit: String,
    country: String,
    base_url: String,
    validity_years: u32,
}

impl Default for EcRootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EcRootCABuilder {
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            country: String::new(),
            base_url: String::new(),
            validity_years: ROOT_CA_VALIDITY_YEARS,
        }
    }

    /// Builder preset with the identity of an authority configuration.
    pub fn from_config(config: &AuthorityConfig) -> Self {
        Self::new()
            .subject_common_name(config.common_name.clone())
            .organization(config.organization.clone())
            .organizational_unit(config.organizational_unit.clone())
            .country(config.country_iso.clone())
            .base_url(config.base_url.clone())
    }

    /// Set the common name (CN); also names the published `.cer` and `.crl`.
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    /// Set the country (C), a 2-letter ISO code
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn validity_years(mut self, years: u32) -> Self {
        self.validity_years = years;
        self
    }

    /// Build the self-signed root certificate for `key`.
    ///
    /// # Errors
    /// Returns [`AuthorityError::Config`] if the common name or base URL is
    /// unusable, and [`AuthorityError::Crypto`] if signing fails.
    pub fn build(self, key: &PKey<Private>) -> Result<X509> {
        let mut config = AuthorityConfig::new(self.subject_common_name, self.base_url);
        config.organization = self.organization;
        config.organizational_unit = self.organizational_unit;
        config.country_iso = self.country;
        config.validate()?;

        let public_key: PKey<Public> = key
            .public_key_to_der()
            .and_then(|der| PKey::public_key_from_der(&der))
            .map_err(|e| AuthorityError::crypto("Failed to extract public key", e))?;
        let issuer = authority_name(&config)?;

        CertificateTemplate::new(authority_name(&config)?, public_key)
            .serial(ROOT_CA_SERIAL)
            .validity_years(self.validity_years)
            .usage(CertificateUsage {
                key_usage: vec![KeyUsageBit::KeyCertSign, KeyUsageBit::CrlSign],
                extended_key_usage: Vec::new(),
                is_ca: true,
            })
            .aia_url(config.aia_url()?)
            .cdp_url(config.cdp_url()?)
            .sign(&issuer, key)
    }
}
