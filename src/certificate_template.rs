//! Certificate Template Module
//!
//! Builds and signs X.509v3 certificates for every kind the authority
//! produces: the self-signed root, subordinate CA certificates and the leaf
//! profiles.
//!
//! # Certificate Properties
//! - **Version**: X.509v3
//! - **Signature Algorithm**: ECDSA with SHA-384
//! - **Subject Key Identifier**: SHA-256 of the SubjectPublicKeyInfo
//! - **Authority Key Identifier**: the issuer's subject key identifier
//! - **Basic Constraints**: only on CA certificates, critical, optional pathlen
//! - **Key Usage**: critical, from the resolved profile
//!
//! # Example
//! ```rust,no_run
//! # use tinyca::certificate_template::CertificateTemplate;
//! # use tinyca::profiles::{Profile, RequestedUsage};
//! # fn example(
//! #     subject: openssl::x509::X509Name,
//! #     public_key: openssl::pkey::PKey<openssl::pkey::Public>,
//! #     issuer: &openssl::x509::X509,
//! #     ca_key: &openssl::pkey::PKey<openssl::pkey::Private>,
//! # ) -> tinyca::Result<()> {
//! let certificate = CertificateTemplate::new(subject, public_key)
//!     .serial(42)
//!     .validity_years(1)
//!     .usage(Profile::WebServer.resolve(&RequestedUsage::default()))
//!     .authority_key_id(vec![0u8; 32])
//!     .sign(issuer.subject_name(), ca_key)?;
//! # Ok(())
//! # }
//! ```

use crate::authority_config::AuthorityConfig;
use crate::error::{AuthorityError, Result};
use crate::extensions::{self, AltName};
use crate::profiles::{CertificateUsage, KeyUsageBit};
use chrono::{DateTime, Months, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509NameRef, X509};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// Distinguished name of the authority: C, O, OU, CN (empty parts omitted).
pub fn authority_name(config: &AuthorityConfig) -> Result<X509Name> {
    let mut name_builder = X509Name::builder()
        .map_err(|e| AuthorityError::crypto("Failed to create name builder", e))?;
    let parts = [
        (Nid::COUNTRYNAME, &config.country_iso, "country"),
        (Nid::ORGANIZATIONNAME, &config.organization, "organization"),
        (Nid::ORGANIZATIONALUNITNAME, &config.organizational_unit, "organizational unit"),
        (Nid::COMMONNAME, &config.common_name, "CN"),
    ];
    for (nid, value, label) in parts {
        if value.is_empty() {
            continue;
        }
        name_builder
            .append_entry_by_nid(nid, value)
            .map_err(|e| AuthorityError::crypto(&format!("Failed to set {}", label), e))?;
    }
    Ok(name_builder.build())
}

/// Convert a UTC instant to an ASN.1 time.
pub fn asn1_time(instant: DateTime<Utc>) -> Result<Asn1Time> {
    Asn1Time::from_unix(instant.timestamp())
        .map_err(|e| AuthorityError::crypto("Failed to create ASN.1 time", e))
}

/// Convert an ASN.1 time to a UTC instant.
pub fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)
        .map_err(|e| AuthorityError::crypto("Failed to create ASN.1 time", e))?;
    let diff = epoch
        .diff(time)
        .map_err(|e| AuthorityError::parse("Failed to compare ASN.1 time", e))?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| AuthorityError::Parse("ASN.1 time out of range".into()))
}

/// `start` plus whole calendar years.
pub fn add_years(start: DateTime<Utc>, years: u32) -> Result<DateTime<Utc>> {
    start
        .checked_add_months(Months::new(years * 12))
        .ok_or_else(|| AuthorityError::Crypto(format!("validity of {} years out of range", years)))
}

/// Builder for a certificate signed by the authority key.
pub struct CertificateTemplate {
    subject: X509Name,
    public_key: PKey<Public>,
    serial: u128,
    not_before: DateTime<Utc>,
    validity_years: u32,
    usage: CertificateUsage,
    path_len: Option<u32>,
    authority_key_id: Option<Vec<u8>>,
    aia_url: Option<String>,
    cdp_url: Option<String>,
    alt_names: Vec<AltName>,
    comment: Option<String>,
}

impl CertificateTemplate {
    pub fn new(subject: X509Name, public_key: PKey<Public>) -> Self {
        Self {
            subject,
            public_key,
            serial: 1,
            not_before: Utc::now(),
            validity_years: 1,
            usage: CertificateUsage {
                key_usage: vec![KeyUsageBit::DigitalSignature],
                extended_key_usage: Vec::new(),
                is_ca: false,
            },
            path_len: None,
            authority_key_id: None,
            aia_url: None,
            cdp_url: None,
            alt_names: Vec::new(),
            comment: None,
        }
    }

    pub fn serial(mut self, serial: u128) -> Self {
        self.serial = serial;
        self
    }

    /// Defaults to the time the template was created.
    pub fn not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    pub fn validity_years(mut self, years: u32) -> Self {
        self.validity_years = years;
        self
    }

    pub fn usage(mut self, usage: CertificateUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Path length constraint for CA certificates.
    pub fn path_len(mut self, path_len: u32) -> Self {
        self.path_len = Some(path_len);
        self
    }

    pub fn authority_key_id(mut self, key_id: Vec<u8>) -> Self {
        self.authority_key_id = Some(key_id);
        self
    }

    pub fn aia_url(mut self, url: String) -> Self {
        self.aia_url = Some(url);
        self
    }

    pub fn cdp_url(mut self, url: String) -> Self {
        self.cdp_url = Some(url);
        self
    }

    pub fn alt_names(mut self, names: Vec<AltName>) -> Self {
        self.alt_names = names;
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    /// Subject key identifier of the certified key.
    pub fn subject_key_id(&self) -> Result<Vec<u8>> {
        let spki = self
            .public_key
            .public_key_to_der()
            .map_err(|e| AuthorityError::crypto("Failed to encode public key", e))?;
        Ok(extensions::key_identifier(&spki))
    }

    /// Sign with the issuer's key. Without an explicit authority key id the
    /// certificate is treated as self-issued and references its own SKI.
    pub fn sign(self, issuer: &X509NameRef, signing_key: &PKeyRef<Private>) -> Result<X509> {
        let subject_key_id = self.subject_key_id()?;
        let authority_key_id = self
            .authority_key_id
            .clone()
            .unwrap_or_else(|| subject_key_id.clone());

        let mut builder = X509::builder()
            .map_err(|e| AuthorityError::crypto("Failed to create X509 builder", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| AuthorityError::crypto("Failed to set version", e))?;

        let serial = BigNum::from_slice(&self.serial.to_be_bytes())
            .and_then(|bn| bn.to_asn1_integer())
            .map_err(|e| AuthorityError::crypto("Failed to create serial number", e))?;
        builder
            .set_serial_number(&serial)
            .map_err(|e| AuthorityError::crypto("Failed to set serial number", e))?;

        builder
            .set_subject_name(&self.subject)
            .map_err(|e| AuthorityError::crypto("Failed to set subject", e))?;
        builder
            .set_issuer_name(issuer)
            .map_err(|e| AuthorityError::crypto("Failed to set issuer", e))?;

        let not_after = add_years(self.not_before, self.validity_years)?;
        let not_before_time: Asn1Time = asn1_time(self.not_before)?;
        let not_after_time: Asn1Time = asn1_time(not_after)?;
        builder
            .set_not_before(&not_before_time)
            .map_err(|e| AuthorityError::crypto("Failed to set not_before", e))?;
        builder
            .set_not_after(&not_after_time)
            .map_err(|e| AuthorityError::crypto("Failed to set not_after", e))?;

        builder
            .set_pubkey(&self.public_key)
            .map_err(|e| AuthorityError::crypto("Failed to set public key", e))?;

        if self.usage.is_ca {
            let mut bc = BasicConstraints::new();
            bc.critical().ca();
            if let Some(path_len) = self.path_len {
                bc.pathlen(path_len);
            }
            let extension = bc
                .build()
                .map_err(|e| AuthorityError::crypto("Failed to build BasicConstraints", e))?;
            builder
                .append_extension(extension)
                .map_err(|e| AuthorityError::crypto("Failed to add BasicConstraints", e))?;
        }

        let mut ku = KeyUsage::new();
        ku.critical();
        for bit in &self.usage.key_usage {
            match bit {
                KeyUsageBit::DigitalSignature => ku.digital_signature(),
                KeyUsageBit::ContentCommitment => ku.non_repudiation(),
                KeyUsageBit::KeyEncipherment => ku.key_encipherment(),
                KeyUsageBit::DataEncipherment => ku.data_encipherment(),
                KeyUsageBit::KeyAgreement => ku.key_agreement(),
                KeyUsageBit::KeyCertSign => ku.key_cert_sign(),
                KeyUsageBit::CrlSign => ku.crl_sign(),
                KeyUsageBit::EncipherOnly => ku.encipher_only(),
                KeyUsageBit::DecipherOnly => ku.decipher_only(),
            };
        }
        let ku_extension = ku
            .build()
            .map_err(|e| AuthorityError::crypto("Failed to build KeyUsage", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| AuthorityError::crypto("Failed to add KeyUsage", e))?;

        let mut raw_extensions = Vec::new();
        if !self.usage.extended_key_usage.is_empty() {
            raw_extensions.push((
                extensions::ID_CE_EXT_KEY_USAGE,
                extensions::extended_key_usage(&self.usage.extended_key_usage)?,
            ));
        }
        raw_extensions.push((
            extensions::ID_CE_SUBJECT_KEY_IDENTIFIER,
            extensions::subject_key_identifier(&subject_key_id)?,
        ));
        raw_extensions.push((
            extensions::ID_CE_AUTHORITY_KEY_IDENTIFIER,
            extensions::authority_key_identifier(&authority_key_id)?,
        ));
        if let Some(url) = &self.aia_url {
            raw_extensions.push((
                extensions::ID_PE_AUTHORITY_INFO_ACCESS,
                extensions::authority_info_access(url)?,
            ));
        }
        if let Some(url) = &self.cdp_url {
            raw_extensions.push((
                extensions::ID_CE_CRL_DISTRIBUTION_POINTS,
                extensions::crl_distribution_points(url)?,
            ));
        }
        if !self.alt_names.is_empty() {
            raw_extensions.push((
                extensions::ID_CE_SUBJECT_ALT_NAME,
                extensions::subject_alt_name(&self.alt_names)?,
            ));
        }
        if let Some(comment) = &self.comment {
            raw_extensions.push((extensions::ID_NETSCAPE_COMMENT, extensions::comment(comment)?));
        }
        for (oid, der) in raw_extensions {
            builder
                .append_extension(extensions::to_openssl(&oid, false, &der)?)
                .map_err(|e| AuthorityError::crypto(&format!("Failed to add extension {}", oid), e))?;
        }

        builder
            .sign(signing_key, MessageDigest::sha384())
            .map_err(|e| AuthorityError::crypto("Failed to sign certificate", e))?;
        Ok(builder.build())
    }
}
