//! PKCS#10 certificate requests
//!
//! Requests are decoded with OpenSSL (PEM, signature check, public key) and
//! their requested extensions are read with `x509-cert`, since OpenSSL does
//! not expose key usage bits or alternative names of a request.

use crate::authority_config::AuthorityConfig;
use crate::certificate_template::authority_name;
use crate::error::{AuthorityError, Result};
use crate::extensions::{self, AltName};
use crate::profiles::{extended_key_usage_name, KeyUsageBit, Profile, RequestedUsage};
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::stack::Stack;
use openssl::x509::{X509Name, X509Req};
use std::fmt::Write as _;
use x509_cert::ext::pkix::{ExtendedKeyUsage, KeyUsage, SubjectAltName};
use x509_cert::ext::Extension;
use x509_cert::request::CertReq;

/// PKCS#9 extensionRequest attribute.
const ID_EXTENSION_REQ: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// A decoded request together with the profile of the folder it came from.
pub struct CertificateRequest {
    pub profile: Profile,
    /// Empty when the subject carries no common name.
    pub common_name: String,
    pub subject: X509Name,
    pub public_key: PKey<Public>,
    /// SHA-256 of the request's SubjectPublicKeyInfo.
    pub subject_key_id: Vec<u8>,
    pub alt_names: Vec<AltName>,
    pub requested: RequestedUsage,
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("profile", &self.profile)
            .field("common_name", &self.common_name)
            .field("subject", &self.subject.as_ref())
            .field("public_key", &self.public_key)
            .field("subject_key_id", &self.subject_key_id)
            .field("alt_names", &self.alt_names)
            .field("requested", &self.requested)
            .finish()
    }
}

impl CertificateRequest {
    /// Decode a PEM encoded request. Anything that is not a well formed,
    /// correctly self-signed request is a [`AuthorityError::Parse`].
    pub fn parse(pem: &[u8], profile: Profile) -> Result<Self> {
        let req = X509Req::from_pem(pem)
            .map_err(|e| AuthorityError::parse("Failed to decode certificate request", e))?;
        let public_key = req
            .public_key()
            .map_err(|e| AuthorityError::parse("Failed to read request public key", e))?;
        let signature_ok = req
            .verify(&public_key)
            .map_err(|e| AuthorityError::parse("Failed to verify request signature", e))?;
        if !signature_ok {
            return Err(AuthorityError::Parse("request signature does not verify".into()));
        }

        let common_name = req
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|cn| cn.trim().to_string())
            .unwrap_or_default();
        let subject = req
            .subject_name()
            .to_der()
            .and_then(|der| X509Name::from_der(&der))
            .map_err(|e| AuthorityError::parse("Failed to copy request subject", e))?;

        let spki = public_key
            .public_key_to_der()
            .map_err(|e| AuthorityError::parse("Failed to encode request public key", e))?;

        let der = req
            .to_der()
            .map_err(|e| AuthorityError::parse("Failed to encode certificate request", e))?;
        let (alt_names, requested) = read_requested_extensions(&der)?;

        Ok(Self {
            profile,
            common_name,
            subject,
            public_key,
            subject_key_id: extensions::key_identifier(&spki),
            alt_names,
            requested,
        })
    }

    /// Artifact name of the certificate issued for this request,
    /// `<CN>_<hexSKI>.cer` (`_<hexSKI>.cer` without a common name).
    pub fn certificate_name(&self) -> String {
        format!(
            "{}_{}.cer",
            sanitize_file_name(&self.common_name),
            hex::encode(&self.subject_key_id)
        )
    }

    /// Human readable summary.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Subject: {}", describe_name(&self.subject));
        let _ = writeln!(out, "Profile: {}", self.profile);
        let _ = writeln!(out, "Subject Key Id: {}", hex::encode(&self.subject_key_id));

        match &self.requested.key_usage {
            Some(bits) => {
                let names: Vec<&str> = bits.iter().map(KeyUsageBit::name).collect();
                let _ = writeln!(out, "Key Usage: {}", names.join(", "));
            }
            None => {
                let _ = writeln!(out, "Key Usage: none requested");
            }
        }
        match &self.requested.extended_key_usage {
            Some(oids) => {
                let names: Vec<String> = oids
                    .iter()
                    .map(|oid| {
                        extended_key_usage_name(oid)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{} (unsupported)", oid))
                    })
                    .collect();
                let _ = writeln!(out, "Extended Key Usage: {}", names.join(", "));
            }
            None => {
                let _ = writeln!(out, "Extended Key Usage: none requested");
            }
        }
        for name in &self.alt_names {
            let _ = writeln!(out, "Alternative Name: {}", name);
        }
        out
    }
}

/// Artifact names must stay inside their folder.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn describe_name(name: &X509Name) -> String {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{}={}", key, value))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_requested_extensions(der: &[u8]) -> Result<(Vec<AltName>, RequestedUsage)> {
    let req = CertReq::from_der(der)
        .map_err(|e| AuthorityError::parse("Failed to decode certificate request", e))?;

    let mut alt_names = Vec::new();
    let mut requested = RequestedUsage::default();

    for attribute in req.info.attributes.iter() {
        if attribute.oid != ID_EXTENSION_REQ {
            continue;
        }
        for value in attribute.values.iter() {
            let encoded = value
                .to_der()
                .map_err(|e| AuthorityError::parse("Failed to read extension request", e))?;
            let requested_extensions = Vec::<Extension>::from_der(&encoded)
                .map_err(|e| AuthorityError::parse("Failed to decode extension request", e))?;

            for extension in requested_extensions {
                let content = extension.extn_value.as_bytes();
                if extension.extn_id == extensions::ID_CE_KEY_USAGE {
                    let key_usage = KeyUsage::from_der(content)
                        .map_err(|e| AuthorityError::parse("Failed to decode key usage", e))?;
                    requested.key_usage = Some(key_usage_bits(&key_usage));
                } else if extension.extn_id == extensions::ID_CE_EXT_KEY_USAGE {
                    let eku = ExtendedKeyUsage::from_der(content).map_err(|e| {
                        AuthorityError::parse("Failed to decode extended key usage", e)
                    })?;
                    requested.extended_key_usage = Some(eku.0);
                } else if extension.extn_id == extensions::ID_CE_SUBJECT_ALT_NAME {
                    let san = SubjectAltName::from_der(content).map_err(|e| {
                        AuthorityError::parse("Failed to decode subject alternative name", e)
                    })?;
                    alt_names.extend(san.0.iter().filter_map(AltName::from_general_name));
                }
            }
        }
    }

    Ok((alt_names, requested))
}

fn key_usage_bits(key_usage: &KeyUsage) -> Vec<KeyUsageBit> {
    let flags = [
        (key_usage.digital_signature(), KeyUsageBit::DigitalSignature),
        (key_usage.non_repudiation(), KeyUsageBit::ContentCommitment),
        (key_usage.key_encipherment(), KeyUsageBit::KeyEncipherment),
        (key_usage.data_encipherment(), KeyUsageBit::DataEncipherment),
        (key_usage.key_agreement(), KeyUsageBit::KeyAgreement),
        (key_usage.key_cert_sign(), KeyUsageBit::KeyCertSign),
        (key_usage.crl_sign(), KeyUsageBit::CrlSign),
        (key_usage.encipher_only(), KeyUsageBit::EncipherOnly),
        (key_usage.decipher_only(), KeyUsageBit::DecipherOnly),
    ];
    flags
        .into_iter()
        .filter_map(|(set, bit)| set.then_some(bit))
        .collect()
}

/// PEM request for a subordinate authority. No usages are requested; the
/// parent decides them.
pub fn create_sub_ca_request(config: &AuthorityConfig, key: &PKeyRef<Private>) -> Result<Vec<u8>> {
    let mut builder = X509Req::builder()
        .map_err(|e| AuthorityError::crypto("Failed to create request builder", e))?;
    builder
        .set_version(0)
        .map_err(|e| AuthorityError::crypto("Failed to set request version", e))?;
    let subject: X509Name = authority_name(config)?;
    builder
        .set_subject_name(&subject)
        .map_err(|e| AuthorityError::crypto("Failed to set request subject", e))?;
    builder
        .set_pubkey(key)
        .map_err(|e| AuthorityError::crypto("Failed to set request public key", e))?;
    builder
        .sign(key, MessageDigest::sha384())
        .map_err(|e| AuthorityError::crypto("Failed to sign request", e))?;
    builder
        .build()
        .to_pem()
        .map_err(|e| AuthorityError::crypto("Failed to encode request", e))
}

/// PEM request for an end entity: the common name as the only subject
/// entry and `alt_names` as a requested subject alternative name.
///
/// Usages are left to the profile inbox the request is dropped into.
pub fn create_simple_request(
    common_name: &str,
    alt_names: &[AltName],
    key: &PKeyRef<Private>,
) -> Result<Vec<u8>> {
    let mut name_builder = X509Name::builder()
        .map_err(|e| AuthorityError::crypto("Failed to create name builder", e))?;
    if !common_name.is_empty() {
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, common_name)
            .map_err(|e| AuthorityError::crypto("Failed to set CN", e))?;
    }
    let subject = name_builder.build();

    let mut builder = X509Req::builder()
        .map_err(|e| AuthorityError::crypto("Failed to create request builder", e))?;
    builder
        .set_version(0)
        .map_err(|e| AuthorityError::crypto("Failed to set request version", e))?;
    builder
        .set_subject_name(&subject)
        .map_err(|e| AuthorityError::crypto("Failed to set request subject", e))?;
    builder
        .set_pubkey(key)
        .map_err(|e| AuthorityError::crypto("Failed to set request public key", e))?;

    if !alt_names.is_empty() {
        let san = extensions::to_openssl(
            &extensions::ID_CE_SUBJECT_ALT_NAME,
            false,
            &extensions::subject_alt_name(alt_names)?,
        )?;
        let mut requested = Stack::new()
            .map_err(|e| AuthorityError::crypto("Failed to create extension stack", e))?;
        requested
            .push(san)
            .map_err(|e| AuthorityError::crypto("Failed to add subject alternative name", e))?;
        builder
            .add_extensions(&requested)
            .map_err(|e| AuthorityError::crypto("Failed to add requested extensions", e))?;
    }

    builder
        .sign(key, MessageDigest::sha384())
        .map_err(|e| AuthorityError::crypto("Failed to sign request", e))?;
    builder
        .build()
        .to_pem()
        .map_err(|e| AuthorityError::crypto("Failed to encode request", e))
}
