//! Issuance profiles
//!
//! A profile is inferred from the drop folder a request arrived in and decides
//! the key usage, extended key usage, CA flag and validity of the issued
//! certificate.
//!
//! | Profile | Key Usage | Extended Key Usage |
//! |---|---|---|
//! | webserver | digitalSignature, keyEncipherment, keyAgreement | serverAuth |
//! | server | digitalSignature, keyEncipherment, keyAgreement | serverAuth, clientAuth |
//! | client | digitalSignature, keyEncipherment, dataEncipherment | clientAuth, emailProtection |
//! | code | digitalSignature | codeSigning |
//! | ocsp | digitalSignature | OCSPSigning |
//! | intermediate | keyCertSign, cRLSign | none (CA, pathlen 0) |
//! | generic | taken from the request | taken from the request |

use der::asn1::ObjectIdentifier;
use std::fmt;
use tracing::{debug, error};

pub const ID_KP_SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
pub const ID_KP_CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");
pub const ID_KP_CODE_SIGNING: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");
pub const ID_KP_EMAIL_PROTECTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4");
pub const ID_KP_OCSP_SIGNING: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.9");

/// Extended key usages accepted from generic requests, with display names.
const KNOWN_EXTENDED_KEY_USAGES: &[(&str, &str)] = &[
    ("1.3.6.1.5.5.7.3.1", "serverAuth"),
    ("1.3.6.1.5.5.7.3.2", "clientAuth"),
    ("1.3.6.1.5.5.7.3.3", "codeSigning"),
    ("1.3.6.1.5.5.7.3.4", "emailProtection"),
    ("1.3.6.1.5.5.7.3.5", "ipsecEndSystem"),
    ("1.3.6.1.5.5.7.3.6", "ipsecTunnel"),
    ("1.3.6.1.5.5.7.3.7", "ipsecUser"),
    ("1.3.6.1.5.5.7.3.8", "timeStamping"),
    ("1.3.6.1.5.5.7.3.9", "OCSPSigning"),
    ("1.3.6.1.4.1.311.10.3.3", "msSGC"),
    ("2.16.840.1.113730.4.1", "nsSGC"),
    ("1.3.6.1.4.1.311.2.1.22", "msCodeCom"),
    ("1.3.6.1.4.1.311.61.1.1", "msKernelCodeSigning"),
];

const LEAF_VALIDITY_YEARS: u32 = 1;
const INTERMEDIATE_VALIDITY_YEARS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Profile {
    WebServer,
    Server,
    Client,
    CodeSigning,
    OcspSigning,
    Intermediate,
    Generic,
}

impl Profile {
    pub const ALL: [Profile; 7] = [
        Profile::WebServer,
        Profile::Server,
        Profile::Client,
        Profile::CodeSigning,
        Profile::OcspSigning,
        Profile::Intermediate,
        Profile::Generic,
    ];

    /// Sub-folder of the request inbox; the generic profile reads the inbox root.
    pub fn folder_name(&self) -> Option<&'static str> {
        match self {
            Profile::WebServer => Some("webserver"),
            Profile::Server => Some("server"),
            Profile::Client => Some("client"),
            Profile::CodeSigning => Some("code"),
            Profile::OcspSigning => Some("ocsp"),
            Profile::Intermediate => Some("intermediate"),
            Profile::Generic => None,
        }
    }

    pub fn is_ca(&self) -> bool {
        matches!(self, Profile::Intermediate)
    }

    pub fn validity_years(&self) -> u32 {
        if self.is_ca() {
            INTERMEDIATE_VALIDITY_YEARS
        } else {
            LEAF_VALIDITY_YEARS
        }
    }

    /// Resolve the usages for a request of this profile.
    ///
    /// `requested` holds whatever the request itself asked for; it is only
    /// consulted by the generic profile.
    pub fn resolve(&self, requested: &RequestedUsage) -> CertificateUsage {
        use KeyUsageBit::*;
        let (key_usage, extended_key_usage) = match self {
            Profile::WebServer => (
                vec![DigitalSignature, KeyEncipherment, KeyAgreement],
                vec![ID_KP_SERVER_AUTH],
            ),
            Profile::Server => (
                vec![DigitalSignature, KeyEncipherment, KeyAgreement],
                vec![ID_KP_SERVER_AUTH, ID_KP_CLIENT_AUTH],
            ),
            Profile::Client => (
                vec![DigitalSignature, KeyEncipherment, DataEncipherment],
                vec![ID_KP_CLIENT_AUTH, ID_KP_EMAIL_PROTECTION],
            ),
            Profile::CodeSigning => (vec![DigitalSignature], vec![ID_KP_CODE_SIGNING]),
            Profile::OcspSigning => (vec![DigitalSignature], vec![ID_KP_OCSP_SIGNING]),
            Profile::Intermediate => (vec![KeyCertSign, CrlSign], Vec::new()),
            Profile::Generic => {
                let key_usage = match &requested.key_usage {
                    Some(bits) if !bits.is_empty() => bits.clone(),
                    _ => {
                        error!(
                            "No key usage in request, key usage set to digital signature only"
                        );
                        vec![DigitalSignature]
                    }
                };
                let extended_key_usage = match &requested.extended_key_usage {
                    Some(oids) => supported_extended_key_usages(oids),
                    None => {
                        debug!("No extended key usage in request, extension not set");
                        Vec::new()
                    }
                };
                (key_usage, extended_key_usage)
            }
        };

        CertificateUsage {
            key_usage,
            extended_key_usage,
            is_ca: self.is_ca(),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder_name().unwrap_or("generic"))
    }
}

/// Key usage bits, in RFC 5280 bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsageBit {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

impl KeyUsageBit {
    pub fn name(&self) -> &'static str {
        match self {
            KeyUsageBit::DigitalSignature => "Digital Signature",
            KeyUsageBit::ContentCommitment => "Content Commitment",
            KeyUsageBit::KeyEncipherment => "Key Encipherment",
            KeyUsageBit::DataEncipherment => "Data Encipherment",
            KeyUsageBit::KeyAgreement => "Key Agreement",
            KeyUsageBit::KeyCertSign => "Cert Sign",
            KeyUsageBit::CrlSign => "CRL Sign",
            KeyUsageBit::EncipherOnly => "Encipher Only",
            KeyUsageBit::DecipherOnly => "Decipher Only",
        }
    }
}

/// What a request asked for in its own extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedUsage {
    pub key_usage: Option<Vec<KeyUsageBit>>,
    pub extended_key_usage: Option<Vec<ObjectIdentifier>>,
}

/// Usages that end up in the issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateUsage {
    pub key_usage: Vec<KeyUsageBit>,
    pub extended_key_usage: Vec<ObjectIdentifier>,
    pub is_ca: bool,
}

/// Display name of an extended key usage OID, if it is one we issue.
pub fn extended_key_usage_name(oid: &ObjectIdentifier) -> Option<&'static str> {
    let dotted = oid.to_string();
    KNOWN_EXTENDED_KEY_USAGES
        .iter()
        .find(|(known, _)| *known == dotted)
        .map(|(_, name)| *name)
}

fn supported_extended_key_usages(oids: &[ObjectIdentifier]) -> Vec<ObjectIdentifier> {
    oids.iter()
        .filter(|oid| {
            let supported = extended_key_usage_name(oid).is_some();
            if !supported {
                debug!("Extended key usage {} not supported", oid);
            }
            supported
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webserver_profile() {
        let usage = Profile::WebServer.resolve(&RequestedUsage::default());
        assert_eq!(usage.extended_key_usage, vec![ID_KP_SERVER_AUTH]);
        assert_eq!(
            usage.key_usage,
            vec![
                KeyUsageBit::DigitalSignature,
                KeyUsageBit::KeyEncipherment,
                KeyUsageBit::KeyAgreement
            ]
        );
        assert!(!usage.is_ca);
    }

    #[test]
    fn test_client_profile_ignores_request() {
        let requested = RequestedUsage {
            key_usage: Some(vec![KeyUsageBit::KeyCertSign]),
            extended_key_usage: Some(vec![ID_KP_CODE_SIGNING]),
        };
        let usage = Profile::Client.resolve(&requested);
        assert!(usage.extended_key_usage.contains(&ID_KP_CLIENT_AUTH));
        assert!(usage.extended_key_usage.contains(&ID_KP_EMAIL_PROTECTION));
        assert!(!usage.key_usage.contains(&KeyUsageBit::KeyCertSign));
    }

    #[test]
    fn test_intermediate_profile() {
        let usage = Profile::Intermediate.resolve(&RequestedUsage::default());
        assert!(usage.is_ca);
        assert!(usage.extended_key_usage.is_empty());
        assert_eq!(
            usage.key_usage,
            vec![KeyUsageBit::KeyCertSign, KeyUsageBit::CrlSign]
        );
        assert_eq!(Profile::Intermediate.validity_years(), 6);
        assert_eq!(Profile::Server.validity_years(), 1);
    }

    #[test]
    fn test_generic_profile_defaults() {
        let usage = Profile::Generic.resolve(&RequestedUsage::default());
        assert_eq!(usage.key_usage, vec![KeyUsageBit::DigitalSignature]);
        assert!(usage.extended_key_usage.is_empty());
    }

    #[test]
    fn test_generic_profile_uses_request() {
        let unknown = ObjectIdentifier::new_unwrap("1.2.3.4.5");
        let requested = RequestedUsage {
            key_usage: Some(vec![
                KeyUsageBit::DigitalSignature,
                KeyUsageBit::ContentCommitment,
            ]),
            extended_key_usage: Some(vec![ID_KP_OCSP_SIGNING, unknown]),
        };
        let usage = Profile::Generic.resolve(&requested);
        assert_eq!(usage.key_usage.len(), 2);
        assert_eq!(usage.extended_key_usage, vec![ID_KP_OCSP_SIGNING]);
    }

    #[test]
    fn test_folder_names() {
        assert_eq!(Profile::CodeSigning.folder_name(), Some("code"));
        assert_eq!(Profile::Generic.folder_name(), None);
        assert_eq!(Profile::Generic.to_string(), "generic");
        assert_eq!(
            extended_key_usage_name(&ID_KP_EMAIL_PROTECTION),
            Some("emailProtection")
        );
    }
}
