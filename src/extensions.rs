//! DER encoders for the X.509 extensions the authority writes.
//!
//! OpenSSL's extension builders only cover a fixed vocabulary (and compute
//! SHA-1 key identifiers), so the values are encoded with `x509-cert` and
//! handed to OpenSSL as raw DER.

use crate::error::{AuthorityError, Result};
use der::asn1::{Ia5String, ObjectIdentifier, OctetString, Uint};
use der::Encode;
use openssl::asn1::{Asn1Object, Asn1OctetString};
use openssl::x509::X509Extension;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::{
    AccessDescription, AuthorityInfoAccessSyntax, AuthorityKeyIdentifier, CrlDistributionPoints,
    ExtendedKeyUsage, SubjectAltName, SubjectKeyIdentifier,
};

pub const ID_CE_SUBJECT_KEY_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");
pub const ID_CE_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
pub const ID_CE_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
pub const ID_CE_CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
pub const ID_CE_CRL_DISTRIBUTION_POINTS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.31");
pub const ID_CE_AUTHORITY_KEY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.35");
pub const ID_CE_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
pub const ID_PE_AUTHORITY_INFO_ACCESS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.1");
pub const ID_AD_CA_ISSUERS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.2");
/// Netscape comment, used to tag certificates with the issuing software.
pub const ID_NETSCAPE_COMMENT: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.113730.1.13");

pub const ISSUER_COMMENT: &str = "Provided by the Tiny PKI Project";

/// SHA-256 of a DER encoded SubjectPublicKeyInfo.
pub fn key_identifier(spki_der: &[u8]) -> Vec<u8> {
    Sha256::digest(spki_der).to_vec()
}

/// Subject alternative name entries carried over from requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    Dns(String),
    Email(String),
    Ip(Vec<u8>),
    Uri(String),
}

impl AltName {
    /// Convert a decoded general name; kinds other than DNS, email, IP and
    /// URI are not carried over.
    pub fn from_general_name(name: &GeneralName) -> Option<Self> {
        match name {
            GeneralName::DnsName(dns) => Some(AltName::Dns(dns.to_string())),
            GeneralName::Rfc822Name(email) => Some(AltName::Email(email.to_string())),
            GeneralName::IpAddress(ip) => Some(AltName::Ip(ip.as_bytes().to_vec())),
            GeneralName::UniformResourceIdentifier(uri) => Some(AltName::Uri(uri.to_string())),
            _ => None,
        }
    }

    fn to_general_name(&self) -> der::Result<GeneralName> {
        Ok(match self {
            AltName::Dns(dns) => GeneralName::DnsName(Ia5String::new(dns)?),
            AltName::Email(email) => GeneralName::Rfc822Name(Ia5String::new(email)?),
            AltName::Ip(ip) => GeneralName::IpAddress(OctetString::new(ip.clone())?),
            AltName::Uri(uri) => GeneralName::UniformResourceIdentifier(Ia5String::new(uri)?),
        })
    }
}

impl From<IpAddr> for AltName {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => AltName::Ip(v4.octets().to_vec()),
            IpAddr::V6(v6) => AltName::Ip(v6.octets().to_vec()),
        }
    }
}

impl fmt::Display for AltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AltName::Dns(dns) => write!(f, "DNS:{}", dns),
            AltName::Email(email) => write!(f, "email:{}", email),
            AltName::Uri(uri) => write!(f, "URI:{}", uri),
            AltName::Ip(ip) => match ip.len() {
                4 => write!(f, "IP:{}", Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(ip);
                    write!(f, "IP:{}", IpAddr::V6(Ipv6Addr::from(octets)))
                }
                _ => write!(f, "IP:{}", hex::encode(ip)),
            },
        }
    }
}

fn encode(what: &str, value: &impl Encode) -> Result<Vec<u8>> {
    value
        .to_der()
        .map_err(|e| AuthorityError::crypto(&format!("Failed to encode {}", what), e))
}

fn uri(value: &str) -> Result<GeneralName> {
    Ia5String::new(value)
        .map(GeneralName::UniformResourceIdentifier)
        .map_err(|e| AuthorityError::crypto(&format!("Failed to encode URI '{}'", value), e))
}

fn octets(value: &[u8]) -> Result<OctetString> {
    OctetString::new(value.to_vec())
        .map_err(|e| AuthorityError::crypto("Failed to encode octet string", e))
}

pub fn subject_key_identifier(key_id: &[u8]) -> Result<Vec<u8>> {
    encode("subject key identifier", &SubjectKeyIdentifier(octets(key_id)?))
}

pub fn authority_key_identifier(key_id: &[u8]) -> Result<Vec<u8>> {
    let aki = AuthorityKeyIdentifier {
        key_identifier: Some(octets(key_id)?),
        authority_cert_issuer: None,
        authority_cert_serial_number: None,
    };
    encode("authority key identifier", &aki)
}

pub fn authority_info_access(ca_issuers_url: &str) -> Result<Vec<u8>> {
    let aia = AuthorityInfoAccessSyntax(vec![AccessDescription {
        access_method: ID_AD_CA_ISSUERS,
        access_location: uri(ca_issuers_url)?,
    }]);
    encode("authority information access", &aia)
}

pub fn crl_distribution_points(crl_url: &str) -> Result<Vec<u8>> {
    let cdp = CrlDistributionPoints(vec![DistributionPoint {
        distribution_point: Some(DistributionPointName::FullName(vec![uri(crl_url)?])),
        reasons: None,
        crl_issuer: None,
    }]);
    encode("CRL distribution points", &cdp)
}

pub fn subject_alt_name(names: &[AltName]) -> Result<Vec<u8>> {
    let general_names = names
        .iter()
        .map(AltName::to_general_name)
        .collect::<der::Result<Vec<_>>>()
        .map_err(|e| AuthorityError::crypto("Failed to encode subject alternative name", e))?;
    encode("subject alternative name", &SubjectAltName(general_names))
}

pub fn extended_key_usage(oids: &[ObjectIdentifier]) -> Result<Vec<u8>> {
    encode("extended key usage", &ExtendedKeyUsage(oids.to_vec()))
}

pub fn comment(text: &str) -> Result<Vec<u8>> {
    let value = Ia5String::new(text)
        .map_err(|e| AuthorityError::crypto("Failed to encode comment", e))?;
    encode("comment", &value)
}

pub fn crl_number(number: u128) -> Result<Vec<u8>> {
    let value = Uint::new(&number.to_be_bytes())
        .map_err(|e| AuthorityError::crypto("Failed to encode CRL number", e))?;
    encode("CRL number", &value)
}

/// Wrap DER extension content as an OpenSSL extension.
pub fn to_openssl(oid: &ObjectIdentifier, critical: bool, der: &[u8]) -> Result<X509Extension> {
    let object = Asn1Object::from_str(&oid.to_string())
        .map_err(|e| AuthorityError::crypto(&format!("Failed to create OID {}", oid), e))?;
    let contents = Asn1OctetString::new_from_bytes(der)
        .map_err(|e| AuthorityError::crypto("Failed to wrap extension value", e))?;
    X509Extension::new_from_der(&object, critical, &contents)
        .map_err(|e| AuthorityError::crypto(&format!("Failed to build extension {}", oid), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::Decode;

    #[test]
    fn test_key_identifier_is_sha256() {
        let id = key_identifier(b"spki");
        assert_eq!(id.len(), 32);
        assert_eq!(id, Sha256::digest(b"spki").to_vec());
    }

    #[test]
    fn test_crl_distribution_point_uri() {
        let der = crl_distribution_points("https://pki.example.com/Example%20Root%20CA.crl").unwrap();
        let decoded = CrlDistributionPoints::from_der(&der).unwrap();
        match &decoded.0[0].distribution_point {
            Some(DistributionPointName::FullName(names)) => match &names[0] {
                GeneralName::UniformResourceIdentifier(uri) => {
                    assert_eq!(uri.to_string(), "https://pki.example.com/Example%20Root%20CA.crl")
                }
                other => panic!("unexpected name {:?}", other),
            },
            other => panic!("unexpected distribution point {:?}", other),
        }
    }

    #[test]
    fn test_alt_names() {
        let names = vec![
            AltName::Dns("app.example.com".into()),
            AltName::Ip(vec![10, 0, 0, 1]),
            AltName::Email("ops@example.com".into()),
        ];
        let der = subject_alt_name(&names).unwrap();
        let decoded = SubjectAltName::from_der(&der).unwrap();
        let round: Vec<AltName> = decoded.0.iter().filter_map(AltName::from_general_name).collect();
        assert_eq!(round, names);
        assert_eq!(names[1].to_string(), "IP:10.0.0.1");
        assert_eq!(AltName::from(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), names[1]);
        assert_eq!(AltName::from(IpAddr::V6(Ipv6Addr::LOCALHOST)).to_string(), "IP:::1");
    }

    #[test]
    fn test_crl_number_is_positive_integer() {
        let der = crl_number(0x80).unwrap();
        // INTEGER, length 2, leading zero keeps the value positive
        assert_eq!(der, vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(crl_number(1).unwrap(), vec![0x02, 0x01, 0x01]);
    }

    #[test]
    fn test_openssl_extension_from_der() {
        let der = subject_key_identifier(&[1, 2, 3]).unwrap();
        assert!(to_openssl(&ID_CE_SUBJECT_KEY_IDENTIFIER, false, &der).is_ok());
    }
}
