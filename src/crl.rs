//! CRL construction
//!
//! rust-openssl can read CRLs but not build them, so the `TBSCertList` is
//! assembled with `x509-cert`, signed with the authority key through an
//! OpenSSL [`Signer`] and re-read by OpenSSL for PEM encoding.

use crate::error::{AuthorityError, Result};
use crate::extensions;
use chrono::{DateTime, Datelike, Duration, Utc};
use der::asn1::{BitString, GeneralizedTime, ObjectIdentifier, OctetString, UtcTime, Uint};
use der::{Decode, Encode};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private};
use openssl::sign::Signer;
use openssl::x509::{X509Crl, X509Ref};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;
use x509_cert::Version;

const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

/// Days between thisUpdate and nextUpdate.
pub const CRL_VALIDITY_DAYS: i64 = 120;

/// One revoked certificate as listed in a CRL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedSerial {
    /// Upper-case hex of the serial number, no leading zero bytes.
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
}

/// The fields of a CRL the authority cares about.
#[derive(Debug, Clone)]
pub struct CrlInfo {
    pub number: Option<u128>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub revoked: Vec<RevokedSerial>,
}

impl CrlInfo {
    pub fn contains(&self, serial: &str) -> bool {
        self.revoked.iter().any(|r| r.serial.eq_ignore_ascii_case(serial))
    }
}

fn der_time(instant: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(instant.timestamp())
        .map_err(|e| AuthorityError::crypto("Failed to encode CRL time", e))?;
    let duration = std::time::Duration::from_secs(secs);
    // RFC 5280: UTCTime through 2049, GeneralizedTime afterwards
    let time = if instant.year() < 2050 {
        UtcTime::from_unix_duration(duration).map(Time::UtcTime)
    } else {
        GeneralizedTime::from_unix_duration(duration).map(Time::GeneralTime)
    };
    time.map_err(|e| AuthorityError::crypto("Failed to encode CRL time", e))
}

fn from_der_time(time: &Time) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(time.to_unix_duration().as_secs())
        .map_err(|e| AuthorityError::parse("CRL time out of range", e))?;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| AuthorityError::Parse("CRL time out of range".into()))
}

/// Serial number bytes from its hex form, as a positive INTEGER.
pub fn serial_from_hex(serial: &str) -> Result<SerialNumber> {
    let raw = hex::decode(serial)
        .map_err(|e| AuthorityError::parse(&format!("Invalid serial '{}'", serial), e))?;
    let mut bytes: Vec<u8> = raw.into_iter().skip_while(|b| *b == 0).collect();
    if bytes.is_empty() {
        bytes.push(0);
    }
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    SerialNumber::new(&bytes)
        .map_err(|e| AuthorityError::parse(&format!("Invalid serial '{}'", serial), e))
}

fn serial_to_hex(serial: &SerialNumber) -> String {
    let bytes: Vec<u8> = serial.as_bytes().iter().copied().skip_while(|b| *b == 0).collect();
    if bytes.is_empty() {
        return "00".into();
    }
    hex::encode_upper(bytes)
}

fn raw_extension(oid: ObjectIdentifier, der: Vec<u8>) -> Result<Extension> {
    Ok(Extension {
        extn_id: oid,
        critical: false,
        extn_value: OctetString::new(der)
            .map_err(|e| AuthorityError::crypto("Failed to wrap CRL extension", e))?,
    })
}

/// Build and sign a CRL, returned as PEM (`X509 CRL`).
pub fn build_crl(
    ca_certificate: &X509Ref,
    signing_key: &PKeyRef<Private>,
    authority_key_id: &[u8],
    number: u128,
    this_update: DateTime<Utc>,
    revoked: &[RevokedSerial],
) -> Result<Vec<u8>> {
    let issuer_der = ca_certificate
        .subject_name()
        .to_der()
        .map_err(|e| AuthorityError::crypto("Failed to encode CRL issuer", e))?;
    let issuer = Name::from_der(&issuer_der)
        .map_err(|e| AuthorityError::crypto("Failed to decode CRL issuer", e))?;

    let revoked_certificates = revoked
        .iter()
        .map(|entry| {
            Ok(RevokedCert {
                serial_number: serial_from_hex(&entry.serial)?,
                revocation_date: der_time(entry.revoked_at)?,
                crl_entry_extensions: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let algorithm = AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA384,
        parameters: None,
    };

    let tbs_cert_list = TbsCertList {
        version: Version::V2,
        signature: algorithm.clone(),
        issuer,
        this_update: der_time(this_update)?,
        next_update: Some(der_time(this_update + Duration::days(CRL_VALIDITY_DAYS))?),
        revoked_certificates: if revoked_certificates.is_empty() {
            None
        } else {
            Some(revoked_certificates)
        },
        crl_extensions: Some(vec![
            raw_extension(
                extensions::ID_CE_AUTHORITY_KEY_IDENTIFIER,
                extensions::authority_key_identifier(authority_key_id)?,
            )?,
            raw_extension(extensions::ID_CE_CRL_NUMBER, extensions::crl_number(number)?)?,
        ]),
    };

    let tbs_der = tbs_cert_list
        .to_der()
        .map_err(|e| AuthorityError::crypto("Failed to encode CRL", e))?;
    let mut signer = Signer::new(MessageDigest::sha384(), signing_key)
        .map_err(|e| AuthorityError::crypto("Failed to create CRL signer", e))?;
    let signature = signer
        .sign_oneshot_to_vec(&tbs_der)
        .map_err(|e| AuthorityError::crypto("Failed to sign CRL", e))?;

    let crl = CertificateList {
        tbs_cert_list,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(&signature)
            .map_err(|e| AuthorityError::crypto("Failed to encode CRL signature", e))?,
    };
    let der = crl
        .to_der()
        .map_err(|e| AuthorityError::crypto("Failed to encode CRL", e))?;

    X509Crl::from_der(&der)
        .and_then(|crl| crl.to_pem())
        .map_err(|e| AuthorityError::crypto("Failed to PEM encode CRL", e))
}

/// Decode a PEM CRL.
pub fn parse_crl(pem: &[u8]) -> Result<CrlInfo> {
    let crl = X509Crl::from_pem(pem).map_err(|e| AuthorityError::parse("Failed to decode CRL", e))?;
    let der = crl
        .to_der()
        .map_err(|e| AuthorityError::parse("Failed to encode CRL", e))?;
    let list = CertificateList::from_der(&der)
        .map_err(|e| AuthorityError::parse("Failed to decode CRL", e))?;
    let tbs = &list.tbs_cert_list;

    let number = tbs
        .crl_extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == extensions::ID_CE_CRL_NUMBER)
        .map(|ext| {
            let value = Uint::from_der(ext.extn_value.as_bytes())
                .map_err(|e| AuthorityError::parse("Failed to decode CRL number", e))?;
            let bytes: Vec<u8> = value.as_bytes().iter().copied().skip_while(|b| *b == 0).collect();
            if bytes.len() > 16 {
                return Err(AuthorityError::Parse("CRL number too large".into()));
            }
            let mut buf = [0u8; 16];
            buf[16 - bytes.len()..].copy_from_slice(&bytes);
            Ok(u128::from_be_bytes(buf))
        })
        .transpose()?;

    let revoked = tbs
        .revoked_certificates
        .iter()
        .flatten()
        .map(|cert| {
            Ok(RevokedSerial {
                serial: serial_to_hex(&cert.serial_number),
                revoked_at: from_der_time(&cert.revocation_date)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CrlInfo {
        number,
        this_update: from_der_time(&tbs.this_update)?,
        next_update: tbs.next_update.as_ref().map(from_der_time).transpose()?,
        revoked,
    })
}
