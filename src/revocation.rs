//! Revocation Engine
//!
//! Revocation requests are certificates dropped into the revoke inbox. An
//! accepted request becomes a [`RevocationEntry`] in the durable revoked-set
//! (`<SERIAL>.json` plus the certificate as `<SERIAL>.cer`), and every change
//! to the revoked-set produces a new CRL.
//!
//! A request is accepted only for an unexpired certificate whose authority
//! key id equals the authority's subject key id. Rejected requests are moved
//! to the inbox archive and never reach a CRL.

use crate::certificate_template::asn1_to_datetime;
use crate::context::AuthorityContext;
use crate::crl::{self, CrlInfo, RevokedSerial};
use crate::error::{AuthorityError, Result};
use crate::storage::{Artifact, ArtifactStore, Folder};
use chrono::{DateTime, Utc};
use openssl::nid::Nid;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const ENTRY_EXTENSION: &str = ".json";
const CERTIFICATE_EXTENSION: &str = ".cer";
const CRL_EXTENSION: &str = ".crl";

/// A certificate in the revoked-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    /// Upper-case hex serial number.
    pub serial: String,
    /// When the revocation was imported.
    pub revoked_at: DateTime<Utc>,
    pub subject: String,
    pub not_after: DateTime<Utc>,
}

impl RevocationEntry {
    pub fn from_certificate(certificate: &X509, revoked_at: DateTime<Utc>) -> Result<Self> {
        let serial = certificate
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
            .map_err(|e| AuthorityError::parse("Failed to read serial number", e))?;
        Ok(Self {
            serial,
            revoked_at,
            subject: common_name(certificate),
            not_after: asn1_to_datetime(certificate.not_after())?,
        })
    }

    fn file_name(&self) -> String {
        format!("{}{}", self.serial, ENTRY_EXTENSION)
    }
}

fn common_name(certificate: &X509) -> String {
    certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .unwrap_or_default()
}

fn parse_certificate(data: &[u8]) -> Result<X509> {
    X509::from_pem(data)
        .or_else(|_| X509::from_der(data))
        .map_err(|e| AuthorityError::parse("Failed to decode certificate", e))
}

/// Every entry of the revoked-set, sorted by serial.
pub fn revoked_set<S: ArtifactStore>(store: &S) -> Result<Vec<RevocationEntry>> {
    let mut entries = Vec::new();
    for artifact in store.list(Folder::Revoked)? {
        if !artifact.name.ends_with(ENTRY_EXTENSION) {
            continue;
        }
        match serde_json::from_slice::<RevocationEntry>(&artifact.data) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipped unreadable revocation entry {}: {}", artifact.name, e),
        }
    }
    entries.sort_by(|a, b| serial_order(&a.serial).cmp(&serial_order(&b.serial)));
    Ok(entries)
}

/// Numeric order of hex serials of any length: significant digits first,
/// then the digits themselves.
fn serial_order(serial: &str) -> (usize, String) {
    let digits = serial.trim_start_matches('0').to_ascii_uppercase();
    (digits.len(), digits)
}

enum Outcome {
    Imported,
    Duplicate,
    Rejected(String),
}

fn import_one<S: ArtifactStore>(
    store: &S,
    artifact: &Artifact,
    ca_key_id: &[u8],
    now: DateTime<Utc>,
) -> Result<Outcome> {
    let certificate = match parse_certificate(&artifact.data) {
        Ok(certificate) => certificate,
        Err(e) => return Ok(Outcome::Rejected(e.to_string())),
    };
    let entry = RevocationEntry::from_certificate(&certificate, now)?;

    if entry.not_after <= now {
        return Ok(Outcome::Rejected(format!("certificate {} already expired", entry.serial)));
    }
    let issued_here = certificate
        .authority_key_id()
        .map(|aki| aki.as_slice() == ca_key_id)
        .unwrap_or(false);
    if !issued_here {
        return Ok(Outcome::Rejected(format!(
            "certificate {} was not issued by this authority",
            entry.serial
        )));
    }
    if store.exists(Folder::Revoked, &entry.file_name())? {
        return Ok(Outcome::Duplicate);
    }

    let json = serde_json::to_vec_pretty(&entry)
        .map_err(|e| AuthorityError::crypto("Failed to encode revocation entry", e))?;
    store.write(
        Folder::Revoked,
        &format!("{}{}", entry.serial, CERTIFICATE_EXTENSION),
        &artifact.data,
    )?;
    store.write(Folder::Revoked, &entry.file_name(), &json)?;
    info!("Revoked certificate {} ({})", entry.serial, entry.subject);
    Ok(Outcome::Imported)
}

/// Move acceptable revocation requests into the revoked-set.
///
/// Returns the number of newly revoked certificates.
pub fn import_revocations<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<usize> {
    let ca_key_id = ctx.ca_key_id()?;
    let store = ctx.store();
    let now = Utc::now();
    let mut count = 0;

    for artifact in store.list(Folder::Revoke)? {
        match import_one(store, &artifact, &ca_key_id, now) {
            Ok(outcome) => {
                match outcome {
                    Outcome::Imported => count += 1,
                    Outcome::Duplicate => {
                        debug!("{} is already revoked", artifact.name)
                    }
                    Outcome::Rejected(reason) => {
                        warn!("Ignored revocation request {}: {}", artifact.name, reason)
                    }
                }
                if let Err(e) = store.archive(Folder::Revoke, &artifact.name) {
                    error!("Failed to archive revocation request {}: {}", artifact.name, e);
                }
            }
            Err(e) => error!("Failed to import revocation request {}: {}", artifact.name, e),
        }
    }

    Ok(count)
}

/// Newest CRL in the CRL folder (highest number) and its number.
pub fn latest_crl<S: ArtifactStore>(store: &S) -> Result<Option<(u128, Vec<u8>)>> {
    let latest = store
        .list(Folder::Crl)?
        .into_iter()
        .filter_map(|artifact| {
            let number = artifact
                .name
                .strip_suffix(CRL_EXTENSION)?
                .parse::<u128>()
                .ok()?;
            Some((number, artifact.data))
        })
        .max_by_key(|(number, _)| *number);
    Ok(latest)
}

/// The latest CRL, decoded. An unreadable CRL is reported and treated as
/// missing.
pub fn current_crl<S: ArtifactStore>(store: &S) -> Result<Option<CrlInfo>> {
    let Some((number, pem)) = latest_crl(store)? else {
        return Ok(None);
    };
    match crl::parse_crl(&pem) {
        Ok(info) => Ok(Some(info)),
        Err(e) => {
            error!("Latest CRL {} is unreadable: {}", number, e);
            Ok(None)
        }
    }
}

/// Serials of unexpired revoked-set entries that `crl` does not list.
///
/// Non-empty after a run that imported revocations but failed before the
/// new CRL was written.
pub fn unlisted_revocations<S: ArtifactStore>(store: &S, crl: &CrlInfo) -> Result<Vec<String>> {
    let now = Utc::now();
    Ok(revoked_set(store)?
        .into_iter()
        .filter(|entry| entry.not_after > now && !crl.contains(&entry.serial))
        .map(|entry| entry.serial)
        .collect())
}

/// Sign a new CRL over the revoked-set and publish it.
pub fn regenerate_crl<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<CrlInfo> {
    let authority_key_id = ctx.ca_key_id()?;
    let certificate = ctx.certificate()?.clone();
    let now = Utc::now();

    let revoked: Vec<RevokedSerial> = revoked_set(ctx.store())?
        .into_iter()
        .filter(|entry| entry.not_after > now)
        .map(|entry| RevokedSerial {
            serial: entry.serial,
            revoked_at: entry.revoked_at,
        })
        .collect();

    let number = ctx.next_crl_number()?;
    let pem = crl::build_crl(
        &certificate,
        ctx.key()?,
        &authority_key_id,
        number,
        now,
        &revoked,
    )?;

    let store = ctx.store();
    store.write(Folder::Crl, &format!("{}{}", number, CRL_EXTENSION), &pem)?;
    store.publish(&ctx.config().crl_file_name(), &pem)?;
    info!("Published CRL {} with {} revoked certificates", number, revoked.len());

    crl::parse_crl(&pem)
}

/// Import pending revocations and republish the CRL when anything changed
/// or when the latest CRL misses a revoked certificate.
pub fn revoke_pending<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<usize> {
    let count = import_revocations(ctx)?;
    if count > 0 {
        regenerate_crl(ctx)?;
        return Ok(count);
    }

    let behind = match current_crl(ctx.store())? {
        Some(info) => {
            let unlisted = unlisted_revocations(ctx.store(), &info)?;
            if !unlisted.is_empty() {
                warn!("CRL {:?} does not list {}", info.number, unlisted.join(", "));
            }
            !unlisted.is_empty()
        }
        None => true,
    };
    if behind {
        regenerate_crl(ctx)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::root_context;
    use crate::certificate_template::{authority_name, CertificateTemplate};
    use crate::private_key_storage::generate_key;
    use crate::authority_config::AuthorityConfig;
    use openssl::pkey::PKey;

    fn leaf(aki: Vec<u8>, serial: u128, years: u32) -> Vec<u8> {
        let issuer_key = generate_key().unwrap();
        let leaf_key = generate_key().unwrap();
        let public = PKey::public_key_from_der(&leaf_key.public_key_to_der().unwrap()).unwrap();
        let name = authority_name(&AuthorityConfig::new("leaf.test", "https://x.test")).unwrap();
        let not_before = Utc::now() - chrono::Duration::days(800);
        CertificateTemplate::new(name, public)
            .serial(serial)
            .not_before(not_before)
            .validity_years(years)
            .authority_key_id(aki)
            .sign(
                &authority_name(&AuthorityConfig::new("Other", "https://x.test")).unwrap(),
                &issuer_key,
            )
            .unwrap()
            .to_pem()
            .unwrap()
    }

    #[test]
    fn test_import_accepts_own_certificates_only() {
        let (mut ctx, store) = root_context();
        let ski = ctx.ca_key_id().unwrap();

        store.write(Folder::Revoke, "a.cer", &leaf(ski.clone(), 0x10, 5)).unwrap();
        store.write(Folder::Revoke, "b.cer", &leaf(vec![9u8; 32], 0x11, 5)).unwrap();
        store.write(Folder::Revoke, "c.cer", &leaf(ski.clone(), 0x12, 1)).unwrap();
        store.write(Folder::Revoke, "d.cer", b"garbage").unwrap();

        assert_eq!(import_revocations(&mut ctx).unwrap(), 1);
        let set = revoked_set(&store).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].serial, "10");
        assert!(store.exists(Folder::Revoked, "10.cer").unwrap());
        assert!(store.list(Folder::Revoke).unwrap().is_empty());
        assert_eq!(store.archived(Folder::Revoke).len(), 4);
    }

    #[test]
    fn test_duplicate_revocation_not_counted() {
        let (mut ctx, store) = root_context();
        let ski = ctx.ca_key_id().unwrap();
        let cert = leaf(ski, 0x20, 5);

        store.write(Folder::Revoke, "first.cer", &cert).unwrap();
        assert_eq!(revoke_pending(&mut ctx).unwrap(), 1);
        let first_time = revoked_set(&store).unwrap()[0].revoked_at;

        store.write(Folder::Revoke, "again.cer", &cert).unwrap();
        assert_eq!(revoke_pending(&mut ctx).unwrap(), 0);
        let set = revoked_set(&store).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].revoked_at, first_time);
    }

    #[test]
    fn test_crl_numbers_increase_and_list_revoked() {
        let (mut ctx, store) = root_context();
        let before = ctx.config().last_crl_number;
        let ski = ctx.ca_key_id().unwrap();

        store.write(Folder::Revoke, "x.cer", &leaf(ski, 0x30, 5)).unwrap();
        revoke_pending(&mut ctx).unwrap();
        assert_eq!(ctx.config().last_crl_number, before + 1);

        let (number, pem) = latest_crl(&store).unwrap().unwrap();
        assert_eq!(number, before + 1);
        let info = crl::parse_crl(&pem).unwrap();
        assert_eq!(info.number, Some(before + 1));
        assert_eq!(info.revoked.iter().filter(|r| r.serial == "30").count(), 1);

        let published = store.read(Folder::Publish, "Test Root CA.crl").unwrap().unwrap();
        assert_eq!(published, pem);

        let info = regenerate_crl(&mut ctx).unwrap();
        assert_eq!(info.number, Some(before + 2));
        assert!(info.contains("30"));
        assert_eq!(store.archived(Folder::Publish).iter().filter(|n| n.ends_with(".crl")).count(), 2);
    }

    #[test]
    fn test_latest_crl_ignores_other_files() {
        let (ctx, store) = root_context();
        drop(ctx);
        store.write(Folder::Crl, "9.crl", b"nine").unwrap();
        store.write(Folder::Crl, "10.crl", b"ten").unwrap();
        store.write(Folder::Crl, "notes.txt", b"x").unwrap();
        let (number, data) = latest_crl(&store).unwrap().unwrap();
        assert_eq!(number, 10);
        assert_eq!(data, b"ten");
    }

    fn entry(serial: &str, not_after: DateTime<Utc>) -> RevocationEntry {
        RevocationEntry {
            serial: serial.into(),
            revoked_at: Utc::now() - chrono::Duration::days(3),
            subject: format!("{}.test", serial),
            not_after,
        }
    }

    fn store_entry(store: &impl ArtifactStore, entry: &RevocationEntry) {
        store
            .write(Folder::Revoked, &entry.file_name(), &serde_json::to_vec(entry).unwrap())
            .unwrap();
    }

    #[test]
    fn test_failed_crl_write_is_recovered() {
        let (mut ctx, store) = root_context();
        let ski = ctx.ca_key_id().unwrap();
        store.write(Folder::Revoke, "a.cer", &leaf(ski, 0x40, 5)).unwrap();

        store.set_read_only(Folder::Crl, true);
        assert!(revoke_pending(&mut ctx).is_err());
        assert!(!current_crl(&store).unwrap().unwrap().contains("40"));

        store.set_read_only(Folder::Crl, false);
        assert_eq!(revoke_pending(&mut ctx).unwrap(), 0);
        let info = current_crl(&store).unwrap().unwrap();
        assert!(info.contains("40"));
        assert!(unlisted_revocations(&store, &info).unwrap().is_empty());

        // an up to date CRL is left alone
        let number = ctx.config().last_crl_number;
        revoke_pending(&mut ctx).unwrap();
        assert_eq!(ctx.config().last_crl_number, number);
    }

    #[test]
    fn test_expired_entries_leave_the_crl() {
        let (mut ctx, store) = root_context();
        store_entry(&store, &entry("50", Utc::now() - chrono::Duration::days(1)));
        store_entry(&store, &entry("51", Utc::now() + chrono::Duration::days(30)));

        let info = regenerate_crl(&mut ctx).unwrap();
        assert!(info.contains("51"));
        assert!(!info.contains("50"));
        assert_eq!(info.revoked.len(), 1);
        // the durable record stays
        assert_eq!(revoked_set(&store).unwrap().len(), 2);
        assert!(unlisted_revocations(&store, &info).unwrap().is_empty());
    }

    #[test]
    fn test_revoked_set_in_numeric_order() {
        let store = crate::storage::MemoryArtifactStore::new();
        let later = Utc::now() + chrono::Duration::days(30);
        for serial in ["10", "09", "0100", "FF"] {
            store_entry(&store, &entry(serial, later));
        }
        let serials: Vec<String> = revoked_set(&store)
            .unwrap()
            .into_iter()
            .map(|entry| entry.serial)
            .collect();
        assert_eq!(serials, vec!["09", "10", "FF", "0100"]);
    }
}
