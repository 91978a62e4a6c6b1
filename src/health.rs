//! Health Check
//!
//! Run on every start of an already configured authority, before any
//! request is processed.

use crate::certificate_template::asn1_to_datetime;
use crate::context::AuthorityContext;
use crate::crl::CrlInfo;
use crate::error::Result;
use crate::revocation;
use crate::storage::ArtifactStore;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Authority certificates expiring sooner than this are reported.
pub const CERTIFICATE_EXPIRY_WARNING_DAYS: i64 = 90;
/// CRLs whose next update is closer than this are regenerated.
pub const CRL_REFRESH_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub certificate_not_after: DateTime<Utc>,
    pub certificate_expiring: bool,
    /// Revocation requests imported during the check.
    pub imported_revocations: usize,
    pub crl_regenerated: bool,
    /// The CRL that is current after the check.
    pub crl: CrlInfo,
}

/// Verify the authority certificate and bring the CRL up to date.
///
/// Fails when the authority certificate is missing or unreadable. Pending
/// revocation requests are imported, and a new CRL is signed when there is
/// none, when the current one is about to go stale, or when it does not
/// match the revoked-set.
pub fn verify_authority<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<HealthReport> {
    let now = Utc::now();
    let not_after = asn1_to_datetime(ctx.certificate()?.not_after())?;
    let certificate_expiring = not_after - now < Duration::days(CERTIFICATE_EXPIRY_WARNING_DAYS);
    if certificate_expiring {
        warn!(
            "Authority certificate of {} expires at {}",
            ctx.config().common_name,
            not_after
        );
    }

    let imported_revocations = revocation::import_revocations(ctx)?;

    let current = revocation::current_crl(ctx.store())?;
    if current.is_none() {
        warn!("No readable CRL found, generating one");
    }

    let stale = |info: &CrlInfo| match info.next_update {
        Some(next_update) => next_update - now < Duration::days(CRL_REFRESH_DAYS),
        None => true,
    };

    let (crl, crl_regenerated) = match current {
        Some(info) if !stale(&info) && imported_revocations == 0 => {
            let unlisted = revocation::unlisted_revocations(ctx.store(), &info)?;
            if unlisted.is_empty() {
                debug!("CRL {:?} is current", info.number);
                (info, false)
            } else {
                warn!("CRL {:?} does not list {}", info.number, unlisted.join(", "));
                (revocation::regenerate_crl(ctx)?, true)
            }
        }
        Some(info) => {
            if stale(&info) {
                warn!("CRL {:?} is due for renewal", info.number);
            }
            (revocation::regenerate_crl(ctx)?, true)
        }
        None => (revocation::regenerate_crl(ctx)?, true),
    };

    Ok(HealthReport {
        certificate_not_after: not_after,
        certificate_expiring,
        imported_revocations,
        crl_regenerated,
        crl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::root_context;
    use crate::error::AuthorityError;
    use crate::storage::{Folder, MemoryArtifactStore};
    use crate::authority_config::AuthorityConfig;
    use crate::certificate_template::{authority_name, CertificateTemplate};
    use crate::crl;
    use crate::profiles::{Profile, RequestedUsage};
    use crate::revocation::RevocationEntry;
    use openssl::pkey::PKey;

    #[test]
    fn test_fresh_authority_is_healthy() {
        let (mut ctx, _) = root_context();
        let number = ctx.config().last_crl_number;
        let report = verify_authority(&mut ctx).unwrap();
        assert!(!report.certificate_expiring);
        assert!(!report.crl_regenerated);
        assert_eq!(report.imported_revocations, 0);
        assert_eq!(report.crl.number, Some(number));
        assert_eq!(ctx.config().last_crl_number, number);
    }

    #[test]
    fn test_missing_crl_is_generated() {
        let (mut ctx, store) = root_context();
        let number = ctx.config().last_crl_number;
        for artifact in store.list(Folder::Crl).unwrap() {
            store.delete(Folder::Crl, &artifact.name).unwrap();
        }
        let report = verify_authority(&mut ctx).unwrap();
        assert!(report.crl_regenerated);
        assert_eq!(report.crl.number, Some(number + 1));
        assert!(revocation::latest_crl(&store).unwrap().is_some());
    }

    #[test]
    fn test_unreadable_crl_is_replaced() {
        let (mut ctx, store) = root_context();
        store.write(Folder::Crl, "99.crl", b"garbage").unwrap();
        let report = verify_authority(&mut ctx).unwrap();
        assert!(report.crl_regenerated);
    }

    #[test]
    fn test_missing_certificate_is_fatal() {
        let store = MemoryArtifactStore::new();
        let mut ctx =
            AuthorityContext::create(store, AuthorityConfig::new("Empty CA", "https://x.test")).unwrap();
        let err = verify_authority(&mut ctx).unwrap_err();
        assert!(matches!(err, AuthorityError::MissingCertificate(_)));
    }

    #[test]
    fn test_stale_crl_is_renewed() {
        let (mut ctx, store) = root_context();
        let number = ctx.config().last_crl_number;
        let certificate = ctx.certificate().unwrap().clone();
        let ski = ctx.ca_key_id().unwrap();
        // next update falls 20 days from now
        let this_update = Utc::now() - Duration::days(crl::CRL_VALIDITY_DAYS - 20);
        let stale = crl::build_crl(&certificate, ctx.key().unwrap(), &ski, number, this_update, &[]).unwrap();
        store.write(Folder::Crl, &format!("{}.crl", number), &stale).unwrap();

        let report = verify_authority(&mut ctx).unwrap();
        assert!(report.crl_regenerated);
        assert_eq!(report.crl.number, Some(number + 1));
        let next_update = report.crl.next_update.unwrap();
        assert!(next_update - Utc::now() > Duration::days(CRL_REFRESH_DAYS));
    }

    #[test]
    fn test_expiring_certificate_is_reported() {
        let (mut ctx, _) = root_context();
        let name = authority_name(ctx.config()).unwrap();
        let public = PKey::public_key_from_der(&ctx.key().unwrap().public_key_to_der().unwrap()).unwrap();
        // one year of validity with 60 days left
        let expiring = CertificateTemplate::new(name, public)
            .serial(2019)
            .not_before(Utc::now() - Duration::days(305))
            .validity_years(1)
            .usage(Profile::Intermediate.resolve(&RequestedUsage::default()))
            .sign(&authority_name(ctx.config()).unwrap(), ctx.key().unwrap())
            .unwrap();
        ctx.install_certificate(expiring).unwrap();

        let report = verify_authority(&mut ctx).unwrap();
        assert!(report.certificate_expiring);
        assert!(report.certificate_not_after > Utc::now());
        assert!(!report.crl_regenerated);
    }

    #[test]
    fn test_revocation_missing_from_crl_is_listed() {
        let (mut ctx, store) = root_context();
        let number = ctx.config().last_crl_number;
        let entry = RevocationEntry {
            serial: "2A".into(),
            revoked_at: Utc::now(),
            subject: "lost.test".into(),
            not_after: Utc::now() + Duration::days(200),
        };
        store
            .write(Folder::Revoked, "2A.json", &serde_json::to_vec(&entry).unwrap())
            .unwrap();

        let report = verify_authority(&mut ctx).unwrap();
        assert_eq!(report.imported_revocations, 0);
        assert!(report.crl_regenerated);
        assert_eq!(report.crl.number, Some(number + 1));
        assert!(report.crl.contains("2a"));
    }
}
