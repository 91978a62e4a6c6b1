//! Certificate Issuer
//!
//! Drains the per-profile request inboxes. Each request moves through
//! `Parsed → Profiled → Signed → Persisted → Archived`:
//!
//! - a malformed request is archived so it cannot block the batch;
//! - a signing or storage failure skips the request and leaves it in place
//!   for the next run;
//! - an authority-level failure (configuration, key, certificate) aborts the
//!   whole batch.
//!
//! Serial numbers are persisted by [`AuthorityContext::next_serial`] before
//! the certificate that carries them is written anywhere.

use crate::certificate_template::CertificateTemplate;
use crate::context::AuthorityContext;
use crate::error::{AuthorityError, Result};
use crate::extensions::ISSUER_COMMENT;
use crate::request::{sanitize_file_name, CertificateRequest};
use crate::profiles::Profile;
use crate::storage::{ArtifactStore, Folder};
use openssl::x509::{X509Name, X509};
use tracing::{debug, error, info, warn};

/// Outcome counts of one issuance batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IssuanceReport {
    pub issued: usize,
    /// Malformed requests, archived without issuing.
    pub rejected: usize,
    /// Requests left in place after a per-item failure.
    pub failed: usize,
}

/// Issue a certificate for every pending request of every profile.
///
/// Requests are processed profile by profile, in name order within each
/// inbox.
pub fn issue_pending<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<IssuanceReport> {
    let mut report = IssuanceReport::default();

    for profile in Profile::ALL {
        let folder = Folder::Requests(profile);
        for artifact in ctx.store().list(folder)? {
            debug!("Processing request {} ({})", artifact.name, profile);

            let request = match CertificateRequest::parse(&artifact.data, profile) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Rejected request {}: {}", artifact.name, e);
                    ctx.store().archive(folder, &artifact.name)?;
                    report.rejected += 1;
                    continue;
                }
            };

            match issue(ctx, &request) {
                Ok(_) => {
                    ctx.store().archive(folder, &artifact.name)?;
                    report.issued += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Failed to issue certificate for {}: {}", artifact.name, e);
                    report.failed += 1;
                }
            }
        }
    }

    if report != IssuanceReport::default() {
        info!(
            "Issuance finished: {} issued, {} rejected, {} failed",
            report.issued, report.rejected, report.failed
        );
    }
    Ok(report)
}

/// Sign and persist a certificate for one decoded request.
///
/// The certificate is written to the issued outbox as `<CN>_<hexSKI>.cer`,
/// intermediate certificates are published as `<CN>.cer`, and the
/// certificate store receives its copy last. When a write fails, the copies
/// already written are removed again so a retry starts from a clean state.
pub fn issue<S: ArtifactStore>(ctx: &mut AuthorityContext<S>, request: &CertificateRequest) -> Result<X509> {
    let usage = request.profile.resolve(&request.requested);
    let authority_key_id = ctx.ca_key_id()?;
    let issuer = copy_name(ctx.certificate()?.subject_name())?;
    let aia_url = ctx.config().aia_url()?;
    let cdp_url = ctx.config().cdp_url()?;
    let name = request.certificate_name();
    let published = request.profile.is_ca().then(|| published_name(request));
    // a locked authority must not consume a serial
    ctx.key()?;

    let subject = copy_name(&request.subject)?;
    let public_key = request.public_key.clone();
    let serial = ctx.next_serial()?;

    let mut template = CertificateTemplate::new(subject, public_key)
        .serial(serial)
        .validity_years(request.profile.validity_years())
        .usage(usage)
        .authority_key_id(authority_key_id)
        .aia_url(aia_url)
        .cdp_url(cdp_url)
        .alt_names(request.alt_names.clone())
        .comment(ISSUER_COMMENT);
    if request.profile.is_ca() {
        template = template.path_len(0);
    }
    let certificate = template.sign(&issuer, ctx.key()?)?;

    let pem = certificate
        .to_pem()
        .map_err(|e| AuthorityError::crypto("Failed to encode certificate", e))?;
    persist(ctx.store(), &name, published.as_deref(), &pem)?;

    info!(
        "Issued {} certificate {} with serial {:X}",
        request.profile, name, serial
    );
    Ok(certificate)
}

/// Publish name of a CA certificate: `<CN>.cer`, or the archival name when
/// the request carries no common name.
fn published_name(request: &CertificateRequest) -> String {
    let common_name = sanitize_file_name(&request.common_name);
    if common_name.is_empty() {
        request.certificate_name()
    } else {
        format!("{}.cer", common_name)
    }
}

fn persist<S: ArtifactStore>(store: &S, name: &str, published: Option<&str>, pem: &[u8]) -> Result<()> {
    let mut written: Vec<(Folder, &str)> = Vec::new();
    let result = (|| -> Result<()> {
        store.write(Folder::Issued, name, pem)?;
        written.push((Folder::Issued, name));
        if let Some(published) = published {
            store.publish(published, pem)?;
            written.push((Folder::Publish, published));
        }
        store.write(Folder::CertificateStore, name, pem)
    })();

    if result.is_err() {
        for (folder, name) in written.into_iter().rev() {
            if let Err(e) = store.delete(folder, name) {
                warn!("Failed to remove {} after failed issuance: {}", name, e);
            }
        }
    }
    result
}

fn copy_name(name: &openssl::x509::X509NameRef) -> Result<X509Name> {
    name.to_der()
        .and_then(|der| X509Name::from_der(&der))
        .map_err(|e| AuthorityError::crypto("Failed to copy distinguished name", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::root_context;
    use crate::profiles::{ID_KP_CLIENT_AUTH, ID_KP_EMAIL_PROTECTION, ID_KP_SERVER_AUTH};
    use crate::request::tests::{make_request, request_with_subject};
    use der::Decode;
    use openssl::nid::Nid;
    use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
    use x509_cert::Certificate;

    fn decoded(pem: &[u8]) -> Certificate {
        let der = X509::from_pem(pem).unwrap().to_der().unwrap();
        Certificate::from_der(&der).unwrap()
    }

    fn extension<'a>(cert: &'a Certificate, oid: &str) -> Option<&'a [u8]> {
        let oid = der::asn1::ObjectIdentifier::new_unwrap(oid);
        cert.tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == oid)
            .map(|ext| ext.extn_value.as_bytes())
    }

    fn extended_key_usage(cert: &Certificate) -> Vec<der::asn1::ObjectIdentifier> {
        ExtendedKeyUsage::from_der(extension(cert, "2.5.29.37").unwrap())
            .unwrap()
            .0
    }

    #[test]
    fn test_issue_webserver_batch() {
        let (mut ctx, store) = root_context();
        let (pem, _) = make_request("app.example.com", false);
        store.write(Folder::Requests(Profile::WebServer), "app.csr", &pem).unwrap();

        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.issued, 1);
        assert_eq!(ctx.config().last_issued_serial, 1);
        assert!(store.list(Folder::Requests(Profile::WebServer)).unwrap().is_empty());

        let issued = store.list(Folder::Issued).unwrap();
        assert_eq!(issued.len(), 1);
        assert!(issued[0].name.starts_with("app.example.com_"));
        assert!(store.exists(Folder::CertificateStore, &issued[0].name).unwrap());

        let cert = decoded(&issued[0].data);
        assert_eq!(extended_key_usage(&cert), vec![ID_KP_SERVER_AUTH]);
        assert!(extension(&cert, "2.5.29.19").is_none());
        assert!(extension(&cert, "2.16.840.1.113730.1.13").is_some());

        let x509 = X509::from_pem(&issued[0].data).unwrap();
        assert!(x509.verify(ctx.key().unwrap()).unwrap());
        assert_eq!(
            x509.authority_key_id().unwrap().as_slice(),
            ctx.ca_key_id().unwrap().as_slice()
        );
    }

    #[test]
    fn test_client_profile_usages() {
        let (mut ctx, _) = root_context();
        let (pem, _) = make_request("alice", true);
        let request = CertificateRequest::parse(&pem, Profile::Client).unwrap();
        let cert = issue(&mut ctx, &request).unwrap();
        let cert = decoded(&cert.to_pem().unwrap());
        let eku = extended_key_usage(&cert);
        assert!(eku.contains(&ID_KP_CLIENT_AUTH));
        assert!(eku.contains(&ID_KP_EMAIL_PROTECTION));
    }

    #[test]
    fn test_intermediate_is_published() {
        let (mut ctx, store) = root_context();
        let (pem, _) = make_request("issuing-ca.example", false);
        let request = CertificateRequest::parse(&pem, Profile::Intermediate).unwrap();
        let cert = issue(&mut ctx, &request).unwrap();

        let decoded = decoded(&cert.to_pem().unwrap());
        let constraints = BasicConstraints::from_der(extension(&decoded, "2.5.29.19").unwrap()).unwrap();
        assert!(constraints.ca);
        assert_eq!(constraints.path_len_constraint, Some(0));
        assert!(store.exists(Folder::Publish, "issuing-ca.example.cer").unwrap());
    }

    #[test]
    fn test_serials_increase_across_batch() {
        let (mut ctx, store) = root_context();
        for (i, cn) in ["a.test", "b.test", "c.test"].iter().enumerate() {
            let (pem, _) = make_request(cn, false);
            store
                .write(Folder::Requests(Profile::Server), &format!("{}.csr", i), &pem)
                .unwrap();
        }
        issue_pending(&mut ctx).unwrap();

        let mut serials: Vec<u32> = store
            .list(Folder::Issued)
            .unwrap()
            .iter()
            .map(|artifact| {
                let cert = X509::from_pem(&artifact.data).unwrap();
                let bn = cert.serial_number().to_bn().unwrap();
                bn.to_dec_str().unwrap().parse().unwrap()
            })
            .collect();
        serials.sort();
        assert_eq!(serials, vec![1, 2, 3]);
    }

    #[test]
    fn test_malformed_request_is_archived() {
        let (mut ctx, store) = root_context();
        let folder = Folder::Requests(Profile::Client);
        store.write(folder, "broken.csr", b"not a request").unwrap();
        let (pem, _) = make_request("bob", false);
        store.write(folder, "good.csr", &pem).unwrap();

        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.issued, 1);
        assert_eq!(store.archived(folder).len(), 2);
        assert_eq!(ctx.config().last_issued_serial, 1);
    }

    #[test]
    fn test_storage_failure_keeps_request() {
        let (mut ctx, store) = root_context();
        let folder = Folder::Requests(Profile::WebServer);
        let (pem, _) = make_request("www.test", false);
        store.write(folder, "www.csr", &pem).unwrap();

        let stored = store.list(Folder::CertificateStore).unwrap();
        store.set_read_only(Folder::Issued, true);
        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.exists(folder, "www.csr").unwrap());
        assert_eq!(store.list(Folder::CertificateStore).unwrap(), stored);

        store.set_read_only(Folder::Issued, false);
        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.issued, 1);
        assert!(!store.exists(folder, "www.csr").unwrap());
    }

    #[test]
    fn test_counter_failure_is_fatal() {
        let (mut ctx, store) = root_context();
        let folder = Folder::Requests(Profile::WebServer);
        let (pem, _) = make_request("www.test", false);
        store.write(folder, "www.csr", &pem).unwrap();

        store.set_read_only(Folder::Authority, true);
        let err = issue_pending(&mut ctx).unwrap_err();
        assert!(matches!(err, AuthorityError::Config(_)));
        assert!(store.exists(folder, "www.csr").unwrap());
        assert!(store.list(Folder::Issued).unwrap().is_empty());
    }

    #[test]
    fn test_failed_publish_rolls_back() {
        let (mut ctx, store) = root_context();
        let folder = Folder::Requests(Profile::Intermediate);
        let (pem, _) = make_request("issuing-ca.example", false);
        store.write(folder, "sub.csr", &pem).unwrap();
        let stored = store.list(Folder::CertificateStore).unwrap();

        store.set_read_only(Folder::Publish, true);
        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.exists(folder, "sub.csr").unwrap());
        assert!(store.list(Folder::Issued).unwrap().is_empty());
        assert_eq!(store.list(Folder::CertificateStore).unwrap(), stored);
    }

    #[test]
    fn test_intermediate_with_slash_in_common_name() {
        let (mut ctx, store) = root_context();
        let folder = Folder::Requests(Profile::Intermediate);
        let pem = request_with_subject(&[(Nid::COMMONNAME, "Ops/Sub CA")], None);
        store.write(folder, "ops.csr", &pem).unwrap();

        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.issued, 1);
        assert_eq!(ctx.config().last_issued_serial, 1);
        assert!(store.exists(Folder::Publish, "Ops_Sub CA.cer").unwrap());
        let issued = store.list(Folder::Issued).unwrap();
        assert_eq!(issued.len(), 1);
        assert!(issued[0].name.starts_with("Ops_Sub CA_"));

        // nothing left to retry
        assert_eq!(issue_pending(&mut ctx).unwrap(), IssuanceReport::default());
        assert_eq!(ctx.config().last_issued_serial, 1);
    }

    #[test]
    fn test_request_without_common_name() {
        let (mut ctx, store) = root_context();
        let pem = request_with_subject(&[(Nid::ORGANIZATIONNAME, "Example")], Some("nocn.example"));
        let request = CertificateRequest::parse(&pem, Profile::WebServer).unwrap();
        store.write(Folder::Requests(Profile::WebServer), "nocn.csr", &pem).unwrap();

        let report = issue_pending(&mut ctx).unwrap();
        assert_eq!(report.issued, 1);
        assert_eq!(report.rejected, 0);
        let issued = store.list(Folder::Issued).unwrap();
        assert_eq!(
            issued[0].name,
            format!("_{}.cer", hex::encode(&request.subject_key_id))
        );
    }

    #[test]
    fn test_generic_profile_copies_requested_key_usage() {
        let (mut ctx, store) = root_context();
        let (pem, _) = make_request("sensor.example", true);
        store.write(Folder::Requests(Profile::Generic), "sensor.csr", &pem).unwrap();

        assert_eq!(issue_pending(&mut ctx).unwrap().issued, 1);
        let issued = store.list(Folder::Issued).unwrap();
        let cert = decoded(&issued[0].data);
        let key_usage = KeyUsage::from_der(extension(&cert, "2.5.29.15").unwrap()).unwrap();
        assert!(key_usage.digital_signature());
        assert!(key_usage.key_agreement());
        assert!(!key_usage.key_encipherment());
        assert!(!key_usage.key_cert_sign());
        // unknown purposes are dropped
        assert_eq!(extended_key_usage(&cert), vec![ID_KP_CLIENT_AUTH]);
    }
}
