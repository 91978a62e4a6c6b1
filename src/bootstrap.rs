//! Authority Bootstrap
//!
//! One-time creation of a root or subordinate authority, and activation of a
//! subordinate once its parent-issued certificate arrives.
//!
//! # Subordinate hand-off
//! ```text
//! setup_sub      → <work>/requests/ca/<name>.csr     (to the parent)
//! parent issues  → <work>/certificates/ca/*.cer      (back to us)
//! activate_sub   → ca.cer, published <name>.cer
//! ```
//!
//! Adoption of an incoming certificate is a structural match of its public
//! key (curve and affine coordinates) against the authority key. It is not
//! an authentication step; trust comes from the certificate having been
//! placed in the authority's own inbox.

use crate::authority_config::{AuthorityConfig, CONFIG_FILE};
use crate::context::AuthorityContext;
use crate::error::{AuthorityError, Result};
use crate::generate_root_ca::EcRootCABuilder;
use crate::passphrase::Passphrase;
use crate::private_key_storage;
use crate::request::{self, sanitize_file_name};
use crate::revocation;
use crate::storage::{ArtifactStore, Folder};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroupRef, EcKeyRef, EcPointRef};
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::x509::X509;
use tracing::{debug, error, info, warn};

/// Whether the store already holds an authority configuration.
pub fn is_configured<S: ArtifactStore>(store: &S) -> Result<bool> {
    store.exists(Folder::Authority, CONFIG_FILE)
}

fn fresh(mut config: AuthorityConfig) -> Result<AuthorityConfig> {
    config.validate()?;
    config.last_issued_serial = 0;
    config.last_crl_number = 0;
    Ok(config)
}

/// Archival name of an authority certificate: `<CN>_<hexSKI>.cer`.
fn archival_name<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<String> {
    let key_id = ctx.ca_key_id()?;
    Ok(format!(
        "{}_{}.cer",
        sanitize_file_name(&ctx.config().common_name),
        hex::encode(key_id)
    ))
}

/// Publish the authority certificate as `<name>.cer` and keep an archival copy.
fn store_and_publish<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<()> {
    let pem = ctx
        .certificate()?
        .to_pem()
        .map_err(|e| AuthorityError::crypto("Failed to encode authority certificate", e))?;
    let archival = archival_name(ctx)?;
    ctx.store().write(Folder::CertificateStore, &archival, &pem)?;
    ctx.store().publish(&ctx.config().certificate_file_name(), &pem)?;
    Ok(())
}

/// Remove the configuration of a partial setup; the next run sets up again.
fn abandon_setup<S: ArtifactStore>(ctx: &AuthorityContext<S>, e: AuthorityError) -> AuthorityError {
    if let Err(cleanup) = ctx.store().delete(Folder::Authority, CONFIG_FILE) {
        warn!("Failed to remove {} after failed setup: {}", CONFIG_FILE, cleanup);
    }
    error!("Setup of {} failed: {}", ctx.config().common_name, e);
    e
}

fn finish_root<S: ArtifactStore>(ctx: &mut AuthorityContext<S>, certificate: X509) -> Result<()> {
    ctx.install_certificate(certificate)?;
    store_and_publish(ctx)?;
    revocation::regenerate_crl(ctx)?;
    ctx.save_config()
}

/// Create a self-signed root authority and its first CRL.
pub fn setup_root<S: ArtifactStore>(
    store: S,
    config: AuthorityConfig,
    passphrase: &Passphrase,
) -> Result<AuthorityContext<S>> {
    let config = fresh(config)?;
    let key = private_key_storage::create_key(&store, passphrase)?;
    let certificate = EcRootCABuilder::from_config(&config).build(&key)?;

    // config.json marks the authority as configured, so it is written last
    let mut ctx = AuthorityContext::unsaved(store, config)?;
    ctx.set_key(key);
    finish_root(&mut ctx, certificate).map_err(|e| abandon_setup(&ctx, e))?;

    info!("Root authority {} created", ctx.config().common_name);
    Ok(ctx)
}

/// Create a subordinate authority key and the request for its parent.
///
/// The authority has no certificate until [`activate_sub`] adopts one.
pub fn setup_sub<S: ArtifactStore>(
    store: S,
    config: AuthorityConfig,
    passphrase: &Passphrase,
) -> Result<AuthorityContext<S>> {
    let config = fresh(config)?;
    let key = private_key_storage::create_key(&store, passphrase)?;
    let csr = request::create_sub_ca_request(&config, &key)?;

    let mut ctx = AuthorityContext::unsaved(store, config)?;
    let request_name = format!("{}.csr", sanitize_file_name(&ctx.config().common_name));
    ctx.store().write(Folder::CaRequestOut, &request_name, &csr)?;
    ctx.save_config()?;
    ctx.set_key(key);

    info!(
        "IMPORTANT: Request created at {}/{}. Place the issued certificate in {}",
        ctx.store().describe(Folder::CaRequestOut),
        request_name,
        ctx.store().describe(Folder::CaCertificateIn)
    );
    Ok(ctx)
}

fn coordinates(point: &EcPointRef, group: &EcGroupRef, bn_ctx: &mut BigNumContext) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut x = BigNum::new().map_err(|e| AuthorityError::crypto("Failed to allocate coordinate", e))?;
    let mut y = BigNum::new().map_err(|e| AuthorityError::crypto("Failed to allocate coordinate", e))?;
    point
        .affine_coordinates_gfp(group, &mut x, &mut y, bn_ctx)
        .map_err(|e| AuthorityError::crypto("Failed to read public key coordinates", e))?;
    Ok((x.to_vec(), y.to_vec()))
}

fn ec_public_matches<T: HasPublic>(candidate: &EcKeyRef<T>, own: &EcKeyRef<Private>) -> Result<bool> {
    let curve = own.group().curve_name();
    if curve.is_none() || candidate.group().curve_name() != curve {
        return Ok(false);
    }
    let mut bn_ctx =
        BigNumContext::new().map_err(|e| AuthorityError::crypto("Failed to create BN context", e))?;
    let theirs = coordinates(candidate.public_key(), own.group(), &mut bn_ctx)?;
    let ours = coordinates(own.public_key(), own.group(), &mut bn_ctx)?;
    Ok(theirs == ours)
}

/// Whether `certificate` certifies the public half of `key`.
pub fn certifies_key(certificate: &X509, key: &PKeyRef<Private>) -> Result<bool> {
    let Ok(candidate) = certificate.public_key().and_then(|pk| pk.ec_key()) else {
        return Ok(false);
    };
    let own = key
        .ec_key()
        .map_err(|e| AuthorityError::key_access("Authority key is not an EC key", e))?;
    ec_public_matches(&candidate, &own)
}

/// Adopt the parent-issued certificate for a subordinate authority.
///
/// Does nothing when a certificate is already installed. Fails with
/// [`AuthorityError::MissingCertificate`] when no certificate in the inbox
/// matches the authority key; non-matching candidates stay in the inbox.
pub fn activate_sub<S: ArtifactStore>(ctx: &mut AuthorityContext<S>) -> Result<()> {
    if ctx.has_certificate()? {
        return Ok(());
    }

    let candidates = ctx.store().list(Folder::CaCertificateIn)?;
    let mut adopted = None;
    for artifact in candidates {
        let certificate = match X509::from_pem(&artifact.data).or_else(|_| X509::from_der(&artifact.data)) {
            Ok(certificate) => certificate,
            Err(e) => {
                debug!("Skipped {}: {}", artifact.name, e);
                continue;
            }
        };
        if certifies_key(&certificate, ctx.key()?)? {
            debug!("Matching certificate found in {}", artifact.name);
            adopted = Some((artifact.name, certificate));
            break;
        }
        warn!("Found certificate {} but public key does not match", artifact.name);
    }

    let Some((name, certificate)) = adopted else {
        return Err(AuthorityError::MissingCertificate(format!(
            "no certificate matching the authority key in {}",
            ctx.store().describe(Folder::CaCertificateIn)
        )));
    };

    ctx.install_certificate(certificate)?;
    store_and_publish(ctx)?;
    ctx.store().delete(Folder::CaCertificateIn, &name)?;
    info!("Subordinate authority {} activated", ctx.config().common_name);
    Ok(())
}
