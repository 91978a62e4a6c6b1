//! Authority run
//!
//! One batch run of an authority, from an empty store to a drained queue:
//!
//! ```text
//! not configured ─ root ──────► setup_root ─► issue ─► revoke
//!                └ subordinate ► setup_sub (stop, await parent certificate)
//! configured ───► unlock ─► [activate_sub] ─► health ─► issue ─► revoke
//! ```
//!
//! The passphrase is requested from the provider at most once and dropped
//! as soon as the key is available.

use crate::authority_config::AuthorityConfig;
use crate::bootstrap;
use crate::context::AuthorityContext;
use crate::error::Result;
use crate::health::{self, HealthReport};
use crate::issuer::{self, IssuanceReport};
use crate::passphrase::PassphraseProvider;
use crate::revocation;
use crate::storage::ArtifactStore;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityKind {
    Root,
    Subordinate,
}

impl fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityKind::Root => f.write_str("root"),
            AuthorityKind::Subordinate => f.write_str("sub"),
        }
    }
}

/// What a run did.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// The authority was bootstrapped during this run.
    pub created: bool,
    /// A subordinate is waiting for its parent-issued certificate.
    pub awaiting_certificate: bool,
    pub health: Option<HealthReport>,
    pub issuance: IssuanceReport,
    /// Revocations imported by the health check and after issuance.
    pub revoked: usize,
}

/// Run an authority over `store`.
///
/// `setup` supplies the identity of a new authority and is only called when
/// the store holds no configuration yet.
pub fn run<S, F>(
    store: S,
    kind: AuthorityKind,
    setup: F,
    passphrases: &dyn PassphraseProvider,
) -> Result<RunSummary>
where
    S: ArtifactStore,
    F: FnOnce() -> Result<AuthorityConfig>,
{
    let mut summary = RunSummary::default();

    let mut ctx = if bootstrap::is_configured(&store)? {
        let mut ctx = AuthorityContext::open(store)?;
        let passphrase = passphrases.passphrase()?;
        ctx.unlock(&passphrase)?;
        drop(passphrase);

        if kind == AuthorityKind::Subordinate {
            bootstrap::activate_sub(&mut ctx)?;
        }
        let report = health::verify_authority(&mut ctx)?;
        summary.revoked = report.imported_revocations;
        summary.health = Some(report);
        ctx
    } else {
        info!("No {} authority configured, starting setup", kind);
        let config = setup()?;
        let passphrase = passphrases.passphrase()?;
        summary.created = true;
        match kind {
            AuthorityKind::Root => bootstrap::setup_root(store, config, &passphrase)?,
            AuthorityKind::Subordinate => {
                bootstrap::setup_sub(store, config, &passphrase)?;
                summary.awaiting_certificate = true;
                return Ok(summary);
            }
        }
    };

    summary.issuance = issuer::issue_pending(&mut ctx)?;
    summary.revoked += revocation::revoke_pending(&mut ctx)?;
    Ok(summary)
}
