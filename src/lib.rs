//! tinyca - Minimal-footprint Certificate Authority Library
//!
//! A small, self-contained certificate authority that works from drop
//! folders. Certificate requests and revocation requests are placed in
//! inbox folders; each run issues certificates, imports revocations and
//! publishes an up-to-date CRL.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, 10 years)
//!   ├── Subordinate CA (intermediate profile, pathlen 0, 6 years)
//!   └── Leaf certificates (webserver, server, client, code, ocsp; 1 year)
//! ```
//!
//! An authority consists of:
//! - an encrypted P-384 private key (XChaCha20-Poly1305 under a SHA-256 of
//!   the passphrase),
//! - a JSON configuration with the identity and the serial / CRL counters,
//! - its certificate, the revoked-set and the CRL history.
//!
//! # Features
//!
//! - **Profile-based issuance**: key usage and extended key usage come from
//!   the inbox a request was dropped into
//! - **Crash-safe counters**: serial and CRL numbers are persisted before
//!   any artifact carrying them is written
//! - **Root and subordinate authorities**: a subordinate hands its request to
//!   the parent and adopts the returned certificate
//! - **Pluggable storage**: the engine only talks to [`storage::ArtifactStore`]
//!
//! # Architecture
//!
//! - [`storage`]: artifact store interface, filesystem and in-memory stores
//! - [`private_key_storage`] / [`encryption`]: key custody
//! - [`authority_config`] / [`context`]: authority state for one run
//! - [`issuer`]: certificate issuance from the request inboxes
//! - [`revocation`] / [`crl`]: revoked-set and CRL publishing
//! - [`bootstrap`] / [`health`] / [`runner`]: authority lifecycle
//!
//! # Example Usage
//!
//! ```no_run
//! use tinyca::passphrase::EnvPassphrase;
//! use tinyca::runner::{run, AuthorityKind};
//! use tinyca::storage::FsArtifactStore;
//! use tinyca::AuthorityConfig;
//!
//! fn main() -> tinyca::Result<()> {
//!     let store = FsArtifactStore::from_root("/srv/tinyca");
//!     store.setup_folders()?;
//!
//!     let summary = run(
//!         store,
//!         AuthorityKind::Root,
//!         || Ok(AuthorityConfig::new("Example Root CA", "https://pki.example.com")),
//!         &EnvPassphrase::default(),
//!     )?;
//!     println!("issued {} certificates", summary.issuance.issued);
//!     Ok(())
//! }
//! ```

pub mod authority_config;
pub mod bootstrap;
pub mod certificate_template;
pub mod configs;
pub mod context;
pub mod crl;
pub mod encryption;
pub mod error;
pub mod extensions;
pub mod generate_root_ca;
pub mod health;
pub mod issuer;
pub mod passphrase;
pub mod private_key_storage;
pub mod profiles;
pub mod request;
pub mod revocation;
pub mod runner;
pub mod storage;

pub use authority_config::AuthorityConfig;
pub use context::AuthorityContext;
pub use error::{AuthorityError, Result};
pub use passphrase::{Passphrase, PassphraseProvider};
pub use profiles::Profile;
