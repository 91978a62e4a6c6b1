//! Authority Context
//!
//! Per-run state shared by every component: the artifact store, the
//! authority configuration, and lazily loaded key and certificate. A context
//! is the single writer of its counters; every mutating operation takes
//! `&mut self`.

use crate::authority_config::AuthorityConfig;
use crate::error::{AuthorityError, Result};
use crate::extensions;
use crate::passphrase::Passphrase;
use crate::private_key_storage;
use crate::storage::{ArtifactStore, Folder};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::debug;

/// Canonical name of the authority certificate in the certificate store.
pub const CA_CERTIFICATE_FILE: &str = "ca.cer";

pub struct AuthorityContext<S: ArtifactStore> {
    store: S,
    config: AuthorityConfig,
    key: Option<PKey<Private>>,
    certificate: Option<X509>,
}

impl<S: ArtifactStore> AuthorityContext<S> {
    /// Context for an authority whose configuration is already persisted.
    pub fn open(store: S) -> Result<Self> {
        let config = AuthorityConfig::load(&store)?;
        Ok(Self {
            store,
            config,
            key: None,
            certificate: None,
        })
    }

    /// Context for a new authority; persists `config` immediately.
    pub fn create(store: S, config: AuthorityConfig) -> Result<Self> {
        let ctx = Self::unsaved(store, config)?;
        ctx.save_config()?;
        Ok(ctx)
    }

    /// Context for an authority still being set up. Nothing is written until
    /// [`Self::save_config`] or a counter allocation.
    pub(crate) fn unsaved(store: S, config: AuthorityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            key: None,
            certificate: None,
        })
    }

    pub(crate) fn save_config(&self) -> Result<()> {
        self.config.save(&self.store)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Decrypt the authority key. Only the first call touches the store.
    pub fn unlock(&mut self, passphrase: &Passphrase) -> Result<()> {
        if self.key.is_none() {
            self.key = Some(private_key_storage::load_key(&self.store, passphrase)?);
        }
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn set_key(&mut self, key: PKey<Private>) {
        self.key = Some(key);
    }

    pub fn key(&self) -> Result<&PKey<Private>> {
        self.key
            .as_ref()
            .ok_or_else(|| AuthorityError::KeyAccess("authority key is locked".into()))
    }

    /// The authority certificate, loaded from the certificate store on
    /// first use.
    pub fn certificate(&mut self) -> Result<&X509> {
        if self.certificate.is_none() {
            let certificate = self.load_certificate()?.ok_or_else(|| {
                AuthorityError::MissingCertificate(format!(
                    "{} not found in {}",
                    CA_CERTIFICATE_FILE,
                    self.store.describe(Folder::CertificateStore)
                ))
            })?;
            self.certificate = Some(certificate);
        }
        self.certificate
            .as_ref()
            .ok_or_else(|| AuthorityError::MissingCertificate(CA_CERTIFICATE_FILE.into()))
    }

    /// Whether an authority certificate exists, without failing when not.
    pub fn has_certificate(&mut self) -> Result<bool> {
        if self.certificate.is_some() {
            return Ok(true);
        }
        match self.load_certificate()? {
            Some(certificate) => {
                self.certificate = Some(certificate);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn load_certificate(&self) -> Result<Option<X509>> {
        let Some(data) = self.store.read(Folder::CertificateStore, CA_CERTIFICATE_FILE)? else {
            return Ok(None);
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let certificate = X509::from_pem(&data).map_err(|e| {
            AuthorityError::MissingCertificate(format!("Failed to parse {}: {}", CA_CERTIFICATE_FILE, e))
        })?;
        debug!("Loaded authority certificate");
        Ok(Some(certificate))
    }

    /// Store and cache a new authority certificate, archiving the previous one.
    pub fn install_certificate(&mut self, certificate: X509) -> Result<()> {
        let pem = certificate
            .to_pem()
            .map_err(|e| AuthorityError::crypto("Failed to encode authority certificate", e))?;
        self.store.archive(Folder::CertificateStore, CA_CERTIFICATE_FILE)?;
        self.store
            .write(Folder::CertificateStore, CA_CERTIFICATE_FILE, &pem)?;
        self.certificate = Some(certificate);
        Ok(())
    }

    /// Subject key identifier of the authority certificate.
    pub fn ca_key_id(&mut self) -> Result<Vec<u8>> {
        let certificate = self.certificate()?;
        if let Some(ski) = certificate.subject_key_id() {
            return Ok(ski.as_slice().to_vec());
        }
        let spki = certificate
            .public_key()
            .and_then(|key| key.public_key_to_der())
            .map_err(|e| AuthorityError::crypto("Failed to encode authority public key", e))?;
        Ok(extensions::key_identifier(&spki))
    }

    /// Allocate the next serial number. The counter is persisted before the
    /// value is handed out.
    pub fn next_serial(&mut self) -> Result<u128> {
        let next = self
            .config
            .last_issued_serial
            .checked_add(1)
            .ok_or_else(|| AuthorityError::Config("serial number space exhausted".into()))?;
        let mut updated = self.config.clone();
        updated.last_issued_serial = next;
        updated.save(&self.store)?;
        self.config = updated;
        debug!("Allocated serial {}", next);
        Ok(next)
    }

    /// Allocate the next CRL number, persisted like [`Self::next_serial`].
    pub fn next_crl_number(&mut self) -> Result<u128> {
        let next = self
            .config
            .last_crl_number
            .checked_add(1)
            .ok_or_else(|| AuthorityError::Config("CRL number space exhausted".into()))?;
        let mut updated = self.config.clone();
        updated.last_crl_number = next;
        updated.save(&self.store)?;
        self.config = updated;
        debug!("Allocated CRL number {}", next);
        Ok(next)
    }
}
