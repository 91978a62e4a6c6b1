//! Private Key Storage Module
//!
//! The key custodian owns the authority signing key. The key is a P-384
//! elliptic curve key, DER encoded (SEC1, `EC PRIVATE KEY`) and sealed with
//! XChaCha20-Poly1305 under a key derived from the authority passphrase.
//!
//! # Storage Layout
//!
//! Two sidecar artifacts in the private key folder:
//! - `ca.key`: ciphertext of the DER encoded key
//! - `ca.key.nonce`: the random 24-byte nonce used to seal it
//!
//! Plaintext key material only exists in memory. Replacing a key archives
//! the previous record instead of overwriting it.

use crate::encryption::EncryptedKey;
use crate::error::{AuthorityError, Result};
use crate::passphrase::Passphrase;
use crate::storage::{ArtifactStore, Folder};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const KEY_FILE: &str = "ca.key";
pub const NONCE_FILE: &str = "ca.key.nonce";

/// Generate a fresh P-384 key pair.
pub fn generate_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::SECP384R1)
        .map_err(|e| AuthorityError::crypto("Failed to load P-384 curve", e))?;
    let ec_key =
        EcKey::generate(&group).map_err(|e| AuthorityError::crypto("Failed to generate EC key", e))?;
    PKey::from_ec_key(ec_key).map_err(|e| AuthorityError::crypto("Failed to wrap EC key", e))
}

/// Generate the authority key and persist it encrypted.
///
/// Returns the plaintext key for immediate use by the caller.
pub fn create_key<S: ArtifactStore>(store: &S, passphrase: &Passphrase) -> Result<PKey<Private>> {
    let key = generate_key()?;
    let der = Zeroizing::new(
        key.ec_key()
            .and_then(|ec| ec.private_key_to_der())
            .map_err(|e| AuthorityError::crypto("Failed to encode private key", e))?,
    );
    let sealed = EncryptedKey::seal(&der, passphrase)?;

    store.archive(Folder::PrivateKey, KEY_FILE)?;
    store.archive(Folder::PrivateKey, NONCE_FILE)?;
    store.write(Folder::PrivateKey, NONCE_FILE, &sealed.nonce)?;
    store.write(Folder::PrivateKey, KEY_FILE, &sealed.ciphertext)?;

    info!("Created encrypted authority key in {}", store.describe(Folder::PrivateKey));
    Ok(key)
}

/// Decrypt the persisted authority key.
///
/// Missing artifacts, a wrong passphrase and corrupted ciphertext all fail
/// with [`AuthorityError::KeyAccess`].
pub fn load_key<S: ArtifactStore>(store: &S, passphrase: &Passphrase) -> Result<PKey<Private>> {
    let read = |name: &str| -> Result<Vec<u8>> {
        store
            .read(Folder::PrivateKey, name)
            .map_err(|e| AuthorityError::key_access(&format!("Failed to read {}", name), e))?
            .ok_or_else(|| AuthorityError::KeyAccess(format!("{} not found", name)))
    };
    let sealed = EncryptedKey {
        nonce: read(NONCE_FILE)?,
        ciphertext: read(KEY_FILE)?,
    };

    let der = sealed.open(passphrase)?;
    let ec_key = EcKey::private_key_from_der(&der)
        .map_err(|e| AuthorityError::key_access("Failed to decode private key", e))?;
    let key = PKey::from_ec_key(ec_key)
        .map_err(|e| AuthorityError::key_access("Failed to wrap private key", e))?;
    debug!("Loaded authority key");
    Ok(key)
}
