use crate::error::{AuthorityError, Result};
use crate::passphrase::Passphrase;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Size of the XChaCha20-Poly1305 nonce (192 bits = 24 bytes)
pub const NONCE_SIZE: usize = 24;
/// Size of the derived symmetric key (256 bits = 32 bytes)
pub const KEY_SIZE: usize = 32;

/// Private key ciphertext and the nonce it was sealed with.
pub struct EncryptedKey {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn derive_key(passphrase: &Passphrase) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&Sha256::digest(passphrase.expose()));
    key
}

impl EncryptedKey {
    /// Seal plaintext key material under a fresh random nonce.
    pub fn seal(plaintext: &[u8], passphrase: &Passphrase) -> Result<EncryptedKey> {
        let key = derive_key(passphrase);
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_slice()));

        let mut nonce = [0u8; NONCE_SIZE];
        openssl::rand::rand_bytes(&mut nonce)
            .map_err(|e| AuthorityError::crypto("Failed to generate random nonce", e))?;

        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|e| AuthorityError::crypto("XChaCha20-Poly1305 encryption failed", e))?;

        Ok(EncryptedKey {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt the key material. A wrong passphrase and tampered ciphertext
    /// are indistinguishable and both yield [`AuthorityError::KeyAccess`].
    pub fn open(&self, passphrase: &Passphrase) -> Result<Zeroizing<Vec<u8>>> {
        if self.nonce.len() != NONCE_SIZE {
            return Err(AuthorityError::KeyAccess(format!(
                "nonce must be {} bytes, found {}",
                NONCE_SIZE,
                self.nonce.len()
            )));
        }
        let key = derive_key(passphrase);
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_slice()));
        cipher
            .decrypt(GenericArray::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|e| AuthorityError::key_access("XChaCha20-Poly1305 decryption failed", e))
    }
}
