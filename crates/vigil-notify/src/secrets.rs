//! Encryption of integration secure settings.
//!
//! Secure settings are stored as `base64(nonce || ciphertext || tag)` using
//! ChaCha20-Poly1305. Each integration gets its own key, derived with BLAKE3
//! from the service key and the integration UID.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AlertmanagerConfig;
use crate::error::{NotifyError, Result};

/// Size of the encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

const SERVICE_CONTEXT: &str = "vigil 2024 integration secure settings";

/// Encrypts and decrypts integration secrets. The key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretsService {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SecretsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsService")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SecretsService {
    /// Derives the service key from a master secret of any length.
    #[must_use]
    pub fn new(master: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(SERVICE_CONTEXT, master),
        }
    }

    fn key_for(&self, uid: &str) -> [u8; KEY_SIZE] {
        blake3::derive_key(&format!("{SERVICE_CONTEXT} {uid}"), &self.key)
    }

    /// Encrypts one value for the integration `uid`.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Secret` if the cipher fails.
    pub fn encrypt(&self, uid: &str, plaintext: &str) -> Result<String> {
        let mut key = self.key_for(uid);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|e| NotifyError::Secret {
            reason: format!("failed to create cipher: {e}"),
        });
        key.zeroize();
        let cipher = cipher?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| NotifyError::Secret {
                reason: format!("encryption failed: {e}"),
            })?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(output))
    }

    /// Decrypts a value produced by [`SecretsService::encrypt`] for the same UID.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Secret` if the value is malformed, was encrypted
    /// for another integration, or was tampered with.
    pub fn decrypt(&self, uid: &str, encoded: &str) -> Result<String> {
        let data = STANDARD.decode(encoded).map_err(|e| NotifyError::Secret {
            reason: format!("invalid base64: {e}"),
        })?;
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(NotifyError::Secret {
                reason: format!(
                    "ciphertext too short: expected at least {} bytes, got {}",
                    NONCE_SIZE + TAG_SIZE,
                    data.len()
                ),
            });
        }

        let mut key = self.key_for(uid);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|e| NotifyError::Secret {
            reason: format!("failed to create cipher: {e}"),
        });
        key.zeroize();
        let plaintext = cipher?
            .decrypt(Nonce::from_slice(&data[..NONCE_SIZE]), &data[NONCE_SIZE..])
            .map_err(|e| NotifyError::Secret {
                reason: format!("decryption failed: {e}"),
            })?;
        String::from_utf8(plaintext).map_err(|e| NotifyError::Secret {
            reason: format!("secret is not valid UTF-8: {e}"),
        })
    }

    /// Encrypts every secure setting of every integration in place.
    ///
    /// Integrations must already have UIDs.
    ///
    /// # Errors
    ///
    /// Returns the first encryption failure.
    pub fn encrypt_config(&self, config: &mut AlertmanagerConfig) -> Result<()> {
        for integration in config.integrations_mut() {
            for value in integration.secure_settings.values_mut() {
                *value = self.encrypt(&integration.uid, value)?;
            }
        }
        Ok(())
    }

    /// Decrypts every secure setting of every integration in place.
    ///
    /// # Errors
    ///
    /// Returns the first decryption failure.
    pub fn decrypt_config(&self, config: &mut AlertmanagerConfig) -> Result<()> {
        for integration in config.integrations_mut() {
            for value in integration.secure_settings.values_mut() {
                *value = self.decrypt(&integration.uid, value)?;
            }
        }
        Ok(())
    }
}
