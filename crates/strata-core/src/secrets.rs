//! Agent-local encryption of connection-string passwords.
//!
//! The control plane never sees the key: it asks the agent to `Encrypt` a password once,
//! stores the ciphertext in the task settings, and the agent decrypts it at backup time.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use secrecy::{ExposeSecret, SecretBox, SecretString};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    Io(String),
}

/// ChaCha20-Poly1305 cipher holding the agent's key.
pub struct Cipher {
    key: SecretBox<[u8; KEY_LEN]>,
}

impl Cipher {
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// A cipher with a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
        Self::from_key(key)
    }

    /// Load the key file, creating it (mode 0600 on unix) when missing.
    pub fn load_or_create(path: &Path) -> Result<Self, SecretError> {
        if path.exists() {
            let encoded =
                std::fs::read_to_string(path).map_err(|e| SecretError::Io(e.to_string()))?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|_| SecretError::InvalidEncoding)?;
            let key: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| SecretError::InvalidKeyLength)?;
            return Ok(Self::from_key(key));
        }

        let cipher = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SecretError::Io(e.to_string()))?;
        }
        let encoded = STANDARD.encode(cipher.key.expose_secret());
        std::fs::write(path, encoded).map_err(|e| SecretError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SecretError::Io(e.to_string()))?;
        }

        Ok(cipher)
    }

    /// Returns base64 of nonce followed by ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = ChaCha20Poly1305::new(self.key.expose_secret().into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<SecretString, SecretError> {
        let combined = STANDARD
            .decode(encoded.trim())
            .map_err(|_| SecretError::InvalidEncoding)?;
        if combined.len() < NONCE_LEN {
            return Err(SecretError::InvalidEncoding);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(self.key.expose_secret().into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| SecretError::InvalidUtf8)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher([REDACTED])")
    }
}
