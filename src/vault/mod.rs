/// Credential vault
///
/// Seals provider secrets at rest with AES-256-GCM. Each user gets their own
/// key, derived as SHA-256(master secret ":" user id), so a leaked row never
/// exposes key material usable for another user. Every seal uses a fresh
/// random 96-bit nonce; the GCM tag travels appended to the ciphertext.
use crate::db::models::SealedSecret;
use crate::error::{CalError, CalResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

pub struct CredentialVault {
    master_secret: Vec<u8>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("master_secret", &"[REDACTED]")
            .finish()
    }
}

impl CredentialVault {
    pub fn new(master_secret: &str) -> Self {
        Self {
            master_secret: master_secret.as_bytes().to_vec(),
        }
    }

    fn cipher_for(&self, user_id: &str) -> CalResult<Aes256Gcm> {
        let mut hasher = Sha256::new();
        hasher.update(&self.master_secret);
        hasher.update(b":");
        hasher.update(user_id.as_bytes());
        let key = hasher.finalize();

        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CalError::Internal(format!("Failed to initialize cipher: {}", e)))
    }

    /// Encrypt `plaintext` under the key of `user_id`.
    pub fn encrypt(&self, plaintext: &str, user_id: &str) -> CalResult<SealedSecret> {
        let cipher = self.cipher_for(user_id)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CalError::Internal(format!("Encryption failed: {}", e)))?;

        Ok(SealedSecret {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(nonce_bytes),
        })
    }

    /// Decrypt and authenticate a sealed secret.
    ///
    /// Any failure, including a tag mismatch, means the credential cannot be
    /// trusted and is reported as [`CalError::ReauthorizationRequired`].
    pub fn decrypt(&self, sealed: &SealedSecret, user_id: &str) -> CalResult<String> {
        let unusable = |reason: &str| {
            CalError::ReauthorizationRequired(format!("stored credential unusable: {}", reason))
        };

        let nonce_bytes = BASE64
            .decode(&sealed.iv)
            .map_err(|_| unusable("invalid nonce encoding"))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(unusable("invalid nonce length"));
        }
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|_| unusable("invalid ciphertext encoding"))?;

        let cipher = self.cipher_for(user_id)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| unusable("integrity check failed"))?;

        String::from_utf8(plaintext).map_err(|_| unusable("plaintext is not UTF-8"))
    }
}
