//! Key material helpers: AES-256-GCM decryption for `enc:`-prefixed
//! passthrough provider keys, and one-time plaintext gateway key generation.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::ports::Encryption;

const NONCE_LEN: usize = 12;

pub struct MasterKeyCrypto {
    cipher: Aes256Gcm,
}

impl MasterKeyCrypto {
    /// `master_key_hex` must be 64 hex chars (32 bytes).
    pub fn new(master_key_hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(master_key_hex)
            .map_err(|_| anyhow::anyhow!("master key must be hex"))?;
        if bytes.len() != 32 {
            anyhow::bail!("master key must be 32 bytes (64 hex chars)");
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(MasterKeyCrypto { cipher: Aes256Gcm::new(key) })
    }

    /// base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> anyhow::Result<String> {
        let blob = B64
            .decode(encoded)
            .map_err(|_| anyhow::anyhow!("invalid base64 ciphertext"))?;
        if blob.len() <= NONCE_LEN {
            anyhow::bail!("ciphertext too short");
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("decryption failed"))?;
        String::from_utf8(plaintext).map_err(|_| anyhow::anyhow!("decrypted key is not utf-8"))
    }
}

#[async_trait]
impl Encryption for MasterKeyCrypto {
    async fn decrypt_api_key(&self, ciphertext: &str) -> anyhow::Result<String> {
        self.decrypt(ciphertext)
    }
}

/// Generate an opaque gateway key: `gw_` + 40 alphanumerics. The plaintext
/// is returned once at credential creation; only its SHA-256 hash persists.
pub fn generate_gateway_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    format!("gw_{}", suffix)
}
