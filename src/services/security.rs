use crate::constants::crypto::{IV_SIZE, KEY_SIZE, TAG_SIZE};
use crate::constants::vault::FILE_MODE;
use crate::errors::ForgeError;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;

fn decode_key(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.len() == KEY_SIZE * 2 {
        return hex::decode(trimmed).ok();
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(trimmed.as_bytes())
        .ok()?;
    if decoded.len() == KEY_SIZE {
        Some(decoded)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct VaultCipher {
    cipher: Aes256Gcm,
}

impl VaultCipher {
    pub fn load_or_create(key_path: &Path) -> Result<Self, ForgeError> {
        let key = Self::load_or_create_key(key_path)?;
        Ok(Self::from_key(&key))
    }

    pub fn ephemeral() -> Self {
        let mut key = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self::from_key(&key)
    }

    fn from_key(key: &[u8]) -> Self {
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    fn load_or_create_key(path: &Path) -> Result<Vec<u8>, ForgeError> {
        if let Ok(raw) = std::env::var("APIFORGE_VAULT_KEY") {
            return decode_key(&raw).ok_or_else(|| {
                ForgeError::invalid_params("APIFORGE_VAULT_KEY is not a 32-byte key")
                    .with_hint("Use 64 hex characters or base64 of 32 bytes.")
            });
        }

        if path.exists() {
            let stored = fs::read_to_string(path).map_err(|err| {
                ForgeError::internal(format!("Failed to read vault key: {}", err))
            })?;
            return decode_key(&stored).ok_or_else(|| {
                ForgeError::internal("Vault key file is corrupt")
                    .with_details(serde_json::json!({"path": path}))
            });
        }

        let mut generated = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut generated);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                ForgeError::vault_write(format!("Failed to create vault directory: {}", err))
            })?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|err| ForgeError::vault_write(format!("Failed to create vault key: {}", err)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(fs::Permissions::from_mode(FILE_MODE));
        }
        file.write_all(hex::encode(&generated).as_bytes())
            .map_err(|err| ForgeError::vault_write(format!("Failed to write vault key: {}", err)))?;
        Ok(generated)
    }

    pub fn encrypt(&self, text: &str) -> Result<String, ForgeError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let nonce = aes_gcm::Nonce::from_slice(&iv);
        let mut ciphertext = self
            .cipher
            .encrypt(nonce, text.as_bytes())
            .map_err(|_| ForgeError::vault_write("Failed to encrypt secret payload"))?;
        if ciphertext.len() < TAG_SIZE {
            return Err(ForgeError::vault_write("Failed to encrypt secret payload"));
        }
        let tag = ciphertext.split_off(ciphertext.len() - TAG_SIZE);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, payload: &str) -> Result<String, ForgeError> {
        let parts: Vec<&str> = payload.split(':').collect();
        if parts.len() != 3 {
            return Err(ForgeError::internal("Invalid encrypted payload format")
                .with_hint("Expected \"<iv_hex>:<tag_hex>:<data_hex>\"."));
        }
        let decode = |part: &str| {
            hex::decode(part).map_err(|_| ForgeError::internal("Invalid encrypted payload format"))
        };
        let iv = decode(parts[0])?;
        let tag = decode(parts[1])?;
        let data = decode(parts[2])?;
        if iv.len() != IV_SIZE || tag.len() != TAG_SIZE {
            return Err(ForgeError::internal("Invalid encrypted payload format"));
        }
        let mut combined = Vec::with_capacity(data.len() + tag.len());
        combined.extend_from_slice(&data);
        combined.extend_from_slice(&tag);
        let nonce = aes_gcm::Nonce::from_slice(&iv);
        let decrypted = self.cipher.decrypt(nonce, combined.as_ref()).map_err(|_| {
            ForgeError::internal("Failed to decrypt vault entry").with_hint(
                "APIFORGE_VAULT_KEY (or vault.key) must match the key used when the secret was stored.",
            )
        })?;
        String::from_utf8(decrypted)
            .map_err(|_| ForgeError::internal("Decrypted vault entry is not UTF-8"))
    }
}
