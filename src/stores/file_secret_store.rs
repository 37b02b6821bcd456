use crate::constants::vault::FILE_MODE;
use crate::errors::ForgeError;
use crate::services::security::VaultCipher;
use crate::services::vault::SecretBackend;
use crate::stores::memory_secret_store::MemorySecretStore;
use rand::{distributions::Alphanumeric, Rng};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct FileSecretStore {
    inner: MemorySecretStore,
    cipher: VaultCipher,
    file_path: PathBuf,
    queue: Arc<Mutex<()>>,
}

impl FileSecretStore {
    pub fn open(file_path: PathBuf, cipher: VaultCipher) -> Result<Self, ForgeError> {
        let store = Self {
            inner: MemorySecretStore::new(),
            cipher,
            file_path,
            queue: Arc::new(Mutex::new(())),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    fn load_from_disk(&self) -> Result<(), ForgeError> {
        if !self.file_path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&self.file_path)
            .map_err(|err| ForgeError::internal(format!("Failed to load vault: {}", err)))?;
        if raw.trim().is_empty() {
            return Ok(());
        }
        let parsed: BTreeMap<String, String> = serde_json::from_str(&raw).map_err(|err| {
            ForgeError::internal(format!("Failed to parse vault: {}", err))
                .with_details(serde_json::json!({"path": self.file_path}))
        })?;
        self.inner.load(parsed);
        Ok(())
    }

    fn persist(&self) -> Result<(), ForgeError> {
        let payload = serde_json::to_string_pretty(&self.inner.snapshot())
            .map_err(|err| ForgeError::vault_write(format!("Failed to serialize vault: {}", err)))?;
        write_private_file(&self.file_path, &format!("{}\n", payload)).map_err(|err| {
            ForgeError::vault_write(format!("Failed to persist vault: {}", err))
                .with_details(serde_json::json!({"path": self.file_path}))
        })
    }
}

impl SecretBackend for FileSecretStore {
    fn set(&self, key: &str, value: &str) -> Result<(), ForgeError> {
        let sealed = self.cipher.encrypt(value)?;
        let _guard = self.queue.lock().unwrap_or_else(|err| err.into_inner());
        let previous = self.inner.get(key)?;
        self.inner.set(key, &sealed)?;
        if let Err(err) = self.persist() {
            // Keep memory and disk in agreement when the write fails.
            match previous {
                Some(old) => self.inner.set(key, &old)?,
                None => {
                    self.inner.delete(key)?;
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, ForgeError> {
        match self.inner.get(key)? {
            Some(sealed) => self.cipher.decrypt(&sealed).map(Some),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, ForgeError> {
        let _guard = self.queue.lock().unwrap_or_else(|err| err.into_inner());
        let Some(previous) = self.inner.get(key)? else {
            return Ok(false);
        };
        self.inner.delete(key)?;
        if let Err(err) = self.persist() {
            self.inner.set(key, &previous)?;
            return Err(err);
        }
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>, ForgeError> {
        self.inner.keys()
    }
}

fn write_private_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("vault");
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, token));
    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(FILE_MODE))?;
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)
}
