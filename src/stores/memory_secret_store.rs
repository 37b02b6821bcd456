use crate::errors::ForgeError;
use crate::services::vault::SecretBackend;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct MemorySecretStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn load(&self, entries: BTreeMap<String, String>) {
        let mut guard = self.entries.write().unwrap_or_else(|err| err.into_inner());
        *guard = entries;
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl SecretBackend for MemorySecretStore {
    fn set(&self, key: &str, value: &str) -> Result<(), ForgeError> {
        let mut guard = self
            .entries
            .write()
            .map_err(|_| ForgeError::vault_write("Secret store lock poisoned"))?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, ForgeError> {
        let guard = self
            .entries
            .read()
            .map_err(|_| ForgeError::internal("Secret store lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, ForgeError> {
        let mut guard = self
            .entries
            .write()
            .map_err(|_| ForgeError::vault_write("Secret store lock poisoned"))?;
        Ok(guard.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, ForgeError> {
        let guard = self
            .entries
            .read()
            .map_err(|_| ForgeError::internal("Secret store lock poisoned"))?;
        Ok(guard.keys().cloned().collect())
    }
}
