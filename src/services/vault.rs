use crate::constants::limits::{MIN_API_KEY_LENGTH, MIN_SECRET_LENGTH};
use crate::constants::vault::{KEY_PREFIX, REDACTED};
use crate::errors::{ErrorKind, ForgeError};
use crate::services::logger::Logger;
use crate::services::request::AuthScheme;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};

static API_KEY_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("api key regex"));

pub trait SecretBackend: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), ForgeError>;
    fn get(&self, key: &str) -> Result<Option<String>, ForgeError>;
    fn delete(&self, key: &str) -> Result<bool, ForgeError>;
    fn keys(&self) -> Result<Vec<String>, ForgeError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub service: String,
    pub secret: Secret,
    pub metadata: CredentialMetadata,
}

impl Credential {
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.secret.expose().as_bytes());
        hex::encode(&digest[..6])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialCheck {
    Valid,
    Invalid(String),
}

impl CredentialCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, CredentialCheck::Valid)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    secret: String,
    #[serde(default)]
    metadata: CredentialMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialListing {
    pub service: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct CredentialVault {
    logger: Logger,
    backend: Arc<dyn SecretBackend>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialVault {
    pub fn new(logger: Logger, backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            logger: logger.child("vault"),
            backend,
            locks: DashMap::new(),
        }
    }

    fn normalize_service(service: &str) -> Result<String, ForgeError> {
        let trimmed = service.trim().to_lowercase();
        if trimmed.is_empty() {
            return Err(ForgeError::invalid_params("service must be a non-empty string"));
        }
        if trimmed.contains('\0') || trimmed.contains(':') {
            return Err(ForgeError::invalid_params(
                "service must not contain ':' or null bytes",
            ));
        }
        Ok(trimmed)
    }

    fn backend_key(service: &str) -> String {
        format!("{}:{}", KEY_PREFIX, service)
    }

    fn service_lock(&self, service: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn store(
        &self,
        service: &str,
        secret: &str,
        metadata: Option<CredentialMetadata>,
    ) -> Result<(), ForgeError> {
        let service = Self::normalize_service(service)?;
        if secret.trim().is_empty() {
            return Err(ForgeError::invalid_params("secret must be a non-empty string"));
        }
        self.logger.secrets().register(secret);

        let mut metadata = metadata.unwrap_or_default();
        metadata.stored_at = Some(Utc::now());
        let entry = StoredEntry {
            secret: secret.to_string(),
            metadata,
        };
        let payload = serde_json::to_string(&entry)
            .map_err(|err| ForgeError::vault_write(format!("Failed to encode credential: {}", err)))?;

        let lock = self.service_lock(&service);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        self.backend
            .set(&Self::backend_key(&service), &payload)
            .map_err(|err| {
                let err = if err.kind == ErrorKind::VaultWrite {
                    err
                } else {
                    ForgeError::vault_write(err.message).with_hint(
                        "Check that the secret store is reachable and writable.",
                    )
                };
                self.logger.error(
                    "Credential write failed",
                    Some(&serde_json::json!({"service": service, "error": err.message})),
                );
                err
            })?;
        self.logger
            .info("Credential stored", Some(&serde_json::json!({"service": service})));
        Ok(())
    }

    pub fn retrieve(&self, service: &str) -> Result<Option<Credential>, ForgeError> {
        let service = Self::normalize_service(service)?;
        let lock = self.service_lock(&service);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        let Some(raw) = self.backend.get(&Self::backend_key(&service))? else {
            self.logger
                .debug("Credential not found", Some(&serde_json::json!({"service": service})));
            return Ok(None);
        };
        let entry: StoredEntry = serde_json::from_str(&raw).unwrap_or(StoredEntry {
            secret: raw,
            metadata: CredentialMetadata::default(),
        });
        self.logger.secrets().register(&entry.secret);
        Ok(Some(Credential {
            service,
            secret: Secret::new(entry.secret),
            metadata: entry.metadata,
        }))
    }

    pub fn validate(&self, credential: &Credential, scheme: &AuthScheme) -> CredentialCheck {
        let secret = credential.secret.expose();
        if secret.trim().is_empty() {
            return CredentialCheck::Invalid("secret is empty".to_string());
        }
        if secret.len() < MIN_SECRET_LENGTH {
            return CredentialCheck::Invalid(format!(
                "secret is too short (minimum {} characters)",
                MIN_SECRET_LENGTH
            ));
        }
        if secret.chars().any(char::is_whitespace) {
            return CredentialCheck::Invalid("secret contains whitespace".to_string());
        }
        if let Some(expires_at) = credential.metadata.expires_at {
            if expires_at <= Utc::now() {
                return CredentialCheck::Invalid(format!("credential expired at {}", expires_at));
            }
        }
        match scheme {
            AuthScheme::Header { .. } | AuthScheme::Query { .. } => {
                if secret.len() < MIN_API_KEY_LENGTH {
                    return CredentialCheck::Invalid(format!(
                        "API key too short (minimum {} characters)",
                        MIN_API_KEY_LENGTH
                    ));
                }
                if !API_KEY_SHAPE.is_match(secret) {
                    return CredentialCheck::Invalid(
                        "API key contains invalid characters".to_string(),
                    );
                }
            }
            AuthScheme::Basic => {
                let valid = secret
                    .split_once(':')
                    .map(|(user, password)| !user.is_empty() && !password.is_empty())
                    .unwrap_or(false);
                if !valid {
                    return CredentialCheck::Invalid(
                        "basic credentials must look like user:password".to_string(),
                    );
                }
            }
            AuthScheme::Bearer => {}
        }
        CredentialCheck::Valid
    }

    pub fn delete(&self, service: &str) -> Result<bool, ForgeError> {
        let service = Self::normalize_service(service)?;
        let lock = self.service_lock(&service);
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        let removed = self.backend.delete(&Self::backend_key(&service))?;
        self.logger.info(
            "Credential deleted",
            Some(&serde_json::json!({"service": service, "removed": removed})),
        );
        Ok(removed)
    }

    pub fn list_services(&self) -> Result<Vec<String>, ForgeError> {
        let prefix = format!("{}:", KEY_PREFIX);
        let mut services: Vec<String> = self
            .backend
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect();
        services.sort();
        Ok(services)
    }

    pub fn describe(&self) -> Result<Vec<CredentialListing>, ForgeError> {
        let mut out = Vec::new();
        for service in self.list_services()? {
            if let Some(credential) = self.retrieve(&service)? {
                out.push(CredentialListing {
                    fingerprint: credential.fingerprint(),
                    scope: credential.metadata.scope.clone(),
                    expires_at: credential.metadata.expires_at,
                    service,
                });
            }
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<usize, ForgeError> {
        let services = self.list_services()?;
        let mut removed = 0;
        for service in services {
            if self.delete(&service)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
