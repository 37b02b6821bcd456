use crate::constants::vault::REDACTED;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

const MIN_INLINE_SECRET_LEN: usize = 4;

static SENSITIVE_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password",
        "passphrase",
        "secret",
        "token",
        "api_key",
        "apikey",
        "appid",
        "access_token",
        "auth_token",
        "client_secret",
        "refresh_token",
        "authorization",
        "key",
    ]
    .into_iter()
    .collect()
});

static SENSITIVE_HEADER_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "authorization",
        "proxy-authorization",
        "x-api-key",
        "x-auth-token",
        "x-access-token",
    ]
    .into_iter()
    .collect()
});

static INLINE_REDACTION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"\bsk-[A-Za-z0-9_-]{10,}\b").expect("inline redaction regex"),
            "sk-***",
        ),
        (
            Regex::new(r"\b(Bearer|Basic)\s+([A-Za-z0-9._~+/=-]{8,})").expect("inline redaction regex"),
            "$1 ***",
        ),
        (
            Regex::new(r#"\b(password|passwd|token|api[_-]?key|appid|secret|access[_-]?token)\b\s*([:=])\s*([^\s"'&`]+)"#)
                .expect("inline redaction regex"),
            "$1$2***",
        ),
    ]
});

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    if normalized.is_empty() {
        return false;
    }
    if SENSITIVE_KEYS.contains(normalized.as_str()) {
        return true;
    }
    normalized.contains("secret") || normalized.contains("token") || normalized.contains("api_key")
}

pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADER_KEYS.contains(normalize_key(name).as_str())
}

#[derive(Clone, Default)]
pub struct SecretRegistry {
    secrets: Arc<RwLock<HashSet<String>>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut guard = self.secrets.write().unwrap_or_else(|err| err.into_inner());
        guard.insert(trimmed.to_string());
        if trimmed != secret {
            guard.insert(secret.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.secrets.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn redact(&self, text: &str) -> String {
        let guard = self.secrets.read().unwrap_or_else(|err| err.into_inner());
        // Longest first so a secret that contains another is replaced whole.
        let mut known: Vec<&String> = guard.iter().collect();
        known.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let mut out = redact_inline(text);
        for secret in known {
            if secret.len() < MIN_INLINE_SECRET_LEN {
                continue;
            }
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.redact(text)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, entry) in map {
                    if key == "headers" && entry.is_object() {
                        out.insert(key.clone(), self.redact_headers_value(entry));
                        continue;
                    }
                    if is_sensitive_key(key) && !entry.is_object() && !entry.is_array() {
                        out.insert(key.clone(), Value::String(REDACTED.to_string()));
                        continue;
                    }
                    out.insert(key.clone(), self.redact_value(entry));
                }
                Value::Object(out)
            }
            _ => value.clone(),
        }
    }

    fn redact_headers_value(&self, value: &Value) -> Value {
        let mut out = serde_json::Map::new();
        if let Some(map) = value.as_object() {
            for (key, entry) in map {
                if is_sensitive_header(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), self.redact_value(entry));
                }
            }
        }
        Value::Object(out)
    }

    pub fn redact_headers(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let shown = if is_sensitive_header(key) {
                    REDACTED.to_string()
                } else {
                    self.redact(value)
                };
                (key.clone(), shown)
            })
            .collect()
    }

    pub fn redact_params(&self, params: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        params
            .iter()
            .map(|(key, value)| {
                let shown = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    self.redact_value(value)
                };
                (key.clone(), shown)
            })
            .collect()
    }
}

pub fn redact_inline(value: &str) -> String {
    let mut out = value.to_string();
    for (re, replacement) in INLINE_REDACTION_PATTERNS.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, *replacement).to_string();
        }
    }
    out
}

pub fn truncate_for_display(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
