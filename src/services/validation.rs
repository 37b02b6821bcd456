use crate::constants::protocols::ALLOWED_HTTP;
use crate::services::logger::Logger;
use crate::services::request::{
    AuthRequirement, CandidateRequest, HttpMethod, ParamSpec, ValidatedRequest,
};
use crate::services::vault::{CredentialCheck, CredentialVault};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use url::Url;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{?\s*[A-Za-z_][A-Za-z0-9_.\-]*\s*\}?\}").expect("placeholder regex"));
static ENCODED_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)%7B(%7B)?[A-Za-z_][A-Za-z0-9_.\-]*(%7D)?%7D").expect("placeholder regex")
});

static BUILTIN_PATTERNS: Lazy<Vec<(&'static str, &'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "date",
            "YYYY-MM-DD",
            Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date regex"),
        ),
        (
            "email",
            "email address",
            Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email regex"),
        ),
        (
            "url",
            "http(s) URL",
            Regex::new(r"^https?://.+").expect("url regex"),
        ),
        (
            "api_key",
            "20+ characters of [A-Za-z0-9_-]",
            Regex::new(r"^[A-Za-z0-9_\-]{20,}$").expect("api key regex"),
        ),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    EmptyPlan,
    Structure,
    Pattern,
    Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("the planner returned an empty request")]
    EmptyPlan,
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unresolved URL template placeholder {placeholder} in '{url}'")]
    UnresolvedPlaceholder { url: String, placeholder: String },
    #[error("invalid HTTP method '{method}' (expected one of {expected})")]
    InvalidMethod { method: String, expected: String },
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("{method} requests must carry a body")]
    MissingBody { method: String },
    #[error("required parameter '{name}' is missing or empty")]
    MissingParameter { name: String },
    #[error("parameter '{name}' must match {expected}, got '{actual}'")]
    PatternMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("parameter '{name}' declares an unusable pattern '{pattern}'")]
    InvalidPattern { name: String, pattern: String },
    #[error("no credential stored for service '{service}'")]
    MissingCredential { service: String },
    #[error("credential for service '{service}' is invalid: {reason}")]
    InvalidCredential { service: String, reason: String },
}

impl Violation {
    pub fn category(&self) -> ViolationCategory {
        match self {
            Violation::EmptyPlan => ViolationCategory::EmptyPlan,
            Violation::UnresolvedPlaceholder { .. }
            | Violation::PatternMismatch { .. }
            | Violation::InvalidPattern { .. } => ViolationCategory::Pattern,
            Violation::MissingCredential { .. } | Violation::InvalidCredential { .. } => {
                ViolationCategory::Credential
            }
            _ => ViolationCategory::Structure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
    pending: Option<Box<ValidatedRequest>>,
}

impl ValidationError {
    pub fn only_credential_issues(&self) -> bool {
        !self.violations.is_empty()
            && self
                .violations
                .iter()
                .all(|v| v.category() == ViolationCategory::Credential)
    }

    pub fn into_pending(self) -> Result<(ValidatedRequest, Vec<Violation>), Self> {
        if self.only_credential_issues() {
            if let Some(request) = self.pending {
                return Ok((*request, self.violations));
            }
        }
        Err(self)
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request validation failed: {}", self.messages().join("; "))
    }
}

impl std::error::Error for ValidationError {}

#[derive(Clone)]
pub struct RequestValidator {
    logger: Logger,
    vault: Arc<CredentialVault>,
}

impl RequestValidator {
    pub fn new(logger: Logger, vault: Arc<CredentialVault>) -> Self {
        Self {
            logger: logger.child("validator"),
            vault,
        }
    }

    pub fn validate(&self, candidate: &CandidateRequest) -> Result<ValidatedRequest, ValidationError> {
        if candidate.is_empty() {
            return Err(ValidationError {
                violations: vec![Violation::EmptyPlan],
                pending: None,
            });
        }

        let mut violations = Vec::new();
        let url = check_url(&candidate.url, &mut violations);
        let method = check_method(&candidate.method, &mut violations);
        check_headers(candidate, &mut violations);
        if let Some(method) = method {
            if method.requires_body() && candidate.body.as_ref().map(Value::is_null).unwrap_or(true) {
                violations.push(Violation::MissingBody {
                    method: method.to_string(),
                });
            }
        }
        if let Some(schema) = &candidate.schema {
            for (name, spec) in schema {
                check_required(name, spec, candidate, &mut violations);
            }
            for (name, spec) in schema {
                check_pattern(name, spec, candidate, &mut violations);
            }
        }
        let structural_ok = violations.is_empty();
        if let Some(auth) = &candidate.auth {
            self.check_auth(auth, &mut violations);
        }

        if structural_ok {
            // Both are Some whenever no structural rule fired.
            if let (Some(url), Some(method)) = (url, method) {
                let request = ValidatedRequest::new(
                    method,
                    url,
                    candidate.headers.clone(),
                    candidate.params.clone(),
                    candidate.body.clone().filter(|b| !b.is_null()),
                    candidate.auth.clone(),
                );
                if violations.is_empty() {
                    return Ok(request);
                }
                self.logger.debug(
                    "Request valid apart from credentials",
                    Some(&serde_json::json!({"violations": violations.len()})),
                );
                return Err(ValidationError {
                    violations,
                    pending: Some(Box::new(request)),
                });
            }
        }

        self.logger.info(
            "Request rejected",
            Some(&serde_json::json!({
                "violations": violations.iter().map(|v| v.to_string()).collect::<Vec<_>>()
            })),
        );
        Err(ValidationError {
            violations,
            pending: None,
        })
    }

    fn check_auth(&self, auth: &AuthRequirement, violations: &mut Vec<Violation>) {
        match self.vault.retrieve(&auth.service) {
            Ok(Some(credential)) => {
                if let CredentialCheck::Invalid(reason) = self.vault.validate(&credential, &auth.scheme) {
                    violations.push(Violation::InvalidCredential {
                        service: auth.service.clone(),
                        reason,
                    });
                }
            }
            Ok(None) => violations.push(Violation::MissingCredential {
                service: auth.service.clone(),
            }),
            Err(err) => {
                self.logger.warn(
                    "Credential lookup failed",
                    Some(&serde_json::json!({"service": auth.service, "error": err.message})),
                );
                violations.push(Violation::MissingCredential {
                    service: auth.service.clone(),
                });
            }
        }
    }
}

fn check_url(raw: &str, violations: &mut Vec<Violation>) -> Option<Url> {
    let trimmed = raw.trim();
    let mut ok = true;
    if let Some(found) = PLACEHOLDER
        .find(trimmed)
        .or_else(|| ENCODED_PLACEHOLDER.find(trimmed))
    {
        violations.push(Violation::UnresolvedPlaceholder {
            url: trimmed.to_string(),
            placeholder: found.as_str().to_string(),
        });
        ok = false;
    }
    if trimmed.is_empty() {
        violations.push(Violation::InvalidUrl {
            url: String::new(),
            reason: "URL is empty".to_string(),
        });
        return None;
    }
    let parsed = match Url::parse(trimmed) {
        Ok(parsed) => parsed,
        Err(err) => {
            if ok {
                violations.push(Violation::InvalidUrl {
                    url: trimmed.to_string(),
                    reason: err.to_string(),
                });
            }
            return None;
        }
    };
    if !scheme_allowed(parsed.scheme()) {
        violations.push(Violation::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("scheme '{}' is not http or https", parsed.scheme()),
        });
        ok = false;
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        violations.push(Violation::InvalidUrl {
            url: trimmed.to_string(),
            reason: "host is empty".to_string(),
        });
        ok = false;
    }
    ok.then_some(parsed)
}

fn scheme_allowed(scheme: &str) -> bool {
    ALLOWED_HTTP
        .iter()
        .any(|allowed| allowed.trim_end_matches(':') == scheme)
}

fn check_method(raw: &str, violations: &mut Vec<Violation>) -> Option<HttpMethod> {
    let parsed = HttpMethod::parse(raw);
    if parsed.is_none() {
        violations.push(Violation::InvalidMethod {
            method: raw.trim().to_string(),
            expected: HttpMethod::recognized_list(),
        });
    }
    parsed
}

fn check_headers(candidate: &CandidateRequest, violations: &mut Vec<Violation>) {
    for (name, value) in &candidate.headers {
        let reason = if name.trim().is_empty() {
            Some("header name is empty")
        } else if value.trim().is_empty() {
            Some("header value is empty")
        } else if HeaderName::from_bytes(name.as_bytes()).is_err() {
            Some("header name is not a valid token")
        } else if HeaderValue::from_str(value).is_err() {
            Some("header value contains invalid characters")
        } else {
            None
        };
        if let Some(reason) = reason {
            violations.push(Violation::InvalidHeader {
                name: name.clone(),
                reason: reason.to_string(),
            });
        }
    }
}

fn param_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn param_value<'a>(candidate: &'a CandidateRequest, name: &str) -> Option<&'a Value> {
    candidate
        .params
        .get(name)
        .or_else(|| candidate.body.as_ref().and_then(|body| body.get(name)))
}

fn check_required(
    name: &str,
    spec: &ParamSpec,
    candidate: &CandidateRequest,
    violations: &mut Vec<Violation>,
) {
    if !spec.required {
        return;
    }
    let present = param_value(candidate, name)
        .and_then(param_text)
        .map(|text| !text.trim().is_empty())
        .unwrap_or(false);
    if !present {
        violations.push(Violation::MissingParameter {
            name: name.to_string(),
        });
    }
}

fn check_pattern(
    name: &str,
    spec: &ParamSpec,
    candidate: &CandidateRequest,
    violations: &mut Vec<Violation>,
) {
    // Absent optional parameters are never pattern-checked.
    let Some(actual) = param_value(candidate, name).and_then(param_text) else {
        return;
    };
    if actual.trim().is_empty() {
        return;
    }
    if let Some(allowed) = &spec.allowed {
        if !allowed.is_empty() && !allowed.iter().any(|a| a == &actual) {
            violations.push(Violation::PatternMismatch {
                name: name.to_string(),
                expected: format!("one of [{}]", allowed.join(", ")),
                actual: actual.clone(),
            });
        }
    }
    let Some(pattern) = spec.pattern.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
        return;
    };
    if let Some((_, label, regex)) = BUILTIN_PATTERNS
        .iter()
        .find(|(key, _, _)| key.eq_ignore_ascii_case(pattern))
    {
        if !regex.is_match(&actual) {
            violations.push(Violation::PatternMismatch {
                name: name.to_string(),
                expected: format!("{} ({})", pattern, label),
                actual,
            });
        }
        return;
    }
    let anchored = format!("^(?:{})$", pattern.trim_start_matches('^').trim_end_matches('$'));
    match Regex::new(&anchored) {
        Ok(regex) => {
            if !regex.is_match(&actual) {
                violations.push(Violation::PatternMismatch {
                    name: name.to_string(),
                    expected: pattern.to_string(),
                    actual,
                });
            }
        }
        Err(_) => violations.push(Violation::InvalidPattern {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }),
    }
}
