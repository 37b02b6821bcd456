use crate::constants::vault::REDACTED;
use crate::utils::redact::{is_sensitive_key, SecretRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub const ALL: &'static [HttpMethod] = &[
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
        HttpMethod::Head,
        HttpMethod::Options,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == normalized)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub fn requires_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    pub fn recognized_list() -> String {
        Self::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    Bearer,
    Header { name: String },
    Query { param: String },
    Basic,
}

impl AuthScheme {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let (kind, arg) = match trimmed.split_once(':') {
            Some((kind, arg)) => (kind.trim().to_lowercase(), Some(arg.trim())),
            None => (trimmed.to_lowercase(), None),
        };
        let arg = arg.filter(|s| !s.is_empty()).map(|s| s.to_string());
        match kind.as_str() {
            "bearer" | "token" | "oauth" => Some(AuthScheme::Bearer),
            "basic" => Some(AuthScheme::Basic),
            "header" | "api_key_header" => Some(AuthScheme::Header {
                name: arg.unwrap_or_else(|| "X-API-Key".to_string()),
            }),
            "query" | "api_key" | "api_key_query" => Some(AuthScheme::Query {
                param: arg.unwrap_or_else(|| "api_key".to_string()),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Bearer => f.write_str("bearer"),
            AuthScheme::Basic => f.write_str("basic"),
            AuthScheme::Header { name } => write!(f, "header:{}", name),
            AuthScheme::Query { param } => write!(f, "query:{}", param),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequirement {
    pub service: String,
    pub scheme: AuthScheme,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub type ParamSchema = BTreeMap<String, ParamSpec>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiContext {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ParamSchema>,
}

impl CandidateRequest {
    pub fn is_empty(&self) -> bool {
        self.method.trim().is_empty()
            && self.url.trim().is_empty()
            && self.headers.is_empty()
            && self.params.is_empty()
            && self.body.as_ref().map(Value::is_null).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    method: HttpMethod,
    url: Url,
    headers: BTreeMap<String, String>,
    params: BTreeMap<String, Value>,
    body: Option<Value>,
    auth: Option<AuthRequirement>,
}

impl ValidatedRequest {
    pub(crate) fn new(
        method: HttpMethod,
        url: Url,
        headers: BTreeMap<String, String>,
        params: BTreeMap<String, Value>,
        body: Option<Value>,
        auth: Option<AuthRequirement>,
    ) -> Self {
        Self {
            method,
            url,
            headers,
            params,
            body,
            auth,
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn auth(&self) -> Option<&AuthRequirement> {
        self.auth.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_service: Option<String>,
}

impl RequestSnapshot {
    pub fn from_candidate(candidate: &CandidateRequest, secrets: &SecretRegistry) -> Self {
        Self {
            method: secrets.redact(&candidate.method),
            url: redact_url(&candidate.url, secrets),
            headers: secrets.redact_headers(&candidate.headers),
            params: secrets.redact_params(&candidate.params),
            body: candidate.body.as_ref().map(|b| secrets.redact_value(b)),
            auth_service: candidate.auth.as_ref().map(|a| a.service.clone()),
        }
    }

    pub fn from_validated(request: &ValidatedRequest, secrets: &SecretRegistry) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            url: redact_url(request.url.as_str(), secrets),
            headers: secrets.redact_headers(&request.headers),
            params: secrets.redact_params(&request.params),
            body: request.body.as_ref().map(|b| secrets.redact_value(b)),
            auth_service: request.auth.as_ref().map(|a| a.service.clone()),
        }
    }
}

impl fmt::Display for RequestSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        if !self.params.is_empty() {
            let rendered = serde_json::to_string(&self.params).unwrap_or_default();
            write!(f, " params={}", rendered)?;
        }
        if let Some(service) = &self.auth_service {
            write!(f, " auth={}({})", service, REDACTED)?;
        }
        Ok(())
    }
}

fn redact_url(raw: &str, secrets: &SecretRegistry) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return secrets.redact(raw);
    };
    if parsed.query().is_some() {
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| {
                let shown = if is_sensitive_key(&k) {
                    REDACTED.to_string()
                } else {
                    v.to_string()
                };
                (k.to_string(), shown)
            })
            .collect();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }
    if parsed.password().is_some() {
        let _ = parsed.set_password(Some(REDACTED));
    }
    secrets.redact(parsed.as_str())
}
