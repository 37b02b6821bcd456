use crate::constants::network::USER_AGENT;
use crate::constants::vault::REDACTED;
use crate::errors::ForgeError;
use crate::services::request::{AuthScheme, HttpMethod, ValidatedRequest};
use crate::services::vault::Credential;
use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

#[derive(Clone, PartialEq, Eq)]
enum AuthSlot {
    Header(String),
    Query(String),
}

#[derive(Clone)]
pub struct AuthenticatedRequest {
    method: HttpMethod,
    url: Url,
    headers: BTreeMap<String, String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    slot: Option<AuthSlot>,
}

impl AuthenticatedRequest {
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_form(&self) -> bool {
        self.header("content-type")
            .map(|value| {
                value
                    .to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }
}

impl fmt::Debug for AuthenticatedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .map(|(key, value)| match &self.slot {
                Some(AuthSlot::Header(name)) if name.eq_ignore_ascii_case(key) => {
                    (key.as_str(), REDACTED)
                }
                _ => (key.as_str(), value.as_str()),
            })
            .collect();
        let query: Vec<(&str, &str)> = self
            .query
            .iter()
            .map(|(key, value)| match &self.slot {
                Some(AuthSlot::Query(param)) if param == key => (key.as_str(), REDACTED),
                _ => (key.as_str(), value.as_str()),
            })
            .collect();
        f.debug_struct("AuthenticatedRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &headers)
            .field("query", &query)
            .field("body", &self.body)
            .finish()
    }
}

fn query_pairs(params: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::String(text) => pairs.push((key.clone(), text.clone())),
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Null => {}
                        Value::String(text) => pairs.push((key.clone(), text.clone())),
                        other => pairs.push((key.clone(), other.to_string())),
                    }
                }
            }
            other => pairs.push((key.clone(), other.to_string())),
        }
    }
    pairs
}

fn set_default(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    if !headers.keys().any(|key| key.eq_ignore_ascii_case(name)) {
        headers.insert(name.to_string(), value.to_string());
    }
}

pub fn inject_credential(
    request: &ValidatedRequest,
    credential: Option<&Credential>,
) -> Result<AuthenticatedRequest, ForgeError> {
    let mut headers = request.headers().clone();
    let mut query = query_pairs(request.params());
    let mut slot = None;

    if let Some(auth) = request.auth() {
        let credential = credential.ok_or_else(|| {
            ForgeError::not_found(format!("No credential available for '{}'", auth.service))
        })?;
        let secret = credential.secret.expose();
        match &auth.scheme {
            AuthScheme::Bearer => {
                headers.retain(|key, _| !key.eq_ignore_ascii_case("authorization"));
                headers.insert("Authorization".to_string(), format!("Bearer {}", secret));
                slot = Some(AuthSlot::Header("Authorization".to_string()));
            }
            AuthScheme::Basic => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(secret.as_bytes());
                headers.retain(|key, _| !key.eq_ignore_ascii_case("authorization"));
                headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
                slot = Some(AuthSlot::Header("Authorization".to_string()));
            }
            AuthScheme::Header { name } => {
                headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
                headers.insert(name.clone(), secret.to_string());
                slot = Some(AuthSlot::Header(name.clone()));
            }
            AuthScheme::Query { param } => {
                query.retain(|(key, _)| key != param);
                query.push((param.clone(), secret.to_string()));
                slot = Some(AuthSlot::Query(param.clone()));
            }
        }
    }

    set_default(&mut headers, "Accept", "application/json");
    set_default(&mut headers, "User-Agent", USER_AGENT);
    if request.body().is_some() {
        set_default(&mut headers, "Content-Type", "application/json");
    }

    Ok(AuthenticatedRequest {
        method: request.method(),
        url: request.url().clone(),
        headers,
        query,
        body: request.body().cloned(),
        slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::request::AuthRequirement;
    use crate::services::vault::{CredentialMetadata, Secret};

    fn request(scheme: AuthScheme) -> ValidatedRequest {
        let mut params = BTreeMap::new();
        params.insert("q".to_string(), Value::String("London".to_string()));
        ValidatedRequest::new(
            HttpMethod::Get,
            Url::parse("https://api.example.com/weather").unwrap(),
            BTreeMap::new(),
            params,
            None,
            Some(AuthRequirement {
                service: "weather".to_string(),
                scheme,
            }),
        )
    }

    fn credential(secret: &str) -> Credential {
        Credential {
            service: "weather".to_string(),
            secret: Secret::new(secret),
            metadata: CredentialMetadata::default(),
        }
    }

    #[test]
    fn query_scheme_appends_param_and_hides_it_from_debug() {
        let req = request(AuthScheme::Query {
            param: "appid".to_string(),
        });
        let authed = inject_credential(&req, Some(&credential("k3y-abcdefghijklmnopqrst"))).unwrap();
        assert!(authed
            .query()
            .contains(&("appid".to_string(), "k3y-abcdefghijklmnopqrst".to_string())));
        let debug = format!("{:?}", authed);
        assert!(!debug.contains("k3y-abcdefghijklmnopqrst"));
        assert!(debug.contains("London"));
    }

    #[test]
    fn bearer_and_basic_set_authorization() {
        let bearer = inject_credential(&request(AuthScheme::Bearer), Some(&credential("tok-12345678"))).unwrap();
        assert_eq!(bearer.header("authorization"), Some("Bearer tok-12345678"));

        let basic = inject_credential(&request(AuthScheme::Basic), Some(&credential("user:pass"))).unwrap();
        assert_eq!(basic.header("Authorization"), Some("Basic dXNlcjpwYXNz"));
        assert!(!format!("{:?}", basic).contains("dXNlcjpwYXNz"));
    }

    #[test]
    fn missing_credential_is_an_error() {
        let err = inject_credential(&request(AuthScheme::Bearer), None).unwrap_err();
        assert!(err.message.contains("weather"));
    }

    #[test]
    fn default_headers_do_not_override_explicit_ones() {
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), "text/csv".to_string());
        let req = ValidatedRequest::new(
            HttpMethod::Post,
            Url::parse("https://api.example.com/items").unwrap(),
            headers,
            BTreeMap::new(),
            Some(serde_json::json!({"a": 1})),
            None,
        );
        let authed = inject_credential(&req, None).unwrap();
        assert_eq!(authed.header("Accept"), Some("text/csv"));
        assert_eq!(authed.header("content-type"), Some("application/json"));
        assert!(authed.header("user-agent").is_some());
    }
}
