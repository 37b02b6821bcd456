use crate::constants::limits::MAX_BODY_CAPTURE_BYTES;
use crate::constants::network::MAX_REDIRECTS;
use crate::errors::ForgeError;
use crate::services::auth::AuthenticatedRequest;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub truncated: bool,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &AuthenticatedRequest) -> Result<HttpResponse, ForgeError>;
}

pub struct ReqwestTransport {
    client: Client,
    max_capture_bytes: usize,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ForgeError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|err| ForgeError::internal(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            client,
            max_capture_bytes: MAX_BODY_CAPTURE_BYTES,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &AuthenticatedRequest) -> Result<HttpResponse, ForgeError> {
        let method = Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| ForgeError::internal("Unsupported HTTP method"))?;
        let mut builder = self
            .client
            .request(method, request.url().clone())
            .headers(build_headers(request.headers())?);
        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }
        if let Some(body) = request.body() {
            if request.is_form() {
                let encoded = serde_urlencoded::to_string(body).map_err(|err| {
                    ForgeError::invalid_params(format!("Body cannot be form-encoded: {}", err))
                })?;
                builder = builder.body(encoded);
            } else {
                let encoded = serde_json::to_vec(body).map_err(|err| {
                    ForgeError::invalid_params(format!("Body cannot be JSON-encoded: {}", err))
                })?;
                builder = builder.body(encoded);
            }
        }

        let mut response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = headers_to_map(response.headers());

        let mut buffer = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            let remaining = self.max_capture_bytes.saturating_sub(buffer.len());
            if chunk.len() <= remaining {
                buffer.extend_from_slice(&chunk);
            } else {
                buffer.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
        }

        let text = String::from_utf8_lossy(&buffer).to_string();
        let is_json = headers
            .get("content-type")
            .map(|value| value.contains("json"))
            .unwrap_or(false);
        let body = if is_json && !truncated {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
            truncated,
        })
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ForgeError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| ForgeError::invalid_params(format!("Invalid header name: {}", key)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ForgeError::invalid_params(format!("Invalid value for header {}", key)))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> ForgeError {
    if err.is_timeout() {
        return ForgeError::timeout("HTTP request timed out");
    }
    // Strip the URL: it may carry a query-string credential.
    ForgeError::retryable(err.without_url().to_string())
}
