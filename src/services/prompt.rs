use crate::services::request::ApiContext;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn request_credential(&self, service: &str, api: Option<&ApiContext>) -> Option<String>;
}

pub fn signup_hint(service: &str, api: Option<&ApiContext>) -> String {
    if let Some(doc) = api.and_then(|a| a.documentation.as_deref()) {
        return format!("Documentation: {}", doc);
    }
    let name = api
        .map(|a| a.name.as_str())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(service);
    let query = format!("{} API key signup", name.trim());
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    format!("You can get one here: https://google.com/search?q={}", encoded)
}

pub struct StdinCredentialPrompt;

#[async_trait]
impl CredentialPrompt for StdinCredentialPrompt {
    async fn request_credential(&self, service: &str, api: Option<&ApiContext>) -> Option<String> {
        let display = api
            .map(|a| a.name.as_str())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(service);
        let banner = format!(
            "\nTo use {}, you need an API key.\n{}\nPlease enter your {} API key (empty to skip): ",
            display,
            signup_hint(service, api),
            display
        );
        let mut stderr = tokio::io::stderr();
        stderr.write_all(banner.as_bytes()).await.ok()?;
        stderr.flush().await.ok()?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let line = lines.next_line().await.ok()??;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

pub struct DeclinePrompt;

#[async_trait]
impl CredentialPrompt for DeclinePrompt {
    async fn request_credential(&self, _service: &str, _api: Option<&ApiContext>) -> Option<String> {
        None
    }
}
