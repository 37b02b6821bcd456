use crate::constants::limits::DIAGNOSTIC_BODY_CHARS;
use crate::constants::network::USER_AGENT;
use crate::constants::planning::ORACLE_TEMPERATURE;
use crate::errors::{ErrorKind, ForgeError};
use crate::services::logger::Logger;
use crate::utils::redact::truncate_for_display;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const SYSTEM_PROMPT: &str =
    "You are an API expert. Return only valid JSON without any additional text.";

#[async_trait]
pub trait SuggestionOracle: Send + Sync {
    async fn suggest(&self, prompt: &str) -> Result<String, ForgeError>;
    async fn repair(&self, prompt: &str) -> Result<String, ForgeError>;
}

#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

pub struct OpenAiOracle {
    logger: Logger,
    client: Client,
    settings: OracleSettings,
}

impl OpenAiOracle {
    pub fn new(logger: Logger, settings: OracleSettings) -> Result<Self, ForgeError> {
        if let Some(key) = &settings.api_key {
            logger.secrets().register(key);
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(settings.timeout_ms.max(1)))
            .build()
            .map_err(|err| ForgeError::internal(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            logger: logger.child("oracle"),
            client,
            settings,
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String, ForgeError> {
        let api_key = self.settings.api_key.as_deref().ok_or_else(|| {
            ForgeError::planner("ORACLE_UNCONFIGURED", "OPENAI_API_KEY is not set")
                .with_hint("Export OPENAI_API_KEY before running a goal.")
        })?;
        let payload = serde_json::json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": ORACLE_TEMPERATURE,
        });

        self.logger.debug(
            "Oracle request",
            Some(&serde_json::json!({"model": self.settings.model, "prompt_chars": prompt.len()})),
        );
        let response = self
            .client
            .post(&self.settings.url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                let kind = if err.is_timeout() { "ORACLE_TIMEOUT" } else { "ORACLE_UNREACHABLE" };
                ForgeError::planner(kind, format!("Suggestion oracle unreachable: {}", err.without_url()))
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            ForgeError::planner("ORACLE_UNREACHABLE", format!("Failed to read oracle response: {}", err))
        })?;
        if !status.is_success() {
            return Err(ForgeError::planner(
                "ORACLE_STATUS",
                format!(
                    "Suggestion oracle returned HTTP {}: {}",
                    status.as_u16(),
                    truncate_for_display(&text, DIAGNOSTIC_BODY_CHARS)
                ),
            ));
        }
        extract_content(&text)
    }
}

#[async_trait]
impl SuggestionOracle for OpenAiOracle {
    async fn suggest(&self, prompt: &str) -> Result<String, ForgeError> {
        self.complete(prompt).await
    }

    async fn repair(&self, prompt: &str) -> Result<String, ForgeError> {
        self.complete(prompt).await
    }
}

fn extract_content(raw: &str) -> Result<String, ForgeError> {
    let parsed: Value = serde_json::from_str(raw).map_err(|_| {
        ForgeError::new(ErrorKind::Planner, "ORACLE_MALFORMED", "Oracle envelope is not JSON")
    })?;
    parsed
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            ForgeError::planner("ORACLE_MALFORMED", "Oracle envelope has no message content")
        })
}
