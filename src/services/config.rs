use crate::constants::network::{TIMEOUT_API_REQUEST_MS, TIMEOUT_ORACLE_MS};
use crate::constants::planning::{
    MAX_CREDENTIAL_PROMPTS, MAX_PLANNER_RETRIES, MAX_REPLANS, MAX_TRACE_ATTEMPTS, ORACLE_MODEL,
    ORACLE_URL,
};
use crate::constants::retry as retry_constants;
use crate::errors::ForgeError;
use crate::services::retry::RetryPolicy;
use serde::Serialize;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub respect_retry_after: bool,
    pub request_timeout_ms: u64,
    pub max_replans: usize,
    pub max_planner_retries: usize,
    pub max_credential_prompts: usize,
    pub max_trace_attempts: usize,
    pub oracle_url: String,
    pub oracle_model: String,
    pub oracle_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: retry_constants::MAX_ATTEMPTS,
            base_delay_ms: retry_constants::BASE_DELAY_MS,
            max_delay_ms: retry_constants::MAX_DELAY_MS,
            jitter: retry_constants::JITTER,
            respect_retry_after: true,
            request_timeout_ms: TIMEOUT_API_REQUEST_MS,
            max_replans: MAX_REPLANS,
            max_planner_retries: MAX_PLANNER_RETRIES,
            max_credential_prompts: MAX_CREDENTIAL_PROMPTS,
            max_trace_attempts: MAX_TRACE_ATTEMPTS,
            oracle_url: ORACLE_URL.to_string(),
            oracle_model: ORACLE_MODEL.to_string(),
            oracle_timeout_ms: TIMEOUT_ORACLE_MS,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_var<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ForgeError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse::<T>().map(Some).map_err(|_| {
        ForgeError::invalid_params(format!("{} has an invalid value: {}", key, trimmed))
    })
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ForgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ForgeError> {
        let mut config = Self::default();
        macro_rules! layer {
            ($field:ident, $key:literal) => {
                if let Some(value) = parse_var($key, lookup($key))? {
                    config.$field = value;
                }
            };
        }
        layer!(max_attempts, "APIFORGE_MAX_ATTEMPTS");
        layer!(base_delay_ms, "APIFORGE_BASE_DELAY_MS");
        layer!(max_delay_ms, "APIFORGE_MAX_DELAY_MS");
        layer!(jitter, "APIFORGE_JITTER");
        layer!(request_timeout_ms, "APIFORGE_TIMEOUT_MS");
        layer!(max_replans, "APIFORGE_MAX_REPLANS");
        layer!(max_planner_retries, "APIFORGE_PLANNER_RETRIES");
        layer!(max_credential_prompts, "APIFORGE_CREDENTIAL_PROMPTS");
        layer!(max_trace_attempts, "APIFORGE_TRACE_CAP");
        layer!(oracle_timeout_ms, "APIFORGE_ORACLE_TIMEOUT_MS");
        if let Some(url) = lookup("APIFORGE_ORACLE_URL").filter(|v| !v.trim().is_empty()) {
            config.oracle_url = url.trim().to_string();
        }
        if let Some(model) = lookup("APIFORGE_ORACLE_MODEL").filter(|v| !v.trim().is_empty()) {
            config.oracle_model = model.trim().to_string();
        }
        if let Some(flag) = lookup("APIFORGE_RESPECT_RETRY_AFTER") {
            config.respect_retry_after = is_truthy(&flag);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ForgeError> {
        if self.max_attempts == 0 {
            return Err(ForgeError::invalid_params("max_attempts must be at least 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ForgeError::invalid_params(
                "max_delay_ms must not be smaller than base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ForgeError::invalid_params("jitter must be between 0 and 1"));
        }
        if self.request_timeout_ms == 0 || self.oracle_timeout_ms == 0 {
            return Err(ForgeError::invalid_params("timeouts must be positive"));
        }
        if self.max_trace_attempts == 0 {
            return Err(ForgeError::invalid_params("max_trace_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
            respect_retry_after: self.respect_retry_after,
            timeout_ms: self.request_timeout_ms,
        }
    }
}
