use crate::constants::limits::DIAGNOSTIC_BODY_CHARS;
use crate::constants::retry as retry_constants;
use crate::constants::network::TIMEOUT_API_REQUEST_MS;
use crate::errors::{ErrorKind, ForgeError};
use crate::services::auth::AuthenticatedRequest;
use crate::services::logger::Logger;
use crate::services::transport::{HttpResponse, HttpTransport};
use crate::utils::cancel::CancelToken;
use crate::utils::redact::{truncate_for_display, SecretRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub respect_retry_after: bool,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: retry_constants::MAX_ATTEMPTS,
            base_delay_ms: retry_constants::BASE_DELAY_MS,
            max_delay_ms: retry_constants::MAX_DELAY_MS,
            jitter: retry_constants::JITTER,
            respect_retry_after: true,
            timeout_ms: TIMEOUT_API_REQUEST_MS,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_delay(&self, attempt: usize) -> u64 {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let mut delay = (self.base_delay_ms as f64) * 2f64.powi(exponent);
        let cap = self.max_delay_ms as f64;
        if delay > cap {
            delay = cap;
        }
        if self.jitter > 0.0 {
            let delta = delay * self.jitter.min(1.0);
            delay = delay - delta + rand::random::<f64>() * delta * 2.0;
            delay = delay.min(cap);
        }
        delay.max(0.0) as u64
    }

    fn delay_for(&self, attempt: usize, retry_after_ms: Option<u64>) -> u64 {
        let computed = self.backoff_delay(attempt);
        match retry_after_ms {
            Some(hint) if self.respect_retry_after && hint > computed => hint,
            _ => computed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    Timeout,
    NetworkError,
    ServerError,
    RateLimited,
    ClientError,
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::NetworkError
                | FailureKind::ServerError
                | FailureKind::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "Timeout",
            FailureKind::NetworkError => "NetworkError",
            FailureKind::ServerError => "ServerError",
            FailureKind::RateLimited => "RateLimited",
            FailureKind::ClientError => "ClientError",
            FailureKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        status: u16,
        body: Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
            status: None,
            body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub attempt: usize,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_before_next_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: Outcome,
    pub calls: Vec<CallRecord>,
}

impl Execution {
    pub fn attempts(&self) -> usize {
        self.calls.len()
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct RetryController {
    logger: Logger,
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(
        logger: Logger,
        transport: Arc<dyn HttpTransport>,
        sleeper: Arc<dyn Sleeper>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            logger: logger.child("retry"),
            transport,
            sleeper,
            policy,
        }
    }

    pub async fn execute(&self, request: &AuthenticatedRequest, cancel: &CancelToken) -> Execution {
        self.execute_bounded(request, cancel, self.policy.max_attempts)
            .await
    }

    pub async fn execute_bounded(
        &self,
        request: &AuthenticatedRequest,
        cancel: &CancelToken,
        limit: usize,
    ) -> Execution {
        let max_attempts = self.policy.max_attempts.min(limit).max(1);
        let timeout = Duration::from_millis(self.policy.timeout_ms.max(1));
        let mut calls = Vec::new();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Execution {
                    outcome: Outcome::failure(FailureKind::Cancelled, "cancelled before the request was sent"),
                    calls,
                };
            }
            attempt += 1;
            let started = Instant::now();
            let result = tokio::time::timeout(timeout, self.transport.send(request)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let (outcome, retry_after_ms) = match result {
                Ok(Ok(response)) => classify_response(response, self.logger.secrets()),
                Ok(Err(err)) => (classify_error(&err, self.logger.secrets()), None),
                Err(_) => (
                    Outcome::failure(
                        FailureKind::Timeout,
                        format!("request timed out after {} ms", self.policy.timeout_ms),
                    ),
                    None,
                ),
            };

            let retryable = outcome
                .failure_kind()
                .map(FailureKind::is_retryable)
                .unwrap_or(false);
            if !retryable || attempt >= max_attempts {
                if let Some(kind) = outcome.failure_kind() {
                    self.logger.warn(
                        "HTTP request failed",
                        Some(&serde_json::json!({"attempt": attempt, "kind": kind})),
                    );
                }
                calls.push(CallRecord {
                    attempt,
                    outcome: outcome.clone(),
                    elapsed_ms,
                    delay_before_next_ms: None,
                });
                return Execution { outcome, calls };
            }

            let delay = self.policy.delay_for(attempt, retry_after_ms);
            self.logger.warn(
                "HTTP retry",
                Some(&serde_json::json!({
                    "attempt": attempt,
                    "kind": outcome.failure_kind(),
                    "delay_ms": delay,
                })),
            );
            calls.push(CallRecord {
                attempt,
                outcome,
                elapsed_ms,
                delay_before_next_ms: Some(delay),
            });

            tokio::select! {
                _ = self.sleeper.sleep(Duration::from_millis(delay)) => {}
                _ = cancel.cancelled() => {
                    self.logger.info("Retry cancelled during backoff", None);
                    return Execution {
                        outcome: Outcome::failure(FailureKind::Cancelled, "cancelled during retry backoff"),
                        calls,
                    };
                }
            }
        }
    }
}

fn classify_response(response: HttpResponse, secrets: &SecretRegistry) -> (Outcome, Option<u64>) {
    let status = response.status;
    if (200..300).contains(&status) {
        return (
            Outcome::Success {
                status,
                body: response.body,
            },
            None,
        );
    }
    let (kind, retry_after) = match status {
        429 => (
            FailureKind::RateLimited,
            response.header("retry-after").and_then(parse_retry_after),
        ),
        500..=599 => (FailureKind::ServerError, None),
        _ => (FailureKind::ClientError, None),
    };
    // Redacted before truncation so a secret cut at the boundary cannot survive.
    let preview = secrets.redact(&match &response.body {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    });
    let mut message = format!("HTTP {}", status);
    if !preview.trim().is_empty() {
        message.push_str(": ");
        message.push_str(&truncate_for_display(preview.trim(), DIAGNOSTIC_BODY_CHARS));
    }
    (
        Outcome::Failure {
            kind,
            message,
            status: Some(status),
            body: Some(response.body),
        },
        retry_after,
    )
}

fn classify_error(err: &ForgeError, secrets: &SecretRegistry) -> Outcome {
    let kind = match err.kind {
        ErrorKind::Timeout => FailureKind::Timeout,
        ErrorKind::Cancelled => FailureKind::Cancelled,
        ErrorKind::InvalidParams => FailureKind::ClientError,
        _ => FailureKind::NetworkError,
    };
    Outcome::failure(kind, secrets.redact(&err.message))
}

pub fn parse_retry_after(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let millis = if let Ok(seconds) = trimmed.parse::<u64>() {
        seconds.saturating_mul(1000)
    } else {
        let at = DateTime::parse_from_rfc2822(trimmed).ok()?;
        let delta = at.with_timezone(&Utc) - Utc::now();
        delta.num_milliseconds().max(0) as u64
    };
    Some(millis.min(retry_constants::MAX_RETRY_AFTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::inject_credential;
    use crate::services::request::{HttpMethod, ValidatedRequest};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use url::Url;

    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, ForgeError>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<HttpResponse, ForgeError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, _request: &AuthenticatedRequest) -> Result<HttpResponse, ForgeError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(200)))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration.as_millis() as u64);
        }
    }

    fn status(code: u16) -> HttpResponse {
        HttpResponse {
            status: code,
            headers: BTreeMap::new(),
            body: Value::Null,
            truncated: false,
        }
    }

    fn request() -> AuthenticatedRequest {
        let validated = ValidatedRequest::new(
            HttpMethod::Get,
            Url::parse("https://api.example.com/x").unwrap(),
            BTreeMap::new(),
            BTreeMap::new(),
            None,
            None,
        );
        inject_credential(&validated, None).unwrap()
    }

    fn controller(
        transport: Arc<Scripted>,
        sleeper: Arc<RecordingSleeper>,
        max_attempts: usize,
    ) -> RetryController {
        RetryController::new(
            Logger::new("test"),
            transport,
            sleeper,
            RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
        )
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=10).map(|n| policy.backoff_delay(n)).collect();
        assert_eq!(&delays[..4], &[100, 200, 400, 800]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= 1_000));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            base_delay_ms: 500,
            max_delay_ms: 600,
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for attempt in 1..20 {
            assert!(policy.backoff_delay(attempt) <= 600);
        }
    }

    #[tokio::test]
    async fn echoed_secret_is_redacted_before_the_preview_is_cut() {
        let secret = "SUPERSECRET-bearer-token-0123456";
        let logger = Logger::new("test");
        logger.secrets().register(secret);
        let mut response = status(401);
        response.body = Value::String(format!("{}{}", "x".repeat(990), secret));
        let controller = RetryController::new(
            logger,
            Scripted::new(vec![Ok(response)]),
            Arc::new(RecordingSleeper::default()),
            RetryPolicy::default(),
        );
        let execution = controller.execute(&request(), &CancelToken::new()).await;
        let Outcome::Failure { message, .. } = &execution.outcome else {
            panic!("expected failure");
        };
        assert!(message.ends_with("***"));
        assert!(!message.contains(&secret[..10]));
    }

    #[test]
    fn retry_after_accepts_seconds_and_clamps() {
        assert_eq!(parse_retry_after("2"), Some(2_000));
        assert_eq!(parse_retry_after("86400"), Some(60_000));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(0));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test]
    async fn retryable_failures_then_success_succeed() {
        let transport = Scripted::new(vec![
            Ok(status(503)),
            Err(ForgeError::retryable("connection reset")),
            Ok(status(200)),
        ]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let exec = controller(transport.clone(), sleeper.clone(), 3)
            .execute(&request(), &CancelToken::new())
            .await;
        assert!(exec.outcome.is_success());
        assert_eq!(exec.attempts(), 3);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![250, 500]);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_kind() {
        let transport = Scripted::new(vec![
            Err(ForgeError::retryable("refused")),
            Ok(status(500)),
            Ok(status(502)),
        ]);
        let exec = controller(transport.clone(), Arc::new(RecordingSleeper::default()), 3)
            .execute(&request(), &CancelToken::new())
            .await;
        assert_eq!(exec.outcome.failure_kind(), Some(FailureKind::ServerError));
        assert_eq!(transport.calls(), 3);
        assert_eq!(exec.calls[0].outcome.failure_kind(), Some(FailureKind::NetworkError));
        assert_eq!(exec.calls[2].delay_before_next_ms, None);
    }

    #[tokio::test]
    async fn client_error_is_never_retried() {
        let transport = Scripted::new(vec![Ok(status(404)), Ok(status(200))]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let exec = controller(transport.clone(), sleeper.clone(), 5)
            .execute(&request(), &CancelToken::new())
            .await;
        assert_eq!(exec.outcome.failure_kind(), Some(FailureKind::ClientError));
        assert_eq!(transport.calls(), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_uses_larger_retry_after_hint() {
        let mut limited = status(429);
        limited
            .headers
            .insert("retry-after".to_string(), "3".to_string());
        let transport = Scripted::new(vec![Ok(limited), Ok(status(200))]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let exec = controller(transport, sleeper.clone(), 3)
            .execute(&request(), &CancelToken::new())
            .await;
        assert!(exec.outcome.is_success());
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![3_000]);
    }

    #[tokio::test]
    async fn slow_transport_times_out() {
        struct Slow;
        #[async_trait]
        impl HttpTransport for Slow {
            async fn send(&self, _r: &AuthenticatedRequest) -> Result<HttpResponse, ForgeError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(status(200))
            }
        }
        let controller = RetryController::new(
            Logger::new("test"),
            Arc::new(Slow),
            Arc::new(RecordingSleeper::default()),
            RetryPolicy {
                max_attempts: 1,
                timeout_ms: 20,
                ..RetryPolicy::default()
            },
        );
        let exec = controller.execute(&request(), &CancelToken::new()).await;
        assert_eq!(exec.outcome.failure_kind(), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let transport = Scripted::new(vec![Ok(status(500)), Ok(status(500)), Ok(status(500))]);
        let controller = RetryController::new(
            Logger::new("test"),
            transport.clone(),
            Arc::new(TokioSleeper),
            RetryPolicy {
                base_delay_ms: 60_000,
                max_delay_ms: 60_000,
                ..RetryPolicy::default()
            },
        );
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let exec = tokio::time::timeout(Duration::from_secs(5), controller.execute(&request(), &cancel))
            .await
            .expect("backoff should be cancelled");
        assert_eq!(exec.outcome.failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(transport.calls(), 1);
    }
}
