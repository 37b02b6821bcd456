#![allow(dead_code)]

use apiforge::app::{App, Collaborators};
use apiforge::errors::ForgeError;
use apiforge::services::auth::AuthenticatedRequest;
use apiforge::services::config::PipelineConfig;
use apiforge::services::logger::{LogCapture, Logger};
use apiforge::services::oracle::SuggestionOracle;
use apiforge::services::prompt::CredentialPrompt;
use apiforge::services::request::ApiContext;
use apiforge::services::retry::Sleeper;
use apiforge::services::transport::{HttpResponse, HttpTransport};
use apiforge::services::vault::SecretBackend;
use apiforge::stores::MemorySecretStore;
use apiforge::utils::cancel::CancelToken;
use apiforge::utils::redact::SecretRegistry;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

pub static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn tmp_dir(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

#[derive(Default)]
pub struct ScriptedOracle {
    replies: StdMutex<VecDeque<Result<String, ForgeError>>>,
    prompts: StdMutex<Vec<(String, String)>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<Result<String, ForgeError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: StdMutex::new(replies.into()),
            prompts: StdMutex::new(Vec::new()),
        })
    }

    pub fn plans(plans: Vec<Value>) -> Arc<Self> {
        Self::new(plans.into_iter().map(|p| Ok(p.to_string())).collect())
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }

    fn next(&self, op: &str, prompt: &str) -> Result<String, ForgeError> {
        self.prompts
            .lock()
            .unwrap()
            .push((op.to_string(), prompt.to_string()));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ForgeError::planner("SCRIPT_EXHAUSTED", "no scripted reply left")))
    }
}

#[async_trait]
impl SuggestionOracle for ScriptedOracle {
    async fn suggest(&self, prompt: &str) -> Result<String, ForgeError> {
        self.next("suggest", prompt)
    }

    async fn repair(&self, prompt: &str) -> Result<String, ForgeError> {
        self.next("repair", prompt)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    responses: StdMutex<VecDeque<Result<HttpResponse, ForgeError>>>,
    calls: StdMutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<HttpResponse, ForgeError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
            calls: StdMutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &AuthenticatedRequest) -> Result<HttpResponse, ForgeError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method().to_string(),
            url: request.url().to_string(),
            headers: request.headers().clone(),
            query: request.query().to_vec(),
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json_response(200, serde_json::json!({}))))
    }
}

pub fn json_response(status: u16, body: Value) -> HttpResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    HttpResponse {
        status,
        headers,
        body,
        truncated: false,
    }
}

pub fn text_response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: BTreeMap::new(),
        body: Value::String(body.to_string()),
        truncated: false,
    }
}

#[derive(Default)]
pub struct ScriptedPrompt {
    answers: StdMutex<VecDeque<Option<String>>>,
    asked: StdMutex<Vec<String>>,
    cancel_on_ask: StdMutex<Option<CancelToken>>,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<Option<&str>>) -> Arc<Self> {
        Arc::new(Self {
            answers: StdMutex::new(answers.into_iter().map(|a| a.map(str::to_string)).collect()),
            asked: StdMutex::new(Vec::new()),
            cancel_on_ask: StdMutex::new(None),
        })
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }

    pub fn cancel_when_asked(&self, token: CancelToken) {
        *self.cancel_on_ask.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl CredentialPrompt for ScriptedPrompt {
    async fn request_credential(&self, service: &str, _api: Option<&ApiContext>) -> Option<String> {
        self.asked.lock().unwrap().push(service.to_string());
        if let Some(token) = self.cancel_on_ask.lock().unwrap().as_ref() {
            token.cancel();
        }
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

#[derive(Default)]
pub struct InstantSleeper {
    slept: StdMutex<Vec<u64>>,
}

impl InstantSleeper {
    pub fn slept(&self) -> Vec<u64> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration.as_millis() as u64);
    }
}

pub struct Harness {
    pub app: App,
    pub logs: LogCapture,
    pub oracle: Arc<ScriptedOracle>,
    pub transport: Arc<ScriptedTransport>,
    pub prompt: Arc<ScriptedPrompt>,
    pub sleeper: Arc<InstantSleeper>,
}

pub fn harness(
    oracle: Arc<ScriptedOracle>,
    transport: Arc<ScriptedTransport>,
    prompt: Arc<ScriptedPrompt>,
    config: PipelineConfig,
) -> Harness {
    harness_with_backend(
        oracle,
        transport,
        prompt,
        config,
        Arc::new(MemorySecretStore::new()),
    )
}

pub fn harness_with_backend(
    oracle: Arc<ScriptedOracle>,
    transport: Arc<ScriptedTransport>,
    prompt: Arc<ScriptedPrompt>,
    config: PipelineConfig,
    backend: Arc<dyn SecretBackend>,
) -> Harness {
    let (logger, logs) = Logger::capturing("test", SecretRegistry::new());
    let sleeper = Arc::new(InstantSleeper::default());
    let app = App::assemble(
        logger,
        config,
        Collaborators {
            backend,
            oracle: oracle.clone(),
            transport: transport.clone(),
            sleeper: sleeper.clone(),
            prompt: prompt.clone(),
        },
    )
    .expect("assemble app");
    Harness {
        app,
        logs,
        oracle,
        transport,
        prompt,
        sleeper,
    }
}

pub fn plan(method: &str, url: &str, params: Value, auth: Option<(&str, &str)>) -> Value {
    let auth = auth
        .map(|(service, scheme)| serde_json::json!({"service": service, "scheme": scheme}))
        .unwrap_or(Value::Null);
    serde_json::json!({
        "api": {
            "name": "Example API",
            "documentation": "https://docs.example.com",
            "auth": auth,
        },
        "request": {
            "method": method,
            "url": url,
            "headers": {},
            "params": params,
            "body": null,
        },
        "suggested_fixes": [],
    })
}
