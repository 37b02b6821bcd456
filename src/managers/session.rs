use crate::services::request::{ApiContext, RequestSnapshot};
use crate::services::retry::{FailureKind, Outcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Planning,
    Validating,
    Authenticating,
    Executing,
    Replanning,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub index: usize,
    pub plan_round: usize,
    pub network_attempt: usize,
    pub request: RequestSnapshot,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionFailureKind {
    ValidationError,
    MissingCredential,
    PlannerError,
    VaultWriteError,
    Timeout,
    NetworkError,
    ServerError,
    RateLimited,
    ClientError,
    Cancelled,
}

impl SessionFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionFailureKind::ValidationError => "ValidationError",
            SessionFailureKind::MissingCredential => "MissingCredential",
            SessionFailureKind::PlannerError => "PlannerError",
            SessionFailureKind::VaultWriteError => "VaultWriteError",
            SessionFailureKind::Timeout => "Timeout",
            SessionFailureKind::NetworkError => "NetworkError",
            SessionFailureKind::ServerError => "ServerError",
            SessionFailureKind::RateLimited => "RateLimited",
            SessionFailureKind::ClientError => "ClientError",
            SessionFailureKind::Cancelled => "Cancelled",
        }
    }
}

impl From<FailureKind> for SessionFailureKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => SessionFailureKind::Timeout,
            FailureKind::NetworkError => SessionFailureKind::NetworkError,
            FailureKind::ServerError => SessionFailureKind::ServerError,
            FailureKind::RateLimited => SessionFailureKind::RateLimited,
            FailureKind::ClientError => SessionFailureKind::ClientError,
            FailureKind::Cancelled => SessionFailureKind::Cancelled,
        }
    }
}

impl fmt::Display for SessionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionFailure {
    pub kind: SessionFailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggested_fixes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded { http_status: u16, body: Value },
    Failed(SessionFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub goal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiContext>,
    pub state: SessionState,
    pub transitions: Vec<Transition>,
    pub attempts: Vec<Attempt>,
    pub diagnostics: Vec<String>,
    pub replans_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(goal: &str, api_hint: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            api_hint: api_hint.map(str::to_string),
            api: None,
            state: SessionState::Planning,
            transitions: vec![Transition {
                state: SessionState::Planning,
                note: None,
                at: now,
            }],
            attempts: Vec::new(),
            diagnostics: Vec::new(),
            replans_used: 0,
            outcome: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub(crate) fn transition(&mut self, state: SessionState, note: Option<String>) {
        // Repeated entry into Planning at start is folded.
        if state == self.state && note.is_none() && self.transitions.len() == 1 {
            return;
        }
        self.state = state;
        self.transitions.push(Transition {
            state,
            note,
            at: Utc::now(),
        });
    }

    pub(crate) fn record_attempt(
        &mut self,
        plan_round: usize,
        network_attempt: usize,
        request: RequestSnapshot,
        outcome: Outcome,
        elapsed_ms: u64,
    ) {
        self.attempts.push(Attempt {
            index: self.attempts.len() + 1,
            plan_round,
            network_attempt,
            request,
            outcome,
            elapsed_ms,
        });
    }

    pub(crate) fn finish(mut self, outcome: SessionOutcome) -> Self {
        let state = match outcome {
            SessionOutcome::Succeeded { .. } => SessionState::Succeeded,
            SessionOutcome::Failed(_) => SessionState::Failed,
        };
        let note = match &outcome {
            SessionOutcome::Failed(failure) => Some(failure.kind.to_string()),
            SessionOutcome::Succeeded { http_status, .. } => Some(format!("HTTP {}", http_status)),
        };
        self.transition(state, note);
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(SessionOutcome::Succeeded { .. }))
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        match &self.outcome {
            Some(SessionOutcome::Failed(failure)) => Some(failure),
            _ => None,
        }
    }

    pub fn visited(&self, state: SessionState) -> bool {
        self.transitions.iter().any(|t| t.state == state)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn summary(&self) -> String {
        let mut out = Vec::new();
        let attempts = self.attempts.len();
        match &self.outcome {
            Some(SessionOutcome::Succeeded { http_status, body }) => {
                out.push(format!(
                    "Session {}: Succeeded (HTTP {}) after {} attempt(s)",
                    self.id, http_status, attempts
                ));
                if let Some(api) = &self.api {
                    out.push(format!("API: {}", api.name));
                }
                let rendered = serde_json::to_string_pretty(body).unwrap_or_default();
                out.push(format!("Response:\n{}", rendered));
            }
            Some(SessionOutcome::Failed(failure)) => {
                out.push(format!(
                    "Session {}: Failed [{}] {}",
                    self.id, failure.kind, failure.message
                ));
                if let Some(request) = &failure.request {
                    out.push(format!("Request: {}", request));
                }
                if let Some(analysis) = &failure.error_description {
                    out.push(format!("Planner analysis: {}", analysis));
                }
                if !failure.suggested_fixes.is_empty() {
                    out.push("Suggested fixes:".to_string());
                    for fix in &failure.suggested_fixes {
                        out.push(format!("- {}", fix));
                    }
                }
                out.push(format!(
                    "Attempts: {}, re-plans used: {}",
                    attempts, self.replans_used
                ));
            }
            None => out.push(format!("Session {}: {:?}", self.id, self.state)),
        }
        out.join("\n")
    }
}
