use crate::errors::{ErrorKind, ForgeError};
use crate::managers::session::{
    Session, SessionFailure, SessionFailureKind, SessionOutcome, SessionState,
};
use crate::services::auth::inject_credential;
use crate::services::config::PipelineConfig;
use crate::services::logger::Logger;
use crate::services::planner::{ParsedPlan, RequestPlanner};
use crate::services::prompt::CredentialPrompt;
use crate::services::request::{AuthRequirement, RequestSnapshot};
use crate::services::retry::{Outcome, RetryController};
use crate::services::validation::{RequestValidator, Violation};
use crate::services::vault::{
    Credential, CredentialCheck, CredentialMetadata, CredentialVault, Secret,
};
use crate::utils::cancel::CancelToken;
use crate::utils::redact::SecretRegistry;
use std::collections::HashSet;
use std::sync::Arc;

struct Repair {
    previous: RequestSnapshot,
    diagnostic: String,
}

#[derive(Default)]
struct RunState {
    declined: HashSet<String>,
    prompts_used: usize,
    plan_round: usize,
    suggested_fixes: Vec<String>,
    error_description: Option<String>,
}

enum CredentialResolution {
    Ready(Credential),
    Declined(String),
    Failed(SessionFailure),
}

pub struct Orchestrator {
    logger: Logger,
    config: PipelineConfig,
    planner: RequestPlanner,
    validator: RequestValidator,
    vault: Arc<CredentialVault>,
    retry: RetryController,
    prompt: Arc<dyn CredentialPrompt>,
}

impl Orchestrator {
    pub fn new(
        logger: Logger,
        config: PipelineConfig,
        planner: RequestPlanner,
        validator: RequestValidator,
        vault: Arc<CredentialVault>,
        retry: RetryController,
        prompt: Arc<dyn CredentialPrompt>,
    ) -> Self {
        Self {
            logger: logger.child("orchestrator"),
            config,
            planner,
            validator,
            vault,
            retry,
            prompt,
        }
    }

    fn secrets(&self) -> &SecretRegistry {
        self.logger.secrets()
    }

    pub async fn run(&self, goal: &str, api_hint: Option<&str>, cancel: &CancelToken) -> Session {
        let mut session = Session::new(goal, api_hint);
        let mut run = RunState::default();
        let mut repair: Option<Repair> = None;
        self.logger.info(
            "Session started",
            Some(&serde_json::json!({"session": session.id, "api_hint": api_hint})),
        );

        loop {
            if cancel.is_cancelled() {
                return self.close(session, self.cancelled(&run, repair.as_ref()));
            }

            // Planning
            session.transition(SessionState::Planning, None);
            run.plan_round += 1;
            let plan = match self.plan(&mut session, goal, api_hint, repair.as_ref(), cancel).await {
                Ok(plan) => plan,
                Err(failure) => return self.close(session, failure),
            };
            if let Some(api) = plan.api.clone() {
                session.api = Some(api);
            }
            if !plan.suggested_fixes.is_empty() {
                run.suggested_fixes = plan
                    .suggested_fixes
                    .iter()
                    .map(|fix| self.secrets().redact(fix))
                    .collect();
            }
            if let Some(description) = &plan.error_description {
                run.error_description = Some(self.secrets().redact(description));
            }
            let mut candidate = plan.candidate;
            if candidate.auth.is_none() {
                candidate.auth = session.api.as_ref().and_then(|a| a.auth.clone());
            }
            let candidate_snapshot = RequestSnapshot::from_candidate(&candidate, self.secrets());

            // Validating
            session.transition(SessionState::Validating, None);
            let validated = match self.validator.validate(&candidate) {
                Ok(validated) => {
                    session.transition(SessionState::Authenticating, None);
                    Ok(validated)
                }
                Err(err) => match err.into_pending() {
                    Ok((validated, violations)) => {
                        let note = violations
                            .iter()
                            .map(credential_note)
                            .collect::<Vec<_>>()
                            .join(", ");
                        session.diagnostics.extend(
                            violations.iter().map(|v| self.secrets().redact(&v.to_string())),
                        );
                        session.transition(SessionState::Authenticating, Some(note));
                        Ok(validated)
                    }
                    Err(err) => Err(err),
                },
            };
            let validated = match validated {
                Ok(validated) => validated,
                Err(err) => {
                    let diagnostic = self.secrets().redact(&err.messages().join("\n"));
                    match self.replan(
                        &mut session,
                        &run,
                        SessionFailureKind::ValidationError,
                        diagnostic,
                        candidate_snapshot,
                    ) {
                        Ok(next) => {
                            repair = Some(next);
                            continue;
                        }
                        Err(failure) => return self.close(session, failure),
                    }
                }
            };
            let snapshot = RequestSnapshot::from_validated(&validated, self.secrets());

            // Authenticating
            let credential = match validated.auth().cloned() {
                None => None,
                Some(requirement) => {
                    match self
                        .resolve_credential(&mut session, &mut run, &requirement, cancel)
                        .await
                    {
                        CredentialResolution::Ready(credential) => Some(credential),
                        CredentialResolution::Failed(mut failure) => {
                            failure.request = Some(snapshot);
                            return self.close(session, SessionOutcome::Failed(failure));
                        }
                        CredentialResolution::Declined(diagnostic) => {
                            match self.replan(
                                &mut session,
                                &run,
                                SessionFailureKind::MissingCredential,
                                diagnostic,
                                snapshot,
                            ) {
                                Ok(next) => {
                                    repair = Some(next);
                                    continue;
                                }
                                Err(failure) => return self.close(session, failure),
                            }
                        }
                    }
                }
            };

            // Executing
            let remaining = self
                .config
                .max_trace_attempts
                .saturating_sub(session.attempts.len());
            if remaining == 0 {
                let failure = self.failure(
                    &run,
                    last_failure_kind(&session),
                    "attempt trace is full",
                    Some(snapshot),
                );
                return self.close(session, failure);
            }
            let execution = {
                let request = match inject_credential(&validated, credential.as_ref()) {
                    Ok(request) => request,
                    Err(err) => {
                        let failure = self.failure(
                            &run,
                            SessionFailureKind::MissingCredential,
                            &err.message,
                            Some(snapshot),
                        );
                        return self.close(session, failure);
                    }
                };
                session.transition(SessionState::Executing, None);
                self.retry.execute_bounded(&request, cancel, remaining).await
            };
            drop(credential);

            for call in &execution.calls {
                session.record_attempt(
                    run.plan_round,
                    call.attempt,
                    snapshot.clone(),
                    self.redact_outcome(&call.outcome),
                    call.elapsed_ms,
                );
            }

            match self.redact_outcome(&execution.outcome) {
                Outcome::Success { status, body } => {
                    return self.close(
                        session,
                        SessionOutcome::Succeeded {
                            http_status: status,
                            body,
                        },
                    );
                }
                Outcome::Failure { kind, message, .. } => {
                    let kind = SessionFailureKind::from(kind);
                    match kind {
                        SessionFailureKind::ClientError => {
                            let diagnostic = format!(
                                "The API rejected the request ({}): {}",
                                kind, message
                            );
                            match self.replan(&mut session, &run, kind, diagnostic, snapshot) {
                                Ok(next) => {
                                    repair = Some(next);
                                    continue;
                                }
                                Err(failure) => return self.close(session, failure),
                            }
                        }
                        _ => {
                            session.diagnostics.push(message.clone());
                            let failure = self.failure(&run, kind, &message, Some(snapshot));
                            return self.close(session, failure);
                        }
                    }
                }
            }
        }
    }

    async fn plan(
        &self,
        session: &mut Session,
        goal: &str,
        api_hint: Option<&str>,
        repair: Option<&Repair>,
        cancel: &CancelToken,
    ) -> Result<ParsedPlan, SessionOutcome> {
        let mut asks = 0;
        loop {
            asks += 1;
            let call = async {
                match repair {
                    Some(repair) => {
                        self.planner
                            .repair(goal, &repair.previous, session.api.as_ref(), &repair.diagnostic)
                            .await
                    }
                    None => self.planner.propose(goal, api_hint).await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SessionOutcome::Failed(SessionFailure {
                        kind: SessionFailureKind::Cancelled,
                        message: "session cancelled while planning".to_string(),
                        request: repair.map(|r| r.previous.clone()),
                        suggested_fixes: Vec::new(),
                        error_description: None,
                    }));
                }
                result = call => result,
            };

            let problem = match result {
                Ok(plan) if plan.candidate.is_empty() => Violation::EmptyPlan.to_string(),
                Ok(plan) => return Ok(plan),
                Err(err) => self.secrets().redact(&err.message),
            };
            session.diagnostics.push(problem.clone());
            self.logger.warn(
                "Planner re-ask",
                Some(&serde_json::json!({"ask": asks, "problem": problem})),
            );
            if asks > self.config.max_planner_retries {
                return Err(SessionOutcome::Failed(SessionFailure {
                    kind: SessionFailureKind::PlannerError,
                    message: problem,
                    request: repair.map(|r| r.previous.clone()),
                    suggested_fixes: Vec::new(),
                    error_description: None,
                }));
            }
        }
    }

    async fn resolve_credential(
        &self,
        session: &mut Session,
        run: &mut RunState,
        requirement: &AuthRequirement,
        cancel: &CancelToken,
    ) -> CredentialResolution {
        let service = requirement.service.to_lowercase();
        match self.vault.retrieve(&service) {
            Ok(Some(credential)) => {
                if self.vault.validate(&credential, &requirement.scheme).is_valid() {
                    return CredentialResolution::Ready(credential);
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.logger.warn(
                    "Credential lookup failed",
                    Some(&serde_json::json!({"service": service, "error": err.message})),
                );
            }
        }

        if run.declined.contains(&service) {
            return CredentialResolution::Failed(SessionFailure {
                kind: SessionFailureKind::MissingCredential,
                message: format!("no credential was provided for service '{}'", service),
                request: None,
                suggested_fixes: run.suggested_fixes.clone(),
                error_description: run.error_description.clone(),
            });
        }

        while run.prompts_used < self.config.max_credential_prompts {
            run.prompts_used += 1;
            let supplied = tokio::select! {
                supplied = self.prompt.request_credential(&service, session.api.as_ref()) => supplied,
                _ = cancel.cancelled() => None,
            };
            if cancel.is_cancelled() {
                return CredentialResolution::Failed(SessionFailure {
                    kind: SessionFailureKind::Cancelled,
                    message: "session cancelled while waiting for a credential".to_string(),
                    request: None,
                    suggested_fixes: run.suggested_fixes.clone(),
                    error_description: run.error_description.clone(),
                });
            }
            let Some(secret) = supplied else {
                break;
            };
            // Registered before anything else can echo it.
            self.secrets().register(&secret);
            let supplied = Credential {
                service: service.clone(),
                secret: Secret::new(secret),
                metadata: CredentialMetadata::default(),
            };
            if let CredentialCheck::Invalid(reason) =
                self.vault.validate(&supplied, &requirement.scheme)
            {
                self.logger.warn(
                    "Supplied credential rejected",
                    Some(&serde_json::json!({"service": service, "reason": reason})),
                );
                let note = format!("credential for '{}' rejected: {}", service, reason);
                session.diagnostics.push(self.secrets().redact(&note));
                continue;
            }
            match self.vault.store(&service, supplied.secret.expose(), None) {
                Ok(()) => {}
                Err(err) if err.kind == ErrorKind::VaultWrite => {
                    return CredentialResolution::Failed(self.vault_failure(run, &err));
                }
                Err(err) => {
                    session.diagnostics.push(self.secrets().redact(&err.message));
                    continue;
                }
            }
            self.logger.info(
                "Credential supplied",
                Some(&serde_json::json!({
                    "service": service,
                    "fingerprint": supplied.fingerprint(),
                })),
            );
            return CredentialResolution::Ready(supplied);
        }

        run.declined.insert(service.clone());
        let diagnostic = format!(
            "{} The user did not supply a credential for '{}'. Prefer an API that needs no credential, or one already available.",
            Violation::MissingCredential {
                service: service.clone()
            },
            service
        );
        CredentialResolution::Declined(diagnostic)
    }

    fn vault_failure(&self, run: &RunState, err: &ForgeError) -> SessionFailure {
        SessionFailure {
            kind: SessionFailureKind::VaultWriteError,
            message: self.secrets().redact(&err.message),
            request: None,
            suggested_fixes: run.suggested_fixes.clone(),
            error_description: run.error_description.clone(),
        }
    }

    fn replan(
        &self,
        session: &mut Session,
        run: &RunState,
        kind: SessionFailureKind,
        diagnostic: String,
        previous: RequestSnapshot,
    ) -> Result<Repair, SessionOutcome> {
        session.diagnostics.push(diagnostic.clone());
        if session.replans_used >= self.config.max_replans {
            self.logger.warn(
                "Re-plan budget exhausted",
                Some(&serde_json::json!({"kind": kind, "replans": session.replans_used})),
            );
            return Err(self.failure(
                run,
                kind,
                &format!("re-plan budget exhausted: {}", diagnostic),
                Some(previous),
            ));
        }
        session.replans_used += 1;
        session.transition(SessionState::Replanning, Some(kind.to_string()));
        self.logger.info(
            "Re-planning",
            Some(&serde_json::json!({"kind": kind, "replan": session.replans_used})),
        );
        Ok(Repair {
            previous,
            diagnostic,
        })
    }

    fn failure(
        &self,
        run: &RunState,
        kind: SessionFailureKind,
        message: &str,
        request: Option<RequestSnapshot>,
    ) -> SessionOutcome {
        SessionOutcome::Failed(SessionFailure {
            kind,
            message: self.secrets().redact(message),
            request,
            suggested_fixes: run.suggested_fixes.clone(),
            error_description: run.error_description.clone(),
        })
    }

    fn cancelled(&self, run: &RunState, repair: Option<&Repair>) -> SessionOutcome {
        self.failure(
            run,
            SessionFailureKind::Cancelled,
            "session cancelled",
            repair.map(|r| r.previous.clone()),
        )
    }

    fn redact_outcome(&self, outcome: &Outcome) -> Outcome {
        let secrets = self.secrets();
        match outcome {
            Outcome::Success { status, body } => Outcome::Success {
                status: *status,
                body: secrets.redact_value(body),
            },
            Outcome::Failure {
                kind,
                message,
                status,
                body,
            } => Outcome::Failure {
                kind: *kind,
                message: secrets.redact(message),
                status: *status,
                body: body.as_ref().map(|b| secrets.redact_value(b)),
            },
        }
    }

    fn close(&self, session: Session, outcome: SessionOutcome) -> Session {
        let session = session.finish(outcome);
        let meta = serde_json::json!({
            "session": session.id,
            "state": session.state,
            "attempts": session.attempts.len(),
            "replans": session.replans_used,
            "kind": session.failure().map(|f| f.kind),
        });
        if session.succeeded() {
            self.logger.info("Session succeeded", Some(&meta));
        } else {
            self.logger.warn("Session failed", Some(&meta));
        }
        session
    }
}

fn credential_note(violation: &Violation) -> String {
    match violation {
        Violation::MissingCredential { service } => format!("MissingCredential: {}", service),
        Violation::InvalidCredential { service, .. } => format!("InvalidCredential: {}", service),
        other => other.to_string(),
    }
}

fn last_failure_kind(session: &Session) -> SessionFailureKind {
    session
        .attempts
        .last()
        .and_then(|a| a.outcome.failure_kind())
        .map(SessionFailureKind::from)
        .unwrap_or(SessionFailureKind::ClientError)
}
