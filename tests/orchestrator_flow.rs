mod common;
use common::{
    harness, harness_with_backend, json_response, plan, text_response, ScriptedOracle,
    ScriptedPrompt, ScriptedTransport,
};

use apiforge::errors::ForgeError;
use apiforge::managers::session::{SessionFailureKind, SessionState};
use apiforge::services::config::PipelineConfig;
use apiforge::services::retry::FailureKind;
use apiforge::services::vault::SecretBackend;
use apiforge::utils::cancel::CancelToken;
use std::sync::Arc;

fn position(session: &apiforge::managers::session::Session, state: SessionState) -> usize {
    session
        .transitions
        .iter()
        .position(|t| t.state == state)
        .unwrap_or_else(|| panic!("{:?} never visited", state))
}

#[tokio::test]
async fn missing_weather_key_is_prompted_stored_and_used() {
    let key = "abcd1234efgh5678ijkl9012";
    let h = harness(
        ScriptedOracle::plans(vec![plan(
            "GET",
            "https://api.openweathermap.org/data/2.5/weather",
            serde_json::json!({"q": "London", "units": "metric"}),
            Some(("openweather", "query:appid")),
        )]),
        ScriptedTransport::new(vec![Ok(json_response(
            200,
            serde_json::json!({"main": {"temp": 18.5}}),
        ))]),
        ScriptedPrompt::new(vec![Some(key)]),
        PipelineConfig::default(),
    );

    let session = h
        .app
        .orchestrator
        .run("get current temperature for a city", None, &CancelToken::new())
        .await;

    assert!(session.succeeded(), "{}", session.summary());
    let auth = &session.transitions[position(&session, SessionState::Authenticating)];
    assert!(auth
        .note
        .as_deref()
        .unwrap_or_default()
        .contains("MissingCredential"));
    assert!(position(&session, SessionState::Authenticating) < position(&session, SessionState::Executing));
    assert!(position(&session, SessionState::Executing) < position(&session, SessionState::Succeeded));
    assert_eq!(h.prompt.asked(), vec!["openweather".to_string()]);
    assert_eq!(session.attempts.len(), 1);

    let calls = h.transport.calls();
    assert!(calls[0]
        .query
        .contains(&("appid".to_string(), key.to_string())));
    assert!(h.app.vault.retrieve("openweather").unwrap().is_some());
    assert!(!session.to_json().to_string().contains(key));
}

#[tokio::test]
async fn invalid_method_is_fed_back_to_the_planner() {
    let h = harness(
        ScriptedOracle::plans(vec![
            plan("FETCH", "https://api.example.com/items", serde_json::json!({}), None),
            plan("GET", "https://api.example.com/items", serde_json::json!({}), None),
        ]),
        ScriptedTransport::new(vec![Ok(json_response(200, serde_json::json!([1, 2])))]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig::default(),
    );

    let session = h
        .app
        .orchestrator
        .run("list items", None, &CancelToken::new())
        .await;

    assert!(session.succeeded());
    assert!(session.visited(SessionState::Replanning));
    assert_eq!(session.replans_used, 1);
    let prompts = h.oracle.prompts();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1].0, "repair");
    assert!(prompts[1].1.contains("invalid HTTP method 'FETCH'"));
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn three_server_errors_fail_with_three_attempts() {
    let h = harness(
        ScriptedOracle::plans(vec![plan(
            "GET",
            "https://api.example.com/status",
            serde_json::json!({}),
            None,
        )]),
        ScriptedTransport::new(vec![
            Ok(text_response(500, "boom")),
            Ok(text_response(500, "boom")),
            Ok(text_response(500, "boom")),
        ]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig::default(),
    );

    let session = h
        .app
        .orchestrator
        .run("check status", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::ServerError);
    assert_eq!(session.attempts.len(), 3);
    assert!(session
        .attempts
        .iter()
        .all(|a| a.outcome.failure_kind() == Some(FailureKind::ServerError)));
    assert!(!session.visited(SessionState::Replanning));
    assert_eq!(h.sleeper.slept(), vec![250, 500]);
}

#[tokio::test]
async fn client_error_replans_without_network_retry() {
    let h = harness(
        ScriptedOracle::plans(vec![
            plan("GET", "https://api.example.com/v1/usr", serde_json::json!({}), None),
            plan("GET", "https://api.example.com/v1/users", serde_json::json!({}), None),
        ]),
        ScriptedTransport::new(vec![
            Ok(json_response(404, serde_json::json!({"error": "no such route"}))),
            Ok(json_response(200, serde_json::json!({"users": []}))),
        ]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig::default(),
    );

    let session = h
        .app
        .orchestrator
        .run("list users", None, &CancelToken::new())
        .await;

    assert!(session.succeeded());
    assert_eq!(session.attempts.len(), 2);
    assert_eq!(session.attempts[0].network_attempt, 1);
    assert_eq!(session.attempts[1].plan_round, 2);
    assert!(h.sleeper.slept().is_empty());
    assert!(h.oracle.prompts()[1].1.contains("no such route"));
}

#[tokio::test]
async fn secret_never_reaches_trace_logs_or_planner() {
    let secret = "supersecret-value-0123456789";
    let config = PipelineConfig {
        max_replans: 1,
        ..PipelineConfig::default()
    };
    let reply = plan(
        "GET",
        "https://api.acme.test/me",
        serde_json::json!({}),
        Some(("acme", "bearer")),
    );
    let h = harness(
        ScriptedOracle::plans(vec![reply.clone(), reply]),
        ScriptedTransport::new(vec![
            Ok(text_response(401, &format!("invalid token {}", secret))),
            Ok(text_response(401, &format!("invalid token {}", secret))),
        ]),
        ScriptedPrompt::new(vec![]),
        config,
    );
    h.app.vault.store("acme", secret, None).unwrap();

    let session = h
        .app
        .orchestrator
        .run("who am I", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::ClientError);
    assert_eq!(session.attempts.len(), 2);
    assert_eq!(
        h.transport.calls()[0].headers.get("Authorization").map(String::as_str),
        Some(format!("Bearer {}", secret).as_str())
    );

    assert!(!session.to_json().to_string().contains(secret));
    assert!(!session.summary().contains(secret));
    assert!(!h.logs.joined().contains(secret));
    for (_, prompt) in h.oracle.prompts() {
        assert!(!prompt.contains(secret));
    }
}

#[tokio::test]
async fn secret_echoed_at_the_preview_boundary_is_not_leaked() {
    let secret = "SUPERSECRET-bearer-token-0123456";
    let echoed = format!("{}{}", "x".repeat(990), secret);
    let reply = plan(
        "GET",
        "https://api.acme.test/me",
        serde_json::json!({}),
        Some(("acme", "bearer")),
    );
    let h = harness(
        ScriptedOracle::plans(vec![reply.clone(), reply]),
        ScriptedTransport::new(vec![
            Ok(text_response(401, &echoed)),
            Ok(text_response(401, &echoed)),
        ]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig {
            max_replans: 1,
            ..PipelineConfig::default()
        },
    );
    h.app.vault.store("acme", secret, None).unwrap();

    let session = h
        .app
        .orchestrator
        .run("who am I", None, &CancelToken::new())
        .await;

    assert_eq!(
        session.failure().map(|f| f.kind),
        Some(SessionFailureKind::ClientError)
    );
    let prefix = &secret[..10];
    assert!(!session.to_json().to_string().contains(prefix));
    assert!(!session.summary().contains(prefix));
    assert!(!h.logs.joined().contains(prefix));
    for (_, prompt) in h.oracle.prompts() {
        assert!(!prompt.contains(prefix));
    }
}

#[tokio::test]
async fn declined_credential_fails_when_requested_again() {
    let reply = plan(
        "GET",
        "https://newsapi.example.com/v2/top",
        serde_json::json!({"country": "us"}),
        Some(("newsapi", "header:X-Api-Key")),
    );
    let h = harness(
        ScriptedOracle::plans(vec![reply.clone(), reply]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![None]),
        PipelineConfig::default(),
    );

    let session = h
        .app
        .orchestrator
        .run("top headlines", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::MissingCredential);
    assert_eq!(h.prompt.asked().len(), 1);
    assert_eq!(session.replans_used, 1);
    assert!(h.transport.calls().is_empty());
    assert!(h.oracle.prompts()[1].1.contains("newsapi"));
}

#[tokio::test]
async fn unparsable_planner_output_is_reasked_then_fails() {
    let h = harness(
        ScriptedOracle::new(vec![
            Ok("I am not sure".to_string()),
            Err(ForgeError::planner("ORACLE_UNREACHABLE", "connection refused")),
            Ok("   ".to_string()),
        ]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig::default(),
    );

    let session = h
        .app
        .orchestrator
        .run("do something", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::PlannerError);
    assert_eq!(h.oracle.prompts().len(), 3);
    assert!(session.attempts.is_empty());
    assert!(session
        .diagnostics
        .iter()
        .any(|d| d.contains("empty request")));
}

#[tokio::test]
async fn replan_budget_is_enforced() {
    let bad = plan("GET", "https://api.example.com/{id}", serde_json::json!({}), None);
    let config = PipelineConfig {
        max_replans: 2,
        ..PipelineConfig::default()
    };
    let h = harness(
        ScriptedOracle::plans(vec![bad.clone(), bad.clone(), bad]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![]),
        config,
    );

    let session = h
        .app
        .orchestrator
        .run("fetch a thing", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::ValidationError);
    assert!(failure.message.contains("re-plan budget exhausted"));
    assert_eq!(session.replans_used, 2);
    assert_eq!(h.oracle.prompts().len(), 3);
}

struct BrokenBackend;

impl SecretBackend for BrokenBackend {
    fn set(&self, _key: &str, _value: &str) -> Result<(), ForgeError> {
        Err(ForgeError::denied("keyring locked"))
    }

    fn get(&self, _key: &str) -> Result<Option<String>, ForgeError> {
        Ok(None)
    }

    fn delete(&self, _key: &str) -> Result<bool, ForgeError> {
        Ok(false)
    }

    fn keys(&self) -> Result<Vec<String>, ForgeError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn vault_write_failure_is_terminal() {
    let h = harness_with_backend(
        ScriptedOracle::plans(vec![plan(
            "GET",
            "https://api.example.com/data",
            serde_json::json!({}),
            Some(("example", "bearer")),
        )]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![Some("tok-abcdefgh-12345")]),
        PipelineConfig::default(),
        Arc::new(BrokenBackend),
    );

    let session = h
        .app
        .orchestrator
        .run("get data", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::VaultWriteError);
    assert!(h.transport.calls().is_empty());
    assert!(!session.to_json().to_string().contains("tok-abcdefgh-12345"));
}

#[tokio::test]
async fn cancelled_session_never_calls_out() {
    let h = harness(
        ScriptedOracle::plans(vec![plan(
            "GET",
            "https://api.example.com/data",
            serde_json::json!({}),
            None,
        )]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig::default(),
    );
    let cancel = CancelToken::new();
    cancel.cancel();

    let session = h.app.orchestrator.run("get data", None, &cancel).await;

    assert_eq!(
        session.failure().map(|f| f.kind),
        Some(SessionFailureKind::Cancelled)
    );
    assert!(h.oracle.prompts().is_empty());
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn rejected_credential_is_not_stored() {
    let original = "shortkey1";
    let h = harness(
        ScriptedOracle::plans(vec![plan(
            "GET",
            "https://api.example.com/data",
            serde_json::json!({}),
            Some(("example", "header:X-Api-Key")),
        )]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![Some("bad key with spaces"), None]),
        PipelineConfig {
            max_replans: 0,
            ..PipelineConfig::default()
        },
    );
    h.app.vault.store("example", original, None).unwrap();

    let session = h
        .app
        .orchestrator
        .run("get data", None, &CancelToken::new())
        .await;

    assert_eq!(
        session.failure().map(|f| f.kind),
        Some(SessionFailureKind::MissingCredential)
    );
    assert_eq!(h.prompt.asked().len(), 2);
    let stored = h.app.vault.retrieve("example").unwrap().expect("original entry");
    assert_eq!(stored.secret.expose(), original);
    assert!(session
        .diagnostics
        .iter()
        .any(|d| d.contains("credential for 'example' rejected")));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn cancel_during_credential_prompt_reports_cancelled() {
    let h = harness(
        ScriptedOracle::plans(vec![plan(
            "GET",
            "https://api.example.com/data",
            serde_json::json!({}),
            Some(("example", "bearer")),
        )]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![None]),
        PipelineConfig {
            max_replans: 0,
            ..PipelineConfig::default()
        },
    );
    let cancel = CancelToken::new();
    h.prompt.cancel_when_asked(cancel.clone());

    let session = h.app.orchestrator.run("get data", None, &cancel).await;

    assert_eq!(
        session.failure().map(|f| f.kind),
        Some(SessionFailureKind::Cancelled)
    );
    assert_eq!(session.replans_used, 0);
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn planner_error_description_reaches_the_summary() {
    let mut reply = plan("GET", "https://api.example.com/{id}", serde_json::json!({}), None);
    reply["error_description"] = serde_json::json!("the item id was not known");
    let h = harness(
        ScriptedOracle::plans(vec![reply]),
        ScriptedTransport::new(vec![]),
        ScriptedPrompt::new(vec![]),
        PipelineConfig {
            max_replans: 0,
            ..PipelineConfig::default()
        },
    );

    let session = h
        .app
        .orchestrator
        .run("fetch a thing", None, &CancelToken::new())
        .await;

    let failure = session.failure().expect("failed session");
    assert_eq!(failure.kind, SessionFailureKind::ValidationError);
    assert_eq!(
        failure.error_description.as_deref(),
        Some("the item id was not known")
    );
    assert!(session
        .summary()
        .contains("Planner analysis: the item id was not known"));
}
