use crate::constants::limits::DIAGNOSTIC_BODY_CHARS;
use crate::errors::ForgeError;
use crate::services::logger::Logger;
use crate::services::oracle::SuggestionOracle;
use crate::services::request::{
    ApiContext, AuthRequirement, AuthScheme, CandidateRequest, ParamSchema, ParamSpec,
    RequestSnapshot,
};
use crate::utils::redact::truncate_for_display;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const RESPONSE_SHAPE: &str = r#"{
  "api": {
    "name": "Name of the API",
    "base_url": "https://...",
    "documentation": "URL of the API documentation",
    "auth": {"service": "short-service-name", "scheme": "bearer | basic | header:<Header-Name> | query:<param>"} or null
  },
  "request": {
    "method": "GET",
    "url": "fully resolved URL without template placeholders",
    "headers": {},
    "params": {},
    "body": null
  },
  "schema": {"<param>": {"required": true, "pattern": "date | email | url | api_key | <regex>", "allowed": ["..."]}},
  "suggested_fixes": []
}"#;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPlan {
    pub candidate: CandidateRequest,
    pub api: Option<ApiContext>,
    pub suggested_fixes: Vec<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    Parsed(ParsedPlan),
    Unparsable(String),
}

pub struct RequestPlanner {
    logger: Logger,
    oracle: Arc<dyn SuggestionOracle>,
}

impl RequestPlanner {
    pub fn new(logger: Logger, oracle: Arc<dyn SuggestionOracle>) -> Self {
        Self {
            logger: logger.child("planner"),
            oracle,
        }
    }

    pub async fn propose(&self, goal: &str, api_hint: Option<&str>) -> Result<ParsedPlan, ForgeError> {
        let prompt = propose_prompt(goal, api_hint);
        let raw = self.oracle.suggest(&prompt).await?;
        self.accept(raw)
    }

    pub async fn repair(
        &self,
        goal: &str,
        previous: &RequestSnapshot,
        api: Option<&ApiContext>,
        diagnostic: &str,
    ) -> Result<ParsedPlan, ForgeError> {
        let prompt = repair_prompt(goal, previous, api, diagnostic);
        let raw = self.oracle.repair(&prompt).await?;
        self.accept(raw)
    }

    fn accept(&self, raw: String) -> Result<ParsedPlan, ForgeError> {
        match parse_plan(&raw) {
            PlannerOutput::Parsed(plan) => {
                self.logger.debug(
                    "Plan parsed",
                    Some(&serde_json::json!({
                        "method": plan.candidate.method,
                        "api": plan.api.as_ref().map(|a| a.name.clone()),
                    })),
                );
                Ok(plan)
            }
            PlannerOutput::Unparsable(text) => {
                self.logger.warn(
                    "Oracle output is not a request plan",
                    Some(&serde_json::json!({"chars": text.len()})),
                );
                Err(ForgeError::planner(
                    "PLAN_UNPARSABLE",
                    "Suggestion oracle returned output that is not a JSON request plan",
                )
                .with_details(serde_json::json!({
                    "raw": truncate_for_display(&text, DIAGNOSTIC_BODY_CHARS)
                })))
            }
        }
    }
}

fn propose_prompt(goal: &str, api_hint: Option<&str>) -> String {
    let hint = api_hint
        .map(|h| format!("\nThe user prefers this API: {}\n", h))
        .unwrap_or_default();
    format!(
        "As an API expert, analyze this user request: \"{goal}\"\n{hint}\n\
         Identify the most suitable public API, then produce one concrete HTTP request \
         that fulfils the request. Resolve every URL template placeholder with a real value. \
         Never include credential values; declare the auth requirement instead.\n\n\
         Return a JSON object with this structure:\n{shape}\n",
        goal = goal,
        hint = hint,
        shape = RESPONSE_SHAPE
    )
}

fn repair_prompt(
    goal: &str,
    previous: &RequestSnapshot,
    api: Option<&ApiContext>,
    diagnostic: &str,
) -> String {
    let previous_json = serde_json::to_string_pretty(previous).unwrap_or_default();
    let api_line = api
        .map(|a| format!("Selected API: {}\n", a.name))
        .unwrap_or_default();
    format!(
        "The previous request for the goal \"{goal}\" failed.\n{api_line}\n\
         Previous request:\n{previous}\n\n\
         What went wrong:\n{diagnostic}\n\n\
         Produce a corrected request. List the changes you made in \"suggested_fixes\" and \
         describe the failure in \"error_description\".\n\n\
         Return a JSON object with this structure:\n{shape}\n",
        goal = goal,
        api_line = api_line,
        previous = previous_json,
        diagnostic = diagnostic,
        shape = RESPONSE_SHAPE
    )
}

pub fn parse_plan(raw: &str) -> PlannerOutput {
    let stripped = raw.replace("```json", "").replace("```JSON", "").replace("```", "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return PlannerOutput::Parsed(ParsedPlan::default());
    }
    let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
        return PlannerOutput::Unparsable(raw.to_string());
    };
    if end < start {
        return PlannerOutput::Unparsable(raw.to_string());
    }
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(&trimmed[start..=end]) else {
        return PlannerOutput::Unparsable(raw.to_string());
    };

    let api = root.get("api").and_then(Value::as_object).map(read_api);
    let request = match root.get("request") {
        Some(Value::Object(request)) => request.clone(),
        Some(Value::Null) => Map::new(),
        Some(_) => return PlannerOutput::Unparsable(raw.to_string()),
        None if root.contains_key("url") || root.contains_key("method") => root.clone(),
        None => Map::new(),
    };

    let auth = request
        .get("auth")
        .and_then(|v| read_auth(v, api.as_ref().map(|a| a.name.as_str())))
        .or_else(|| api.as_ref().and_then(|a| a.auth.clone()));
    let schema = root
        .get("schema")
        .or_else(|| request.get("schema"))
        .and_then(Value::as_object)
        .map(read_schema);

    let candidate = CandidateRequest {
        method: text_field(&request, "method"),
        url: text_field(&request, "url"),
        headers: request
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), scalar_text(v)))
                    .collect()
            })
            .unwrap_or_default(),
        params: request
            .get("params")
            .and_then(Value::as_object)
            .map(|params| params.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
        body: request.get("body").cloned().filter(|b| !b.is_null()),
        auth,
        schema,
    };

    let suggested_fixes = root
        .get("suggested_fixes")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let error_description = root
        .get("error_description")
        .and_then(Value::as_str)
        .map(str::to_string);

    PlannerOutput::Parsed(ParsedPlan {
        candidate,
        api,
        suggested_fixes,
        error_description,
    })
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).map(scalar_text).unwrap_or_default()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn read_api(map: &Map<String, Value>) -> ApiContext {
    let name = text_field(map, "name");
    let optional = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let auth = map
        .get("auth")
        .and_then(|v| read_auth(v, Some(&name)))
        .or_else(|| {
            map.get("authentication_method")
                .and_then(|v| read_auth(v, Some(&name)))
        });
    ApiContext {
        base_url: optional("base_url"),
        documentation: optional("documentation"),
        notes: optional("why_best_choice"),
        auth,
        name,
    }
}

fn service_slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.split('-').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("-")
}

fn read_auth(value: &Value, api_name: Option<&str>) -> Option<AuthRequirement> {
    let (service, scheme_text) = match value {
        Value::Object(map) => (
            map.get("service").and_then(Value::as_str).map(str::to_string),
            map.get("scheme")
                .or_else(|| map.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)?,
        ),
        Value::String(text) => (None, text.clone()),
        _ => return None,
    };
    let lowered = scheme_text.trim().to_lowercase();
    if lowered.is_empty() || lowered == "none" || lowered.starts_with("no ") {
        return None;
    }
    let scheme = AuthScheme::parse(&scheme_text).or_else(|| {
        if lowered.contains("bearer") || lowered.contains("oauth") {
            Some(AuthScheme::Bearer)
        } else if lowered.contains("basic") {
            Some(AuthScheme::Basic)
        } else if lowered.contains("header") {
            Some(AuthScheme::Header {
                name: "X-API-Key".to_string(),
            })
        } else if lowered.contains("key") {
            Some(AuthScheme::Query {
                param: "api_key".to_string(),
            })
        } else {
            None
        }
    })?;
    let service = service
        .map(|s| service_slug(&s))
        .filter(|s| !s.is_empty())
        .or_else(|| api_name.map(service_slug).filter(|s| !s.is_empty()))?;
    Some(AuthRequirement { service, scheme })
}

fn read_schema(map: &Map<String, Value>) -> ParamSchema {
    let mut schema = BTreeMap::new();
    for (name, entry) in map {
        let spec = match entry {
            Value::Object(_) => serde_json::from_value::<ParamSpec>(entry.clone()).ok(),
            Value::Bool(required) => Some(ParamSpec {
                required: *required,
                ..Default::default()
            }),
            _ => None,
        };
        if let Some(spec) = spec {
            schema.insert(name.clone(), spec);
        }
    }
    schema
}
