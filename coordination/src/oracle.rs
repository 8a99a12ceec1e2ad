//! Reasoning oracle adapter
//!
//! The oracle is the one place the core tolerates non-determinism. It is
//! consulted for progress judgements, recovery decisions and consultant
//! selection. Requests go out as structured JSON and replies come back as
//! JSON data; callers validate the reply and fall back to their most
//! conservative outcome when it is missing or malformed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from oracle calls
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle request failed: {0}")]
    RequestFailed(String),

    #[error("Oracle returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// One prior attempt as the oracle sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub progress: Value,
    pub timestamp: String,
}

/// Candidate agent offered for a consultation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub agent_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

/// Structured prompt context sent to the oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleRequest {
    /// Did the latest attempt move toward the goal?
    ProgressEvaluation {
        goal: String,
        attempt_history: Vec<AttemptSummary>,
        current_attempt: AttemptSummary,
        /// Highest similarity between the current failure and any prior one
        closest_prior_similarity: Option<f64>,
        /// Whether that similarity crossed the near-duplicate threshold
        near_duplicate: bool,
    },

    /// What should happen to an interrupted project?
    RecoveryDecision {
        project_id: String,
        goal: String,
        current_task: Option<Value>,
        last_action: String,
        file_signals: Value,
        task_history: Vec<Value>,
    },

    /// Which agent should answer a consultation?
    AgentSelection {
        requesting_agent: String,
        target_type: String,
        question: String,
        context: Value,
        candidates: Vec<CandidateSummary>,
        /// Caller's preference, advisory only
        suggested: Option<String>,
    },
}

impl OracleRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProgressEvaluation { .. } => "progress_evaluation",
            Self::RecoveryDecision { .. } => "recovery_decision",
            Self::AgentSelection { .. } => "agent_selection",
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            Self::ProgressEvaluation { .. } => {
                r#"You judge whether a software agent's latest attempt made progress toward its goal.
Reply with a single JSON object and nothing else:
{"is_regressive": bool, "no_progress": bool, "reasoning": string}"#
            }
            Self::RecoveryDecision { .. } => {
                r#"You decide how to resume a project after the coordinator restarted unexpectedly.
Use the goal, the last recorded action, the file signals and the task history.
Reply with a single JSON object and nothing else:
{"decision": "continue_task" | "restart_task" | "next_task" | "human_review", "reasoning": string}
Choose "human_review" whenever the state is unclear."#
            }
            Self::AgentSelection { .. } => {
                r#"You route a consultation to exactly one of the listed candidate agents.
Reply with a single JSON object and nothing else:
{"agent_id": string, "reasoning": string}
The agent_id must be one of the candidates."#
            }
        }
    }
}

/// Abstract reasoning call: structured context in, structured decision out
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn infer(&self, request: &OracleRequest) -> Result<Value, OracleError>;
}

pub type SharedOracle = Arc<dyn ReasoningOracle>;

/// Extract a JSON object from model output
///
/// Strips markdown fences and surrounding prose, keeping the span from the
/// first `{` to the last `}`.
pub fn parse_json_payload(content: &str) -> Result<Value, OracleError> {
    let trimmed = content.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    let candidate = match (start, end) {
        (Some(s), Some(e)) if e > s => &trimmed[s..=e],
        _ => {
            return Err(OracleError::InvalidResponse(format!(
                "no JSON object in reply: {}",
                truncate(trimmed, 200)
            )))
        }
    };

    serde_json::from_str(candidate).map_err(|e| OracleError::InvalidResponse(e.to_string()))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Configuration for [`HttpOracle`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleEndpoint {
    /// Base URL of an OpenAI-compatible API (e.g. `http://localhost:8080/v1`)
    pub url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

/// Oracle backed by an OpenAI-compatible chat completions endpoint
pub struct HttpOracle {
    endpoint: OracleEndpoint,
    client: reqwest::Client,
}

impl HttpOracle {
    pub fn new(endpoint: OracleEndpoint) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        Ok(Self { endpoint, client })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ReasoningOracle for HttpOracle {
    async fn infer(&self, request: &OracleRequest) -> Result<Value, OracleError> {
        let user_prompt = serde_json::to_string_pretty(request)
            .map_err(|e| OracleError::RequestFailed(e.to_string()))?;

        let request_body = serde_json::json!({
            "model": self.endpoint.model,
            "messages": [
                { "role": "system", "content": request.system_prompt() },
                { "role": "user", "content": user_prompt }
            ],
            "temperature": 0.1,
            "max_tokens": 1024
        });

        let mut builder = self.client.post(self.completions_url()).json(&request_body);
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::RequestFailed(format!(
                "oracle API error ({}): {}",
                status, body
            )));
        }

        let resp_json: Value = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        let content = resp_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OracleError::InvalidResponse("missing message content".to_string()))?;

        debug!(kind = request.kind(), "Oracle replied");
        parse_json_payload(content)
    }
}

/// Deterministic oracle for tests and offline runs
///
/// Replies are served in FIFO order; once the script is exhausted the
/// default reply (if any) is returned, otherwise `Unavailable`.
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<Value, OracleError>>>,
    default_reply: Option<Value>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// An oracle that always fails, like an unreachable endpoint
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Reply used once the script runs out
    pub fn with_default(mut self, reply: Value) -> Self {
        self.default_reply = Some(reply);
        self
    }

    pub fn push_response(&self, reply: Value) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(reply));
    }

    pub fn push_error(&self, error: OracleError) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    async fn infer(&self, request: &OracleRequest) -> Result<Value, OracleError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some(reply) => reply,
            None => self
                .default_reply
                .clone()
                .ok_or_else(|| OracleError::Unavailable("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn selection() -> OracleRequest {
        OracleRequest::AgentSelection {
            requesting_agent: "coder-1".to_string(),
            target_type: "architect".to_string(),
            question: "which crate?".to_string(),
            context: json!({}),
            candidates: vec![],
            suggested: None,
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = "Sure.\n```json\n{\"decision\": \"next_task\"}\n```";
        let value = parse_json_payload(reply).unwrap();
        assert_eq!(value["decision"], "next_task");
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_json_payload("I think you should continue").unwrap_err();
        assert!(matches!(err, OracleError::InvalidResponse(_)));
    }

    #[test]
    fn test_request_is_tagged_by_kind() {
        let json = serde_json::to_value(selection()).unwrap();
        assert_eq!(json["kind"], "agent_selection");
        assert_eq!(selection().kind(), "agent_selection");
    }

    #[tokio::test]
    async fn test_scripted_oracle_order_and_default() {
        let oracle = ScriptedOracle::new().with_default(json!({"fallback": true}));
        oracle.push_response(json!({"n": 1}));
        oracle.push_error(OracleError::RequestFailed("boom".to_string()));

        assert_eq!(oracle.infer(&selection()).await.unwrap()["n"], 1);
        assert!(oracle.infer(&selection()).await.is_err());
        assert_eq!(oracle.infer(&selection()).await.unwrap()["fallback"], true);
        assert_eq!(oracle.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_oracle() {
        let oracle = ScriptedOracle::unavailable();
        let err = oracle.infer(&selection()).await.unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(_)));
    }

    #[test]
    fn test_http_oracle_url() {
        let oracle = HttpOracle::new(OracleEndpoint {
            url: "http://localhost:8080/v1/".to_string(),
            model: "local".to_string(),
            api_key: None,
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(
            oracle.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }
}
