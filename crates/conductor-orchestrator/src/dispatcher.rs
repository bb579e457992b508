use crate::profiles::{default_profiles, AgentProfile};
use async_trait::async_trait;
use conductor_router::{CompletionRequest, ProviderRouter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl InvocationOutcome {
    /// A successful invocation.
    pub fn ok(result: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
        }
    }

    /// A failed invocation.
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Maps an abstract workflow step onto a concrete agent operation.
///
/// The engine treats every implementation as a black box: failures are
/// reported through [`InvocationOutcome`], and a panic is caught by the
/// engine and turned into a failed step.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Run `action` on `agent_id` with the step parameters.
    async fn invoke(&self, agent_id: &str, action: &str, params: &Value) -> InvocationOutcome;
}

/// Dispatcher that answers every step with a routed completion.
pub struct RouterDispatcher {
    router: Arc<ProviderRouter>,
    profiles: HashMap<String, AgentProfile>,
}

impl RouterDispatcher {
    /// A dispatcher using the built-in agent profiles.
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self::with_profiles(router, default_profiles())
    }

    /// A dispatcher with custom profiles.
    pub fn with_profiles(router: Arc<ProviderRouter>, profiles: HashMap<String, AgentProfile>) -> Self {
        Self { router, profiles }
    }

    fn build_request(profile: &AgentProfile, action: &str, params: &Value) -> CompletionRequest {
        let mut request = CompletionRequest::new(render_prompt(action, params))
            .with_system(profile.system_prompt.clone())
            .with_max_tokens(profile.max_tokens);
        request.temperature = Some(profile.temperature);
        request
    }
}

#[async_trait]
impl AgentDispatcher for RouterDispatcher {
    async fn invoke(&self, agent_id: &str, action: &str, params: &Value) -> InvocationOutcome {
        let started = Instant::now();
        let Some(profile) = self.profiles.get(agent_id) else {
            warn!(agent = agent_id, "no profile for agent");
            return InvocationOutcome::failed(format!("unknown agent: {agent_id}"), 0);
        };

        let request = Self::build_request(profile, action, params);
        let routed = self.router.complete(&request).await;
        let elapsed = started.elapsed().as_millis() as u64;
        debug!(
            agent = agent_id,
            action,
            degraded = routed.degraded,
            attempts = routed.attempts,
            "agent step answered"
        );

        InvocationOutcome::ok(
            json!({
                "text": routed.text,
                "provider": routed.provider,
                "model": routed.model,
                "degraded": routed.degraded,
                "source": routed.source,
                "attempts": routed.attempts,
            }),
            elapsed,
        )
    }
}

/// Render the user prompt for one step.
///
/// Earlier results are included by step key, using their `text` field when
/// present and compact JSON otherwise.
pub fn render_prompt(action: &str, params: &Value) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Action: {action}");
    if let Some(project) = params.get("project").and_then(Value::as_str) {
        let _ = writeln!(prompt, "Project: {project}");
    }
    if let Some(request) = params.get("request").and_then(Value::as_str) {
        let _ = writeln!(prompt, "\nRequest:\n{request}");
    }

    if let Some(previous) = params.get("previous").and_then(Value::as_object) {
        if !previous.is_empty() {
            prompt.push_str("\nResults from earlier steps:\n");
            for (key, result) in previous {
                let body = result
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| result.to_string());
                let _ = writeln!(prompt, "\n## {key}\n{body}");
            }
        }
    }

    let extra: Vec<(&String, &Value)> = params
        .as_object()
        .map(|m| {
            m.iter()
                .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
                .collect()
        })
        .unwrap_or_default();
    if !extra.is_empty() {
        prompt.push_str("\nParameters:\n");
        for (key, value) in extra {
            let shown = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            let _ = writeln!(prompt, "- {key}: {shown}");
        }
    }
    prompt
}

const RESERVED_PARAMS: &[&str] = &[
    "request",
    "project",
    "step",
    "step_number",
    "workflow_id",
    "previous",
];

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_router::{Completion, Provider, ProviderError, RouterPolicy};
    use parking_lot::Mutex;

    struct EchoProvider {
        fail: bool,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl Provider for EchoProvider {
        fn id(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
            self.seen.lock().push(request.clone());
            if self.fail {
                return Err(ProviderError::Rejected("nope".into()));
            }
            Ok(Completion::text(format!("answer to {}", request.prompt.len())))
        }
    }

    fn dispatcher(fail: bool) -> (RouterDispatcher, Arc<EchoProvider>) {
        let provider = Arc::new(EchoProvider {
            fail,
            seen: Mutex::new(Vec::new()),
        });
        let as_provider: Arc<dyn Provider> = provider.clone();
        let router = ProviderRouter::new(vec![as_provider], RouterPolicy::default()).unwrap();
        (RouterDispatcher::new(Arc::new(router)), provider)
    }

    fn params() -> Value {
        json!({
            "request": "Build X",
            "project": "acme",
            "step": "execute",
            "step_number": 2,
            "workflow_id": "00000000-0000-0000-0000-000000000000",
            "previous": {"plan": {"text": "1. do it"}},
            "language": "rust"
        })
    }

    #[test]
    fn test_render_prompt_includes_context() {
        let prompt = render_prompt("execute", &params());
        assert!(prompt.starts_with("Action: execute\n"));
        assert!(prompt.contains("Project: acme"));
        assert!(prompt.contains("Request:\nBuild X"));
        assert!(prompt.contains("## plan\n1. do it"));
        assert!(prompt.contains("- language: rust"));
        assert!(!prompt.contains("step_number"));
    }

    #[tokio::test]
    async fn test_invoke_uses_agent_profile() {
        let (d, provider) = dispatcher(false);
        let out = d.invoke("coder", "execute", &params()).await;
        assert!(out.success);
        let result = out.result.unwrap();
        assert_eq!(result["degraded"], json!(false));
        assert_eq!(result["provider"], json!("echo"));

        let seen = provider.seen.lock();
        assert!(seen[0].system_prompt.as_deref().unwrap().contains("Coder"));
        assert_eq!(seen[0].max_tokens, 4096);
        assert_eq!(seen[0].temperature, Some(0.2));
    }

    #[tokio::test]
    async fn test_degraded_answer_is_still_success() {
        let (d, _) = dispatcher(true);
        let out = d.invoke("planner", "plan", &params()).await;
        assert!(out.success);
        let result = out.result.unwrap();
        assert_eq!(result["degraded"], json!(true));
        assert_eq!(result["source"], json!("fallback"));
    }

    #[tokio::test]
    async fn test_unknown_agent_fails() {
        let (d, provider) = dispatcher(false);
        let out = d.invoke("ghost", "plan", &params()).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("ghost"));
        assert!(provider.seen.lock().is_empty());
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let v = serde_json::to_value(InvocationOutcome::failed("boom", 12)).unwrap();
        assert_eq!(v["durationMs"], json!(12));
        assert_eq!(v["success"], json!(false));
    }
}
