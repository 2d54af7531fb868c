use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ModelSettings;
use crate::error::{
    InferenceFailureKind, InferenceRole, MnemonError, Result, observer_error, reflector_error,
    status_failure_kind,
};

pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TEMPERATURE: f32 = 0.0;
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AgentUsage {
    #[must_use]
    pub fn merged(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens.saturating_add(other.input_tokens),
            output_tokens: self.output_tokens.saturating_add(other.output_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentCallRequest<'a> {
    pub role: InferenceRole,
    pub model: Option<&'a str>,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub settings: ModelSettings,
    pub provider_options: Option<&'a Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub text: String,
    pub usage: AgentUsage,
}

/// The external LLM capability: one completed generation per call. The
/// engine never consumes token streams.
pub trait AgentCall: Send + Sync {
    fn call(&self, request: &AgentCallRequest<'_>) -> Result<AgentReply>;
}

impl<T: AgentCall + ?Sized> AgentCall for std::sync::Arc<T> {
    fn call(&self, request: &AgentCallRequest<'_>) -> Result<AgentReply> {
        self.as_ref().call(request)
    }
}

fn role_error(
    role: InferenceRole,
    kind: InferenceFailureKind,
    message: impl Into<String>,
) -> MnemonError {
    match role {
        InferenceRole::Observer => observer_error(kind, message),
        InferenceRole::Reflector => reflector_error(kind, message),
    }
}

/// Restricts inference traffic to the local host. Memory content never
/// leaves the machine unless the embedding application supplies its own
/// `AgentCall`.
pub fn parse_loopback_endpoint(raw: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(raw).map_err(|err| format!("invalid endpoint: {err}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported endpoint scheme: {other}")),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("endpoint must not include credentials".to_string());
    }
    let host = url.host_str().ok_or("endpoint host is missing")?;
    if !matches!(host, "127.0.0.1" | "localhost" | "::1") {
        return Err(format!("endpoint must use a loopback host, got: {host}"));
    }
    Ok(url)
}

/// Pulls completion text out of Ollama-shaped (`message.content`,
/// `response`) and OpenAI-shaped (`choices[0].message.content`) payloads.
pub fn extract_completion_text(value: &Value) -> Option<String> {
    if let Some(content) = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
    {
        return Some(content.to_string());
    }
    if let Some(content) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
    {
        return Some(content.to_string());
    }
    value
        .get("response")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn usage_u32(value: Option<&Value>) -> u32 {
    value
        .and_then(Value::as_u64)
        .map(|raw| u32::try_from(raw).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

pub fn extract_usage(value: &Value) -> AgentUsage {
    if let Some(usage) = value.get("usage") {
        return AgentUsage {
            input_tokens: usage_u32(usage.get("prompt_tokens")),
            output_tokens: usage_u32(usage.get("completion_tokens")),
        };
    }
    AgentUsage {
        input_tokens: usage_u32(value.get("prompt_eval_count")),
        output_tokens: usage_u32(value.get("eval_count")),
    }
}

/// Blocking HTTP binding for a local chat-completion endpoint.
pub struct HttpAgentClient {
    endpoint: Url,
    client: Client,
    default_model: String,
}

impl std::fmt::Debug for HttpAgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl HttpAgentClient {
    pub fn new(endpoint: &str, default_model: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let endpoint = parse_loopback_endpoint(endpoint).map_err(MnemonError::Validation)?;
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            endpoint,
            client,
            default_model: default_model.into(),
        })
    }

    fn payload(&self, request: &AgentCallRequest<'_>) -> Value {
        let temperature = request
            .settings
            .temperature
            .unwrap_or(DEFAULT_TEMPERATURE);
        let max_output_tokens = request
            .settings
            .max_output_tokens
            .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
        let mut payload = serde_json::json!({
            "model": request.model.unwrap_or(self.default_model.as_str()),
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt}
            ],
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_output_tokens
            }
        });
        if let (Some(extra), Some(object)) = (request.provider_options, payload.as_object_mut())
            && let Some(extra_object) = extra.as_object()
        {
            for (key, value) in extra_object {
                object.insert(key.clone(), value.clone());
            }
        }
        payload
    }
}

impl AgentCall for HttpAgentClient {
    fn call(&self, request: &AgentCallRequest<'_>) -> Result<AgentReply> {
        let role = request.role;
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&self.payload(request))
            .send()
            .map_err(|err| {
                role_error(
                    role,
                    InferenceFailureKind::Transient,
                    format!("request failed: {err}"),
                )
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(role_error(
                role,
                status_failure_kind(status),
                format!("non-success status: {status}"),
            ));
        }
        let value = response.json::<Value>().map_err(|err| {
            role_error(
                role,
                InferenceFailureKind::Schema,
                format!("invalid json response: {err}"),
            )
        })?;
        let text = extract_completion_text(&value).ok_or_else(|| {
            role_error(
                role,
                InferenceFailureKind::Schema,
                "response carried no completion content",
            )
        })?;
        Ok(AgentReply {
            text,
            usage: extract_usage(&value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_validation_rejects_remote_hosts() {
        assert!(parse_loopback_endpoint("http://127.0.0.1:11434/api/chat").is_ok());
        assert!(parse_loopback_endpoint("http://localhost:8080/v1/chat").is_ok());
        assert!(parse_loopback_endpoint("http://example.com/api").is_err());
        assert!(parse_loopback_endpoint("ftp://127.0.0.1/api").is_err());
        assert!(parse_loopback_endpoint("http://user:pw@127.0.0.1/api").is_err());
    }

    #[test]
    fn completion_text_prefers_message_content() {
        let value = serde_json::json!({
            "message": {"content": "primary"},
            "response": "fallback"
        });
        assert_eq!(extract_completion_text(&value).as_deref(), Some("primary"));

        let openai = serde_json::json!({
            "choices": [{"message": {"content": "from-choices"}}]
        });
        assert_eq!(
            extract_completion_text(&openai).as_deref(),
            Some("from-choices")
        );
    }

    #[test]
    fn usage_reads_both_provider_shapes() {
        let openai = serde_json::json!({"usage": {"prompt_tokens": 12, "completion_tokens": 7}});
        assert_eq!(
            extract_usage(&openai),
            AgentUsage {
                input_tokens: 12,
                output_tokens: 7
            }
        );
        let ollama = serde_json::json!({"prompt_eval_count": 5, "eval_count": 3});
        assert_eq!(
            extract_usage(&ollama),
            AgentUsage {
                input_tokens: 5,
                output_tokens: 3
            }
        );
    }

    #[test]
    fn merged_usage_saturates() {
        let total = AgentUsage {
            input_tokens: u32::MAX,
            output_tokens: 1,
        }
        .merged(AgentUsage {
            input_tokens: 10,
            output_tokens: 2,
        });
        assert_eq!(total.input_tokens, u32::MAX);
        assert_eq!(total.output_tokens, 3);
    }
}
