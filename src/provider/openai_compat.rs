// src/provider/openai_compat.rs — Generic OpenAI-compatible provider
//
// Used with OpenRouter, OpenAI, and any endpoint speaking the
// `/chat/completions` protocol. OpenRouter reports per-call cost in
// `usage.cost` when usage accounting is requested.

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, ModelInfo, ModelProvider, Role, TokenUsage};
use crate::infra::errors::RlmError;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

pub struct OpenAICompatProvider {
    id_str: String,
    name_str: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        api_key: String,
        base_url: String,
    ) -> Self {
        Self {
            id_str: id.into(),
            name_str: name.into(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn provider_err(&self, message: String, retriable: bool) -> RlmError {
        RlmError::Provider {
            provider: self.id_str.clone(),
            message,
            retriable,
        }
    }
}

pub(crate) fn request_body(request: &ChatRequest) -> serde_json::Value {
    let mut msgs = Vec::new();
    if let Some(system) = &request.system {
        msgs.push(serde_json::json!({"role": "system", "content": system}));
    }
    for m in &request.messages {
        msgs.push(serde_json::json!({
            "role": match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            "content": m.content,
        }));
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": msgs,
        "usage": {"include": true},
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = serde_json::json!(temp);
    }
    body
}

pub(crate) fn parse_response(resp: &serde_json::Value) -> ChatResponse {
    let content = resp["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string();

    let usage = TokenUsage {
        input_tokens: resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: resp["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    };

    ChatResponse {
        content,
        usage,
        cost: resp["usage"]["cost"].as_f64(),
        model: resp["model"].as_str().map(String::from),
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    fn id(&self) -> &str {
        &self.id_str
    }

    fn name(&self) -> &str {
        &self.name_str
    }

    /// No local catalog; pricing falls back to the built-in table.
    fn models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, RlmError> {
        let body = request_body(&request);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("User-Agent", format!("rlm/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.provider_err(e.to_string(), e.is_timeout() || e.is_connect()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(0);
            return Err(RlmError::RateLimited {
                provider: self.id_str.clone(),
                retry_after_ms,
            });
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(self.provider_err(
                format!("HTTP {status}: {error_body}"),
                status.is_server_error(),
            ));
        }

        let resp: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.provider_err(e.to_string(), false))?;

        if let Some(err) = resp.get("error") {
            return Err(self.provider_err(err.to_string(), false));
        }

        Ok(parse_response(&resp))
    }
}
