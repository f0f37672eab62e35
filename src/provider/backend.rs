// src/provider/backend.rs — Completion capability consumed by the controller
//
// A backend turns the conversation so far into the model's next action:
// a final answer, a final answer by variable name, or a snippet to run.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use super::{pricing, ChatRequest, Message, ModelInfo, ModelProvider, TokenUsage};
use crate::infra::errors::RlmError;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// `FINAL(text)`: the answer itself.
    Final(String),
    /// `FINAL_VAR(name)`: the answer is the named variable, resolved after
    /// any code in the same response has run.
    FinalVar { name: String, code: String },
    /// A snippet to run. Empty when the response held no code.
    Code(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub depth: u32,
    /// Set on the single closing request after iterations ran out.
    pub force_final: bool,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub action: Action,
    /// Unparsed response text.
    pub raw: String,
    pub usage: TokenUsage,
    /// USD; `None` when the backend cannot price the call.
    pub cost: Option<f64>,
    pub model: String,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Whether calls against `model` will carry cost data.
    fn reports_cost(&self, model: &str) -> bool;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, RlmError>;
}

// ─── Response parsing ───────────────────────────────────────────

fn final_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*FINAL_VAR\(\s*["']?([A-Za-z_][A-Za-z0-9_]*)["']?\s*\)"#)
            .expect("static regex")
    })
}

fn final_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?ms)^\s*FINAL\((.*)\)\s*$").expect("static regex")
    })
}

/// Split a response into (text outside fences, accepted code blocks).
/// Blocks tagged `rhai`, `repl` or untagged are code; other languages are
/// left as prose.
fn split_fences(text: &str) -> (String, Vec<String>) {
    let mut prose = String::new();
    let mut blocks = Vec::new();
    let mut current: Option<(bool, String)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.take() {
            None if trimmed.starts_with("```") => {
                let tag = trimmed.trim_start_matches('`').trim().to_ascii_lowercase();
                let accepted = matches!(tag.as_str(), "" | "rhai" | "repl");
                current = Some((accepted, String::new()));
            }
            None => {
                prose.push_str(line);
                prose.push('\n');
            }
            Some((accepted, body)) if trimmed.starts_with("```") => {
                if accepted {
                    blocks.push(body);
                }
            }
            Some((accepted, mut body)) => {
                body.push_str(line);
                body.push('\n');
                current = Some((accepted, body));
            }
        }
    }
    // Unterminated fence: take what was written.
    if let Some((true, body)) = current {
        blocks.push(body);
    }
    (prose, blocks)
}

/// Decide the action a raw model response asks for.
pub fn parse_action(text: &str) -> Action {
    let (prose, blocks) = split_fences(text);
    let code = blocks.join("\n");

    if let Some(caps) = final_var_re().captures(&prose) {
        return Action::FinalVar {
            name: caps[1].to_string(),
            code,
        };
    }
    if let Some(caps) = final_re().captures(&prose) {
        return Action::Final(caps[1].trim().to_string());
    }
    Action::Code(code)
}

// ─── Chat-model backend ─────────────────────────────────────────

/// Completion backend over any chat `ModelProvider`. Cost comes from the
/// provider when it reports one, else from catalog or built-in prices.
pub struct ChatBackend {
    provider: Arc<dyn ModelProvider>,
    catalog: Vec<ModelInfo>,
    provider_reports_cost: bool,
    max_tokens: Option<u32>,
}

impl ChatBackend {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        let catalog = provider.models();
        Self {
            provider,
            catalog,
            provider_reports_cost: false,
            max_tokens: None,
        }
    }

    /// Declare that the provider returns a cost with every response.
    pub fn with_provider_cost(mut self, reports: bool) -> Self {
        self.provider_reports_cost = reports;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl CompletionBackend for ChatBackend {
    fn reports_cost(&self, model: &str) -> bool {
        self.provider_reports_cost
            || pricing::calculate_cost(model, &self.catalog, &TokenUsage::default()).is_some()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, RlmError> {
        let response = self
            .provider
            .chat(ChatRequest {
                model: request.model.clone(),
                messages: request.messages,
                max_tokens: self.max_tokens,
                temperature: None,
                system: Some(request.system),
            })
            .await?;

        let cost = response
            .cost
            .or_else(|| pricing::calculate_cost(&request.model, &self.catalog, &response.usage));

        Ok(Completion {
            action: parse_action(&response.content),
            raw: response.content,
            usage: response.usage,
            cost,
            model: response.model.unwrap_or(request.model),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatResponse;

    #[test]
    fn test_parse_final_text() {
        assert_eq!(
            parse_action("Done.\nFINAL(The answer is (roughly) 42)"),
            Action::Final("The answer is (roughly) 42".into())
        );
    }

    #[test]
    fn test_parse_final_var_with_code() {
        let text = "```rhai\nlet result = 6 * 7;\n```\nFINAL_VAR(result)";
        assert_eq!(
            parse_action(text),
            Action::FinalVar {
                name: "result".into(),
                code: "let result = 6 * 7;\n".into()
            }
        );
    }

    #[test]
    fn test_final_var_quoted_name() {
        assert!(matches!(
            parse_action("FINAL_VAR(\"answer\")"),
            Action::FinalVar { name, .. } if name == "answer"
        ));
    }

    #[test]
    fn test_final_inside_code_is_not_a_signal() {
        let text = "```repl\nprint(\"FINAL(x)\");\n```";
        assert_eq!(
            parse_action(text),
            Action::Code("print(\"FINAL(x)\");\n".into())
        );
    }

    #[test]
    fn test_code_blocks_joined_and_foreign_languages_ignored() {
        let text = "First:\n```\nlet a = 1;\n```\n```python\nx = 2\n```\nThen:\n```rhai\na + 1\n```";
        assert_eq!(parse_action(text), Action::Code("let a = 1;\n\na + 1\n".into()));
    }

    #[test]
    fn test_prose_only_is_empty_snippet() {
        assert_eq!(parse_action("Let me think about this."), Action::Code(String::new()));
    }

    #[test]
    fn test_unterminated_fence() {
        assert_eq!(parse_action("```rhai\nprint(1);"), Action::Code("print(1);\n".into()));
    }

    struct Fixed {
        cost: Option<f64>,
    }

    #[async_trait]
    impl ModelProvider for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }
        fn name(&self) -> &str {
            "Fixed"
        }
        fn models(&self) -> Vec<ModelInfo> {
            vec![]
        }
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, RlmError> {
            assert!(req.system.is_some());
            Ok(ChatResponse {
                content: "FINAL(ok)".into(),
                usage: TokenUsage {
                    input_tokens: 1_000_000,
                    output_tokens: 0,
                },
                cost: self.cost,
                model: None,
            })
        }
    }

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.into(),
            system: "sys".into(),
            messages: vec![Message::user("q")],
            depth: 0,
            force_final: false,
        }
    }

    #[tokio::test]
    async fn test_chat_backend_prefers_reported_cost() {
        let backend = ChatBackend::new(Arc::new(Fixed { cost: Some(0.5) }));
        let c = backend.complete(request("gpt-4o")).await.unwrap();
        assert_eq!(c.cost, Some(0.5));
        assert_eq!(c.action, Action::Final("ok".into()));
        assert_eq!(c.model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_chat_backend_falls_back_to_price_table() {
        let backend = ChatBackend::new(Arc::new(Fixed { cost: None }));
        let c = backend.complete(request("gpt-4o")).await.unwrap();
        assert!((c.cost.unwrap() - 2.5).abs() < 1e-9);
        let c = backend.complete(request("acme/unknown")).await.unwrap();
        assert!(c.cost.is_none());
    }

    #[test]
    fn test_reports_cost() {
        let backend = ChatBackend::new(Arc::new(Fixed { cost: None }));
        assert!(backend.reports_cost("openai/gpt-4.1"));
        assert!(!backend.reports_cost("acme/unknown"));
        let backend = backend.with_provider_cost(true);
        assert!(backend.reports_cost("acme/unknown"));
    }

    /// Echoes the completion-token cap it was sent.
    struct EchoCap;

    #[async_trait]
    impl ModelProvider for EchoCap {
        fn id(&self) -> &str {
            "echo"
        }
        fn name(&self) -> &str {
            "Echo"
        }
        fn models(&self) -> Vec<ModelInfo> {
            vec![]
        }
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, RlmError> {
            Ok(ChatResponse {
                content: format!("FINAL({:?})", req.max_tokens),
                usage: TokenUsage::default(),
                cost: None,
                model: None,
            })
        }
    }

    #[tokio::test]
    async fn test_max_tokens_forwarded_to_provider() {
        let uncapped = ChatBackend::new(Arc::new(EchoCap));
        let c = uncapped.complete(request("m")).await.unwrap();
        assert_eq!(c.action, Action::Final("None".into()));

        let capped = ChatBackend::new(Arc::new(EchoCap)).with_max_tokens(2048);
        let c = capped.complete(request("m")).await.unwrap();
        assert_eq!(c.action, Action::Final("Some(2048)".into()));
    }
}
