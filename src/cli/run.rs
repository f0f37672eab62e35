// src/cli/run.rs — Default command: answer a question

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::context::{collect_directory, ContextOptions};
use super::Cli;
use crate::core::orchestrator::Controller;
use crate::core::tree::ExecutionTreeNode;
use crate::core::types::{RunResult, TaskInput};
use crate::infra::config::{Config, OutputFormat};
use crate::infra::errors::RlmError;
use crate::provider::backend::{ChatBackend, CompletionBackend};
use crate::provider::openai_compat::OpenAICompatProvider;
use crate::provider::retry::{RetryPolicy, RetryProvider};
use crate::tools::ToolBridge;

pub const OUTPUT_SCHEMA: &str = "rlm.output.v1";

/// Failure classes, each with its own process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Usage,
    Input,
    Configuration,
    Backend,
    Runtime,
}

impl ErrorCategory {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Usage => 2,
            ErrorCategory::Input => 10,
            ErrorCategory::Configuration => 11,
            ErrorCategory::Backend => 20,
            ErrorCategory::Runtime => 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CliError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CliError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<RlmError> for CliError {
    fn from(e: RlmError) -> Self {
        let category = match &e {
            RlmError::Configuration(_) | RlmError::Toml(_) => ErrorCategory::Configuration,
            RlmError::Provider { .. } | RlmError::RateLimited { .. } => ErrorCategory::Backend,
            RlmError::Io(_) => ErrorCategory::Input,
            RlmError::Sandbox(_) | RlmError::Other(_) => ErrorCategory::Runtime,
        };
        Self::new(category, e.to_string())
    }
}

/// Run the CLI to completion and return the process exit code.
pub async fn run(cli: Cli, cancel: CancellationToken) -> i32 {
    let json_requested = cli.json;
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => return report_error(&CliError::from(e), json_requested),
    };
    cli.apply_to(&mut config);
    let as_json = config.output.format == OutputFormat::Json;

    match run_question(&cli, &config, cancel).await {
        Ok(result) => {
            let exit_code = result_exit_code(&result);
            if as_json {
                let payload = render_json(&result, config.output.show_tree, exit_code);
                println!("{payload}");
            } else {
                render_text(&result, config.output.show_tree);
            }
            exit_code
        }
        Err(e) => report_error(&e, as_json),
    }
}

async fn run_question(
    cli: &Cli,
    config: &Config,
    cancel: CancellationToken,
) -> Result<RunResult, CliError> {
    let question = cli.question_text();
    if question.is_empty() {
        return Err(CliError::new(ErrorCategory::Usage, "question must not be empty"));
    }
    let budget = config.budget_spec()?;

    let mut task = TaskInput::new(question);
    if let Some(context) = load_context(&cli.context, &cli.context_options())? {
        task = task.with_context(context);
    }

    let backend = build_backend(config)?;
    let cwd = std::env::current_dir()
        .map_err(|e| CliError::new(ErrorCategory::Input, e.to_string()))?;
    let tools = ToolBridge::from_config(&config.tools, &cwd);

    let mut controller = Controller::new(backend, tools)
        .with_sandbox_config(config.sandbox.clone())
        .with_child_model(config.models.child.clone())
        .with_inject_file(cli.inject_file.clone())
        .with_cancellation(cancel);
    if !cli.quiet && config.output.format == OutputFormat::Text {
        controller = controller.with_progress(super::progress::terminal_progress());
        eprintln!(
            "[run] {} | model: {}",
            crate::util::truncate_str(&task.prompt, 60),
            config.models.default
        );
    }

    Ok(controller
        .run(&task, budget, &config.models.default)
        .await?)
}

/// Read and join the context paths. A single file is passed through as-is;
/// otherwise every file gets a header line naming it.
fn load_context(paths: &[PathBuf], options: &ContextOptions) -> Result<Option<String>, CliError> {
    let mut parts: Vec<(PathBuf, String)> = Vec::new();
    let mut walked = false;
    for path in paths {
        if path.is_dir() {
            walked = true;
            let files = collect_directory(path, options).map_err(|e| {
                CliError::new(
                    ErrorCategory::Input,
                    format!("cannot read context directory {}: {e}", path.display()),
                )
            })?;
            if files.is_empty() {
                return Err(CliError::new(
                    ErrorCategory::Input,
                    format!("no text files found under {}", path.display()),
                ));
            }
            tracing::debug!(dir = %path.display(), files = files.len(), "Loaded context directory");
            parts.extend(files.into_iter().map(|f| (path.join(&f.relative), f.text)));
            continue;
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            CliError::new(
                ErrorCategory::Input,
                format!("cannot read context file {}: {e}", path.display()),
            )
        })?;
        parts.push((path.clone(), text));
    }
    Ok(match parts.len() {
        0 => None,
        1 if !walked => parts.pop().map(|(_, text)| text),
        _ => Some(
            parts
                .into_iter()
                .map(|(path, text)| format!("=== {} ===\n{}", path.display(), text))
                .collect::<Vec<_>>()
                .join("\n\n"),
        ),
    })
}

fn build_backend(config: &Config) -> Result<Arc<dyn CompletionBackend>, CliError> {
    let provider_cfg = &config.provider;
    let api_key = std::env::var(&provider_cfg.api_key_env).map_err(|_| {
        CliError::new(
            ErrorCategory::Configuration,
            format!("API key not set: export {}", provider_cfg.api_key_env),
        )
    })?;

    let provider = OpenAICompatProvider::new(
        provider_cfg.id.clone(),
        provider_cfg.id.clone(),
        api_key,
        provider_cfg.base_url.clone(),
    );
    let provider = Arc::new(RetryProvider::new(
        Arc::new(provider),
        RetryPolicy::from_config(provider_cfg),
    ));
    let mut backend =
        ChatBackend::new(provider).with_provider_cost(provider_cfg.id == "openrouter");
    if let Some(max_tokens) = provider_cfg.max_tokens {
        backend = backend.with_max_tokens(max_tokens);
    }
    Ok(Arc::new(backend))
}

fn result_exit_code(result: &RunResult) -> i32 {
    if result.success {
        0
    } else {
        ErrorCategory::Runtime.exit_code()
    }
}

fn report_error(error: &CliError, as_json: bool) -> i32 {
    let exit_code = error.category.exit_code();
    if as_json {
        println!("{}", render_error_json(error));
    } else {
        eprintln!("error: {}", error.message);
    }
    exit_code
}

// ─── Rendering ──────────────────────────────────────────────────

pub fn render_json(result: &RunResult, show_tree: bool, exit_code: i32) -> serde_json::Value {
    let mut payload = json!({
        "schema": OUTPUT_SCHEMA,
        "ok": result.success,
        "exit_code": exit_code,
        "result": {
            "answer": result.answer,
            "stop_reason": result.stop_reason,
            "early_exit": result.early_exit,
        },
        "stats": result.stats,
    });
    if show_tree {
        if let Some(ref tree) = result.execution_tree {
            payload["execution_tree"] = json!(tree);
        }
    }
    if !result.success {
        payload["error"] = json!({
            "category": ErrorCategory::Runtime,
            "message": format!("run stopped: {}", result.stop_reason),
        });
    }
    payload
}

pub fn render_error_json(error: &CliError) -> serde_json::Value {
    json!({
        "schema": OUTPUT_SCHEMA,
        "ok": false,
        "exit_code": error.category.exit_code(),
        "result": null,
        "stats": {},
        "error": {
            "category": error.category,
            "message": error.message,
        },
    })
}

fn render_text(result: &RunResult, show_tree: bool) {
    match result.answer {
        Some(ref answer) => println!("{}", answer.trim_end()),
        None => eprintln!("Warning: no answer produced"),
    }
    if result.early_exit {
        eprintln!("Warning: stopped early ({})", result.stop_reason);
    }
    if show_tree {
        if let Some(ref tree) = result.execution_tree {
            eprint!("{}", render_tree(tree));
        }
    }
    let stats = &result.stats;
    eprintln!(
        "[stats] nodes={} depth={} cost={} time={:.1}s",
        stats.node_count,
        stats.total_depth,
        stats
            .total_cost
            .map(|c| format!("${c:.4}"))
            .unwrap_or_else(|| "n/a".into()),
        stats.total_duration,
    );
}

/// Indented outline of the call tree, one block per context.
pub fn render_tree(root: &ExecutionTreeNode) -> String {
    let mut out = String::new();
    for node in root.walk() {
        let pad = "  ".repeat(node.depth() as usize);
        let cost = node
            .cost()
            .map(|c| format!("${c:.4}"))
            .unwrap_or_else(|| "n/a".into());
        out.push_str(&format!(
            "{pad}[{}] {} | {} | {} iter | {} | {:.1}s\n",
            node.depth(),
            node.model(),
            node.stop().reason(),
            node.iterations().len(),
            cost,
            node.duration().as_secs_f64(),
        ));
        out.push_str(&format!("{pad}  > {}\n", node.prompt_preview()));
        if let Some(answer) = node.answer_preview() {
            out.push_str(&format!("{pad}  = {answer}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use crate::core::tree::{ExecutionSummary, TreeRecorder};
    use crate::core::types::{BudgetBreach, BudgetKind, StopSignal};

    fn result_for(stop: StopSignal) -> RunResult {
        let mut root = TreeRecorder::new(0, "root/model", "What is it?");
        let mut child = TreeRecorder::new(1, "child/model", "sub question");
        let slot = root.reserve_child();
        root.fill_child(
            slot,
            child.seal(StopSignal::FinalAnswer { value: "sub".into() }, Some(0.01), 10),
        );
        let node = root.seal(stop.clone(), Some(0.02), 20);
        RunResult {
            success: stop.is_success(),
            stop_reason: stop.reason(),
            answer: stop.answer().map(String::from),
            early_exit: !matches!(stop, StopSignal::FinalAnswer { .. }),
            stop,
            stats: ExecutionSummary::from_tree(&node),
            execution_tree: Some(node),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorCategory::Usage.exit_code(), 2);
        assert_eq!(ErrorCategory::Input.exit_code(), 10);
        assert_eq!(ErrorCategory::Configuration.exit_code(), 11);
        assert_eq!(ErrorCategory::Backend.exit_code(), 20);
        assert_eq!(ErrorCategory::Runtime.exit_code(), 30);
    }

    #[test]
    fn test_rlm_error_categories() {
        let e = CliError::from(RlmError::Configuration("no cost".into()));
        assert_eq!(e.category, ErrorCategory::Configuration);
        let e = CliError::from(RlmError::Provider {
            provider: "x".into(),
            message: "down".into(),
            retriable: true,
        });
        assert_eq!(e.category, ErrorCategory::Backend);
    }

    #[test]
    fn test_json_success_shape() {
        let result = result_for(StopSignal::FinalAnswer { value: "42".into() });
        let v = render_json(&result, true, result_exit_code(&result));
        assert_eq!(v["schema"], OUTPUT_SCHEMA);
        assert_eq!(v["ok"], true);
        assert_eq!(v["exit_code"], 0);
        assert_eq!(v["result"]["answer"], "42");
        assert_eq!(v["result"]["stop_reason"], "final_answer");
        assert_eq!(v["result"]["early_exit"], false);
        assert_eq!(v["stats"]["node_count"], 2);
        assert_eq!(v["execution_tree"]["children"][0]["depth"], 1);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_json_budget_exceeded_is_failure_with_partial() {
        let stop = StopSignal::exceeded(
            BudgetBreach {
                kind: BudgetKind::Cost,
                spent: 1.1,
                limit: 1.0,
            },
            Some("partial".into()),
        );
        let result = result_for(stop);
        let v = render_json(&result, false, result_exit_code(&result));
        assert_eq!(v["ok"], false);
        assert_eq!(v["exit_code"], 30);
        assert_eq!(v["result"]["answer"], "partial");
        assert_eq!(v["result"]["stop_reason"], "budget_exceeded(cost)");
        assert!(v.get("execution_tree").is_none());
        assert_eq!(v["error"]["category"], "runtime");
    }

    #[test]
    fn test_cancelled_is_success() {
        let result = result_for(StopSignal::UserCancelled {
            partial_answer: None,
        });
        assert_eq!(result_exit_code(&result), 0);
    }

    #[test]
    fn test_error_json() {
        let v = render_error_json(&CliError::new(ErrorCategory::Input, "missing file"));
        assert_eq!(v["ok"], false);
        assert_eq!(v["exit_code"], 10);
        assert_eq!(v["error"]["category"], "input");
        assert!(v["result"].is_null());
    }

    #[test]
    fn test_render_tree_indents_children() {
        let result = result_for(StopSignal::FinalAnswer { value: "42".into() });
        let text = render_tree(result.execution_tree.as_ref().unwrap());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("[0] root/model | final_answer | 0 iter | $0.0200"));
        assert_eq!(lines[1], "  > What is it?");
        assert_eq!(lines[2], "  = 42");
        assert!(lines[3].starts_with("  [1] child/model"));
    }

    #[test]
    fn test_load_context_joins_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();
        let options = ContextOptions::default();

        assert_eq!(load_context(&[], &options).unwrap(), None);
        assert_eq!(load_context(&[a.clone()], &options).unwrap().as_deref(), Some("alpha"));
        let joined = load_context(&[a, b], &options).unwrap().unwrap();
        assert!(joined.contains("alpha"));
        assert!(joined.contains("=== "));
        assert!(joined.ends_with("beta"));

        let missing = load_context(&[dir.path().join("nope.txt")], &options).unwrap_err();
        assert_eq!(missing.category, ErrorCategory::Input);
    }

    #[test]
    fn test_load_context_directory_gets_headers() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(repo.join("blob.bin"), b"\0\0\0").unwrap();
        let extra = dir.path().join("extra.md");
        std::fs::write(&extra, "# extra").unwrap();

        let text = load_context(&[repo.clone(), extra.clone()], &ContextOptions::default())
            .unwrap()
            .unwrap();
        let expected = format!(
            "=== {} ===\npub fn f() {{}}\n\n=== {} ===\n# extra",
            repo.join("src/lib.rs").display(),
            extra.display()
        );
        assert_eq!(text, expected);

        // A directory holding one file still names it.
        let only = load_context(&[repo.clone()], &ContextOptions::default()).unwrap().unwrap();
        assert!(only.starts_with("=== "), "{only}");
    }

    #[test]
    fn test_load_context_empty_directory_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        let err = load_context(&[empty], &ContextOptions::default()).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Input);
        assert!(err.message.contains("no text files"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_zero_max_depth_is_configuration_error() {
        let cli = Cli::try_parse_from(["rlm", "--max-depth", "0", "question"]).unwrap();
        let mut config = Config::default();
        cli.apply_to(&mut config);
        let err = run_question(&cli, &config, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.category, ErrorCategory::Configuration);
        assert_eq!(err.category.exit_code(), 11);
    }
}
