// src/core/sandbox.rs — Snippet evaluation against a persistent environment
//
// Snippets are Rhai scripts. Top-level `let` bindings and `fn` definitions
// persist in the context's scope across iterations; nothing is shared with
// sibling or child contexts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde::Deserialize;

use super::types::{ErrorKind, StopSignal};
use crate::infra::config::SandboxConfig;
use crate::infra::errors::RlmError;
use crate::tools::{PatternOptions, ToolBridge, WebFilters};
use crate::util::truncate_str;

type HostResult<T> = Result<T, Box<EvalAltResult>>;

/// Entry point for recursive sub-tasks issued from inside a snippet.
///
/// Called on the sandbox thread; implementations block until the child
/// context terminates and return its stop signal (`DepthExhausted` when
/// refused).
pub trait RecursionHandle: Send + Sync {
    fn spawn_child(
        &self,
        prompt: &str,
        tools: Option<Vec<String>>,
        model_override: Option<&str>,
    ) -> Result<StopSignal, RlmError>;
}

/// What one snippet run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnippetOutcome {
    /// Printed text followed by the value of the last expression, if any.
    pub output: String,
    pub error: Option<ErrorKind>,
    /// Resolved value of a successful `signal_final(name)`.
    pub final_answer: Option<String>,
    pub child_calls: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum FinalRequest {
    Name(String),
    NotAName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    /// Characters for strings, elements for arrays and maps.
    pub size: Option<usize>,
}

pub struct Sandbox {
    engine: Engine,
    scope: Scope<'static>,
    /// Function definitions accumulated from earlier snippets.
    functions: AST,
    printed: Arc<Mutex<String>>,
    final_request: Arc<Mutex<Option<FinalRequest>>>,
    child_calls: Arc<AtomicUsize>,
}

impl Sandbox {
    pub fn new(
        limits: &SandboxConfig,
        tools: &ToolBridge,
        recursion: Option<Arc<dyn RecursionHandle>>,
    ) -> Self {
        let printed = Arc::new(Mutex::new(String::new()));
        let final_request = Arc::new(Mutex::new(None));
        let child_calls = Arc::new(AtomicUsize::new(0));

        let mut engine = create_engine(limits);

        let buf = printed.clone();
        engine.on_print(move |s| {
            if let Ok(mut b) = buf.lock() {
                b.push_str(s);
                b.push('\n');
            }
        });
        let buf = printed.clone();
        engine.on_debug(move |s, _source, _pos| {
            if let Ok(mut b) = buf.lock() {
                b.push_str(s);
                b.push('\n');
            }
        });

        register_final_signal(&mut engine, &final_request);
        register_tools(&mut engine, tools);
        if let Some(handle) = recursion {
            register_recursion(&mut engine, handle, child_calls.clone());
        }

        Self {
            engine,
            scope: Scope::new(),
            functions: AST::empty(),
            printed,
            final_request,
            child_calls,
        }
    }

    pub fn set_var(&mut self, name: &str, value: impl Into<Dynamic>) {
        self.scope.set_value(name.to_string(), value.into());
    }

    pub fn variables(&self) -> Vec<VariableInfo> {
        self.scope
            .iter()
            .map(|(name, _, value)| VariableInfo {
                name: name.to_string(),
                type_name: value.type_name().to_string(),
                size: dynamic_size(&value),
            })
            .collect()
    }

    /// Run one snippet. Never fails: evaluation problems come back as
    /// `ErrorKind` values in the outcome.
    pub fn run(&mut self, snippet: &str) -> SnippetOutcome {
        if let Ok(mut b) = self.printed.lock() {
            b.clear();
        }
        if let Ok(mut f) = self.final_request.lock() {
            *f = None;
        }
        self.child_calls.store(0, Ordering::SeqCst);

        let result = self
            .engine
            .compile_with_scope(&self.scope, snippet)
            .map_err(|e| e.to_string())
            .and_then(|ast| {
                let combined = self.functions.merge(&ast);
                let value = self
                    .engine
                    .eval_ast_with_scope::<Dynamic>(&mut self.scope, &combined)
                    .map_err(|e| e.to_string())?;
                self.functions = self.functions.merge(&ast.clone_functions_only());
                Ok(value)
            });

        let mut output = self
            .printed
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default();
        let child_calls = self.child_calls.load(Ordering::SeqCst);

        let value = match result {
            Ok(v) => v,
            Err(message) => {
                return SnippetOutcome {
                    output,
                    error: Some(ErrorKind::ExecutionFailure { message }),
                    final_answer: None,
                    child_calls,
                };
            }
        };

        if !value.is_unit() {
            output.push_str(&render(&value));
            output.push('\n');
        }

        let request = self.final_request.lock().ok().and_then(|mut f| f.take());
        let (final_answer, error) = match request {
            None => (None, None),
            Some(FinalRequest::NotAName(found)) => {
                (None, Some(ErrorKind::WrongArgumentType { found }))
            }
            Some(FinalRequest::Name(name)) => match self.scope.get_value::<Dynamic>(&name) {
                Some(v) => (Some(render(&v)), None),
                None => (None, Some(ErrorKind::UnknownVariable { name })),
            },
        };

        SnippetOutcome {
            output,
            error,
            final_answer,
            child_calls,
        }
    }
}

/// Resource-limited engine with no I/O.
fn create_engine(limits: &SandboxConfig) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 32);
    engine.set_max_call_levels(64);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);

    engine.register_fn("log", |msg: &str| {
        tracing::info!(target: "rlm_snippet", "{}", msg);
    });

    engine
}

fn register_final_signal(engine: &mut Engine, slot: &Arc<Mutex<Option<FinalRequest>>>) {
    for name in ["signal_final", "FINAL_VAR"] {
        let slot = slot.clone();
        engine.register_fn(name, move |arg: Dynamic| {
            let request = if arg.is_string() {
                match arg.into_string() {
                    Ok(s) if is_identifier(s.trim()) => FinalRequest::Name(s.trim().to_string()),
                    Ok(s) => FinalRequest::NotAName(format!("string '{}'", truncate_str(&s, 40))),
                    Err(found) => FinalRequest::NotAName(found.to_string()),
                }
            } else {
                FinalRequest::NotAName(arg.type_name().to_string())
            };
            if let Ok(mut s) = slot.lock() {
                *s = Some(request);
            }
        });
    }
}

/// A string `signal_final` can treat as a variable name.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScanArgs {
    regex: bool,
    globs: Vec<String>,
    max_hits: Option<usize>,
    case_sensitive: Option<bool>,
}

fn to_host_err(e: impl std::fmt::Display) -> Box<EvalAltResult> {
    e.to_string().into()
}

fn string_list(arr: rhai::Array) -> Vec<String> {
    arr.into_iter().filter_map(|d| d.into_string().ok()).collect()
}

fn limit_arg(limit: i64) -> HostResult<usize> {
    usize::try_from(limit)
        .ok()
        .filter(|l| *l > 0)
        .ok_or_else(|| to_host_err(format!("limit must be positive, got {limit}")))
}

/// Bind each configured tool under its declared name.
fn register_tools(engine: &mut Engine, tools: &ToolBridge) {
    if let Some(pattern) = tools.pattern() {
        let scan = {
            let tool = pattern.clone();
            move |pattern: &str, paths: Vec<String>, opts: PatternOptions| -> HostResult<Dynamic> {
                let hits = tool.search(pattern, &paths, &opts).map_err(to_host_err)?;
                rhai::serde::to_dynamic(hits)
            }
        };
        let s = scan.clone();
        engine.register_fn("scan", move |pattern: &str| {
            s(pattern, Vec::new(), PatternOptions::default())
        });
        let s = scan.clone();
        engine.register_fn("scan", move |pattern: &str, paths: rhai::Array| {
            s(pattern, string_list(paths), PatternOptions::default())
        });
        engine.register_fn(
            "scan",
            move |pattern: &str, paths: rhai::Array, opts: rhai::Map| -> HostResult<Dynamic> {
                let map = Dynamic::from_map(opts);
                let args: ScanArgs = rhai::serde::from_dynamic(&map)?;
                scan(
                    pattern,
                    string_list(paths),
                    PatternOptions {
                        regex: args.regex,
                        globs: args.globs,
                        max_hits: args.max_hits,
                        case_sensitive: args.case_sensitive,
                    },
                )
            },
        );
    }

    if let Some(ranked) = tools.ranked() {
        let default_limit = tools.default_limit();
        let tool = ranked.clone();
        engine.register_fn("recall", move |query: &str| -> HostResult<Dynamic> {
            let hits = tool.search(query, default_limit).map_err(to_host_err)?;
            rhai::serde::to_dynamic(hits)
        });
        let tool = ranked.clone();
        engine.register_fn("recall", move |query: &str, limit: i64| -> HostResult<Dynamic> {
            let hits = tool.search(query, limit_arg(limit)?).map_err(to_host_err)?;
            rhai::serde::to_dynamic(hits)
        });
    }

    if let Some(web) = tools.web() {
        let default_limit = tools.default_limit();
        let tool = web.clone();
        engine.register_fn("web_search", move |query: &str| -> HostResult<Dynamic> {
            let hits = tool
                .search(query, default_limit, &WebFilters::default())
                .map_err(to_host_err)?;
            rhai::serde::to_dynamic(hits)
        });
        let tool = web.clone();
        engine.register_fn(
            "web_search",
            move |query: &str, limit: i64| -> HostResult<Dynamic> {
                let hits = tool
                    .search(query, limit_arg(limit)?, &WebFilters::default())
                    .map_err(to_host_err)?;
                rhai::serde::to_dynamic(hits)
            },
        );
        let tool = web.clone();
        engine.register_fn(
            "web_search",
            move |query: &str, limit: i64, filters: rhai::Map| -> HostResult<Dynamic> {
                let map = Dynamic::from_map(filters);
                let filters: WebFilters = rhai::serde::from_dynamic(&map)?;
                let hits = tool
                    .search(query, limit_arg(limit)?, &filters)
                    .map_err(to_host_err)?;
                rhai::serde::to_dynamic(hits)
            },
        );
    }

    if let Some(documents) = tools.documents() {
        let tool = documents.clone();
        engine.register_fn("doc_tree", move |path: &str| -> HostResult<Dynamic> {
            let tree = tool.tree(path).map_err(to_host_err)?;
            rhai::serde::to_dynamic(tree)
        });
    }
}

fn register_recursion(
    engine: &mut Engine,
    handle: Arc<dyn RecursionHandle>,
    calls: Arc<AtomicUsize>,
) {
    let query = move |prompt: &str, model: Option<&str>, tools: Option<Vec<String>>| -> HostResult<String> {
        calls.fetch_add(1, Ordering::SeqCst);
        let signal = handle
            .spawn_child(prompt, tools, model.filter(|m| !m.is_empty()))
            .map_err(to_host_err)?;
        match signal {
            StopSignal::DepthExhausted => {
                Err(to_host_err("llm_query refused: recursion depth exhausted"))
            }
            // A partial answer from an interrupted child is not a result.
            StopSignal::UserCancelled { .. } => Err(to_host_err("sub-task cancelled")),
            other => match other.answer() {
                Some(answer) => Ok(answer.to_string()),
                None => Err(to_host_err(format!(
                    "sub-task ended without an answer ({})",
                    other.reason()
                ))),
            },
        }
    };

    let q = query.clone();
    engine.register_fn("llm_query", move |prompt: &str| q(prompt, None, None));
    let q = query.clone();
    engine.register_fn("llm_query", move |prompt: &str, model: &str| {
        q(prompt, Some(model), None)
    });
    engine.register_fn(
        "llm_query",
        move |prompt: &str, model: &str, tools: rhai::Array| {
            query(prompt, Some(model), Some(string_list(tools)))
        },
    );
}

/// Strings render raw; everything else uses Rhai's display form.
fn render(value: &Dynamic) -> String {
    if value.is_string() {
        value.clone().into_string().unwrap_or_default()
    } else {
        value.to_string()
    }
}

fn dynamic_size(value: &Dynamic) -> Option<usize> {
    if value.is_string() {
        value.clone().into_string().ok().map(|s| s.chars().count())
    } else if value.is_array() {
        value.clone().into_array().ok().map(|a| a.len())
    } else if value.is_map() {
        value.clone().try_cast::<rhai::Map>().map(|m| m.len())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new(&SandboxConfig::default(), &ToolBridge::empty(), None)
    }

    #[test]
    fn test_print_and_last_value_captured() {
        let mut sb = sandbox();
        let out = sb.run("print(\"hello\"); 40 + 2");
        assert!(out.error.is_none());
        assert_eq!(out.output, "hello\n42\n");
    }

    #[test]
    fn test_variables_persist_across_runs() {
        let mut sb = sandbox();
        sb.run("let total = 10;");
        let out = sb.run("total += 5; total");
        assert_eq!(out.output, "15\n");
    }

    #[test]
    fn test_functions_persist_across_runs() {
        let mut sb = sandbox();
        assert!(sb.run("fn double(x) { x * 2 }").error.is_none());
        assert_eq!(sb.run("double(21)").output, "42\n");
    }

    #[test]
    fn test_injected_variables_visible() {
        let mut sb = sandbox();
        sb.set_var("context", "alpha beta".to_string());
        assert_eq!(sb.run("context.len()").output, "10\n");
    }

    #[test]
    fn test_execution_failure_captured() {
        let mut sb = sandbox();
        sb.run("let kept = 1;");
        let out = sb.run("print(\"before\"); undefined_fn();");
        assert!(matches!(out.error, Some(ErrorKind::ExecutionFailure { .. })));
        assert_eq!(out.output, "before\n");
        assert_eq!(sb.run("kept").output, "1\n");
    }

    #[test]
    fn test_syntax_error_is_execution_failure() {
        let mut sb = sandbox();
        let out = sb.run("let = ;");
        assert!(matches!(out.error, Some(ErrorKind::ExecutionFailure { .. })));
    }

    #[test]
    fn test_signal_final_by_name() {
        let mut sb = sandbox();
        let out = sb.run("let answer = \"forty two\"; signal_final(\"answer\");");
        assert!(out.error.is_none());
        assert_eq!(out.final_answer.as_deref(), Some("forty two"));
    }

    #[test]
    fn test_final_var_alias_renders_non_string() {
        let mut sb = sandbox();
        sb.run("let n = 7;");
        let out = sb.run("FINAL_VAR(\"n\")");
        assert_eq!(out.final_answer.as_deref(), Some("7"));
    }

    #[test]
    fn test_signal_final_unknown_variable() {
        let mut sb = sandbox();
        let out = sb.run("signal_final(\"missing\");");
        assert_eq!(
            out.error,
            Some(ErrorKind::UnknownVariable {
                name: "missing".into()
            })
        );
        assert!(out.final_answer.is_none());
    }

    #[test]
    fn test_signal_final_with_literal_is_wrong_type() {
        let mut sb = sandbox();
        let out = sb.run("signal_final(42);");
        assert_eq!(
            out.error,
            Some(ErrorKind::WrongArgumentType { found: "i64".into() })
        );
        assert!(out.final_answer.is_none());
    }

    #[test]
    fn test_signal_final_with_answer_text_is_wrong_type() {
        let mut sb = sandbox();
        let out = sb.run("signal_final(\"The answer is 42\");");
        match out.error {
            Some(ErrorKind::WrongArgumentType { found }) => {
                assert_eq!(found, "string 'The answer is 42'")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(out.final_answer.is_none());

        let out = sb.run("let a = \"x y\"; signal_final(a);");
        assert!(matches!(out.error, Some(ErrorKind::WrongArgumentType { .. })));
        assert!(out.final_answer.is_none());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("answer"));
        assert!(is_identifier("_tmp2"));
        assert!(!is_identifier("2nd"));
        assert!(!is_identifier("forty two"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_final_request_does_not_leak_into_next_run() {
        let mut sb = sandbox();
        sb.run("let a = 1; signal_final(\"a\");");
        assert!(sb.run("a").final_answer.is_none());
    }

    #[test]
    fn test_operation_limit_enforced() {
        let limits = SandboxConfig {
            max_operations: 1_000,
            ..Default::default()
        };
        let mut sb = Sandbox::new(&limits, &ToolBridge::empty(), None);
        let out = sb.run("let i = 0; loop { i += 1; }");
        assert!(matches!(out.error, Some(ErrorKind::ExecutionFailure { .. })));
    }

    #[test]
    fn test_tools_unbound_when_not_configured() {
        let mut sb = sandbox();
        let out = sb.run("scan(\"x\")");
        assert!(out.error.is_some());
        let out = sb.run("llm_query(\"x\")");
        assert!(out.error.is_some());
    }

    #[test]
    fn test_scan_bound_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "alpha\nneedle here\n").unwrap();
        let bridge = ToolBridge::empty().with_pattern_search(Arc::new(
            crate::tools::pattern::LocalPatternSearch::new(dir.path(), 10),
        ));
        let mut sb = Sandbox::new(&SandboxConfig::default(), &bridge, None);
        let out = sb.run("let hits = scan(\"needle\"); hits[0].line");
        assert!(out.error.is_none(), "{:?}", out.error);
        assert_eq!(out.output, "2\n");
        let out = sb.run("scan(\"NEEDLE\", [], #{case_sensitive: false}).len()");
        assert_eq!(out.output, "1\n");
    }

    struct Refuse;

    impl RecursionHandle for Refuse {
        fn spawn_child(
            &self,
            _prompt: &str,
            _tools: Option<Vec<String>>,
            _model: Option<&str>,
        ) -> Result<StopSignal, RlmError> {
            Ok(StopSignal::DepthExhausted)
        }
    }

    struct Echo;

    impl RecursionHandle for Echo {
        fn spawn_child(
            &self,
            prompt: &str,
            _tools: Option<Vec<String>>,
            model: Option<&str>,
        ) -> Result<StopSignal, RlmError> {
            Ok(StopSignal::FinalAnswer {
                value: format!("{prompt}@{}", model.unwrap_or("inherit")),
            })
        }
    }

    #[test]
    fn test_llm_query_depth_exhausted_is_runtime_error() {
        let mut sb = Sandbox::new(
            &SandboxConfig::default(),
            &ToolBridge::empty(),
            Some(Arc::new(Refuse)),
        );
        let out = sb.run("llm_query(\"sub\")");
        match out.error {
            Some(ErrorKind::ExecutionFailure { message }) => {
                assert!(message.contains("depth exhausted"))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(out.child_calls, 1);
    }

    struct Interrupted;

    impl RecursionHandle for Interrupted {
        fn spawn_child(
            &self,
            _prompt: &str,
            _tools: Option<Vec<String>>,
            _model: Option<&str>,
        ) -> Result<StopSignal, RlmError> {
            Ok(StopSignal::UserCancelled {
                partial_answer: Some("half done".into()),
            })
        }
    }

    #[test]
    fn test_llm_query_cancelled_child_is_runtime_error() {
        let mut sb = Sandbox::new(
            &SandboxConfig::default(),
            &ToolBridge::empty(),
            Some(Arc::new(Interrupted)),
        );
        let out = sb.run("let sub = llm_query(\"sub\"); signal_final(\"sub\");");
        match out.error {
            Some(ErrorKind::ExecutionFailure { message }) => {
                assert!(message.contains("sub-task cancelled"), "{message}")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(out.final_answer.is_none());
    }

    #[test]
    fn test_llm_query_returns_child_answer() {
        let mut sb = Sandbox::new(
            &SandboxConfig::default(),
            &ToolBridge::empty(),
            Some(Arc::new(Echo)),
        );
        let out = sb.run("let a = llm_query(\"one\"); let b = llm_query(\"two\", \"cheap\"); a + \" \" + b");
        assert!(out.error.is_none(), "{:?}", out.error);
        assert_eq!(out.output, "one@inherit two@cheap\n");
        assert_eq!(out.child_calls, 2);
    }

    #[test]
    fn test_variable_listing() {
        let mut sb = sandbox();
        sb.run("let s = \"abc\"; let xs = [1, 2];");
        let vars = sb.variables();
        let s = vars.iter().find(|v| v.name == "s").unwrap();
        assert_eq!(s.size, Some(3));
        let xs = vars.iter().find(|v| v.name == "xs").unwrap();
        assert_eq!(xs.type_name, "array");
        assert_eq!(xs.size, Some(2));
    }
}
