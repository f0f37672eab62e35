// src/core/orchestrator.rs — Execution controller
//
// Drives one context through Running → AwaitingForcedAnswer → Terminated.
// Every context (root or recursive child) is a `run_context` call with its
// own sandbox, budget tracker and tree recorder.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::budget::{BudgetTracker, SharedTracker};
use super::dispatcher::{Dispatcher, FatalSlot};
use super::inject::InjectWatcher;
use super::sandbox::{RecursionHandle, Sandbox, SnippetOutcome};
use super::system_prompt::{self, PromptContext};
use super::tree::{ExecutionSummary, ExecutionTreeNode, TreeRecorder};
use super::types::*;
use crate::infra::config::SandboxConfig;
use crate::infra::errors::RlmError;
use crate::provider::backend::{Action, Completion, CompletionBackend, CompletionRequest};
use crate::provider::Message;
use crate::tools::{ToolBridge, ToolDeclaration};
use crate::util::cap_chars;

/// Characters of snippet output kept in an iteration record.
const RECORD_OUTPUT_CHARS: usize = 2_000;

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct ControllerSettings {
    sandbox: SandboxConfig,
    child_model: Option<String>,
    inject_file: Option<PathBuf>,
}

/// Runs tasks against a completion backend. Cheap to clone; clones share
/// the backend, settings and cancellation token.
#[derive(Clone)]
pub struct Controller {
    backend: Arc<dyn CompletionBackend>,
    tools: ToolBridge,
    settings: Arc<ControllerSettings>,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

/// Everything needed to start one context.
pub(crate) struct ContextSpec {
    pub depth: u32,
    pub prompt: String,
    pub context: Option<String>,
    pub budget: BudgetSpec,
    pub model: String,
    pub tools: ToolBridge,
}

pub(crate) struct ContextOutcome {
    pub stop: StopSignal,
    pub node: ExecutionTreeNode,
    /// Own plus descendant spend, charged to the parent.
    pub spent: Spend,
}

enum State {
    Running,
    AwaitingForcedAnswer,
    Terminated(StopSignal),
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, RlmError> {
    m.lock()
        .map_err(|_| RlmError::Sandbox("state lock poisoned".into()))
}

impl Controller {
    pub fn new(backend: Arc<dyn CompletionBackend>, tools: ToolBridge) -> Self {
        Self {
            backend,
            tools,
            settings: Arc::new(ControllerSettings::default()),
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    pub fn with_sandbox_config(mut self, config: SandboxConfig) -> Self {
        Arc::make_mut(&mut self.settings).sandbox = config;
        self
    }

    /// Model for sub-tasks that do not name one.
    pub fn with_child_model(mut self, model: Option<String>) -> Self {
        Arc::make_mut(&mut self.settings).child_model = model;
        self
    }

    /// Watch `path` and run its contents in the root environment whenever it changes.
    pub fn with_inject_file(mut self, path: Option<PathBuf>) -> Self {
        Arc::make_mut(&mut self.settings).inject_file = path;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set a callback for real-time progress events.
    pub fn with_progress(mut self, cb: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(cb));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn child_model(&self) -> Option<&str> {
        self.settings.child_model.as_deref()
    }

    /// Fire a progress event if a callback is set.
    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(ref cb) = self.on_progress {
            cb(event);
        }
    }

    /// Run a task to termination.
    ///
    /// Only configuration errors (and internal sandbox failures) come back as
    /// `Err`; every other outcome, including exhausted budgets and
    /// cancellation, is a `RunResult`.
    pub async fn run(
        &self,
        task: &TaskInput,
        budget: BudgetSpec,
        model: &str,
    ) -> Result<RunResult, RlmError> {
        tracing::info!(task_id = %task.id, model, max_depth = budget.max_depth, "Starting run");

        let outcome = self
            .run_context(ContextSpec {
                depth: 0,
                prompt: task.prompt.clone(),
                context: task.context.clone(),
                budget,
                model: model.to_string(),
                tools: self.tools.clone(),
            })
            .await?;

        let stats = ExecutionSummary::from_tree(&outcome.node);
        let stop = outcome.stop;
        Ok(RunResult {
            success: stop.is_success(),
            stop_reason: stop.reason(),
            answer: stop.answer().map(String::from),
            early_exit: !matches!(stop, StopSignal::FinalAnswer { .. }),
            stop,
            execution_tree: Some(outcome.node),
            stats,
        })
    }

    pub(crate) async fn run_context(&self, spec: ContextSpec) -> Result<ContextOutcome, RlmError> {
        let ContextSpec {
            depth,
            prompt,
            context,
            budget,
            model,
            tools,
        } = spec;

        if budget.max_budget.is_some() && !self.backend.reports_cost(&model) {
            return Err(RlmError::Configuration(format!(
                "max_budget is set but the backend reports no cost for model '{model}'"
            )));
        }

        let tracker = BudgetTracker::new(budget.clone()).into_shared();
        let recorder = Arc::new(Mutex::new(TreeRecorder::new(depth, &model, &prompt)));
        let fatal: FatalSlot = Arc::new(Mutex::new(None));

        let dispatcher: Arc<dyn RecursionHandle> = Arc::new(Dispatcher {
            controller: self.clone(),
            depth,
            budget: budget.clone(),
            tracker: tracker.clone(),
            recorder: recorder.clone(),
            model: model.clone(),
            tools: tools.clone(),
            runtime: tokio::runtime::Handle::current(),
            fatal: fatal.clone(),
        });
        let mut sandbox = Sandbox::new(&self.settings.sandbox, &tools, Some(dispatcher));
        let context_chars = context.as_ref().map(|c| c.chars().count());
        sandbox.set_var("context", context.unwrap_or_default());
        sandbox.set_var("question", prompt.clone());

        let inject = if depth == 0 {
            self.settings.inject_file.clone().map(InjectWatcher::new)
        } else {
            None
        };

        let mut run = ContextRun {
            controller: self,
            depth,
            model,
            can_recurse: budget.recursion_allowance() > 0,
            budget,
            tracker,
            recorder,
            sandbox: Arc::new(Mutex::new(sandbox)),
            fatal,
            tools: tools.declarations(),
            history: vec![Message::user(system_prompt::initial_user_message(
                &prompt,
                context_chars,
            ))],
            iteration: 0,
            last_good_output: None,
            cost_reported: false,
            inject,
        };

        tracing::debug!(depth, model = %run.model, "Context started");

        let mut state = if lock(&run.tracker)?.iterations_exhausted() {
            State::AwaitingForcedAnswer
        } else {
            State::Running
        };
        let stop = loop {
            state = match state {
                State::Running => run.running_pass().await?,
                State::AwaitingForcedAnswer => State::Terminated(run.forced_pass().await?),
                State::Terminated(stop) => break stop,
            };
        };

        run.finish(stop)
    }
}

/// Per-context state of the iteration loop.
struct ContextRun<'a> {
    controller: &'a Controller,
    depth: u32,
    model: String,
    budget: BudgetSpec,
    can_recurse: bool,
    tracker: SharedTracker,
    recorder: Arc<Mutex<TreeRecorder>>,
    sandbox: Arc<Mutex<Sandbox>>,
    fatal: FatalSlot,
    tools: Vec<ToolDeclaration>,
    history: Vec<Message>,
    iteration: u32,
    /// Output of the most recent iteration that ran without error.
    last_good_output: Option<String>,
    cost_reported: bool,
    inject: Option<InjectWatcher>,
}

impl ContextRun<'_> {
    fn cancelled(&self) -> State {
        tracing::info!(depth = self.depth, iteration = self.iteration, "Run cancelled");
        State::Terminated(StopSignal::UserCancelled {
            partial_answer: self.last_good_output.clone(),
        })
    }

    async fn running_pass(&mut self) -> Result<State, RlmError> {
        if self.controller.cancel.is_cancelled() {
            return Ok(self.cancelled());
        }
        self.apply_injection().await?;

        let index = self.iteration;
        self.controller.emit(ProgressEvent::IterationStart {
            depth: self.depth,
            iteration: index + 1,
            max_iterations: self.budget.max_iterations,
        });
        let started = Instant::now();

        let request = self.request(false)?;
        let completion = match self.complete(request).await {
            None => return Ok(self.cancelled()),
            Some(Err(e)) if e.is_configuration() => return Err(e),
            Some(Err(e)) => {
                tracing::warn!(depth = self.depth, iteration = index, "Backend request failed: {}", e);
                let error = ErrorKind::BackendFailure {
                    message: e.to_string(),
                };
                lock(&self.recorder)?.record_iteration(IterationRecord {
                    index,
                    code_snippet: String::new(),
                    output: String::new(),
                    error: Some(error.clone()),
                    tokens_used: 0,
                    cost_used: 0.0,
                    duration: started.elapsed(),
                    child_calls: 0,
                    has_final_answer: false,
                    forced: false,
                });
                let breach = lock(&self.tracker)?.charge(0.0, 0, true);
                return self.end_iteration(breach, Some(error.to_string()));
            }
            Some(Ok(c)) => c,
        };

        let (cost, tokens) = self.price(&completion)?;
        self.history.push(Message::assistant(completion.raw.clone()));

        let snippet = match completion.action {
            Action::Final(text) => {
                lock(&self.recorder)?.record_iteration(IterationRecord {
                    index,
                    code_snippet: String::new(),
                    output: cap_chars(&text, RECORD_OUTPUT_CHARS),
                    error: None,
                    tokens_used: tokens,
                    cost_used: cost,
                    duration: started.elapsed(),
                    child_calls: 0,
                    has_final_answer: true,
                    forced: false,
                });
                // A final answer stands even if this charge crosses a limit.
                let _ = lock(&self.tracker)?.charge(cost, tokens, false);
                self.iteration += 1;
                self.emit_iteration_end(index, None)?;
                return Ok(State::Terminated(StopSignal::FinalAnswer { value: text }));
            }
            Action::FinalVar { name, code } => final_var_snippet(&code, &name),
            Action::Code(code) => code,
        };

        if snippet.trim().is_empty() {
            tracing::debug!(depth = self.depth, iteration = index, "Response held no code");
            lock(&self.recorder)?.record_iteration(IterationRecord {
                index,
                code_snippet: String::new(),
                output: String::new(),
                error: None,
                tokens_used: tokens,
                cost_used: cost,
                duration: started.elapsed(),
                child_calls: 0,
                has_final_answer: false,
                forced: false,
            });
            self.history
                .push(Message::user(system_prompt::nudge_message()));
            let breach = lock(&self.tracker)?.charge(cost, tokens, false);
            return self.end_iteration(breach, None);
        }

        lock(&self.tracker)?.hold(Spend { cost, tokens });
        let outcome = self.run_snippet(snippet.clone()).await?;
        if let Some(e) = lock(&self.fatal)?.take() {
            return Err(e);
        }

        tracing::debug!(
            depth = self.depth,
            iteration = index,
            cost,
            tokens,
            children = outcome.child_calls,
            error = outcome.error.is_some(),
            "Snippet finished"
        );

        lock(&self.recorder)?.record_iteration(IterationRecord {
            index,
            code_snippet: snippet,
            output: cap_chars(&outcome.output, RECORD_OUTPUT_CHARS),
            error: outcome.error.clone(),
            tokens_used: tokens,
            cost_used: cost,
            duration: started.elapsed(),
            child_calls: outcome.child_calls,
            has_final_answer: outcome.final_answer.is_some(),
            forced: false,
        });
        let breach = lock(&self.tracker)?.charge(cost, tokens, outcome.error.is_some());

        // An interrupt during the snippet (a cancelled sub-task included)
        // outranks whatever the snippet signalled.
        if self.controller.cancel.is_cancelled() {
            if let Some(value) = outcome.final_answer {
                self.last_good_output = Some(value);
            } else if outcome.error.is_none() && !outcome.output.trim().is_empty() {
                self.last_good_output = Some(outcome.output.trim_end().to_string());
            }
            self.iteration += 1;
            self.emit_iteration_end(index, outcome.error.map(|e| e.to_string()))?;
            return Ok(self.cancelled());
        }

        if let Some(value) = outcome.final_answer {
            self.iteration += 1;
            self.emit_iteration_end(index, None)?;
            return Ok(State::Terminated(StopSignal::FinalAnswer { value }));
        }

        if outcome.error.is_none() && !outcome.output.trim().is_empty() {
            self.last_good_output = Some(outcome.output.trim_end().to_string());
        }
        self.history.push(Message::user(system_prompt::feedback_message(
            &outcome,
            self.controller.settings.sandbox.output_cap,
        )));

        self.end_iteration(breach, outcome.error.map(|e| e.to_string()))
    }

    fn end_iteration(
        &mut self,
        breach: Option<BudgetBreach>,
        error: Option<String>,
    ) -> Result<State, RlmError> {
        let index = self.iteration;
        self.iteration += 1;
        self.emit_iteration_end(index, error)?;

        if let Some(breach) = breach {
            tracing::info!(
                depth = self.depth,
                kind = %breach.kind,
                spent = breach.spent,
                limit = breach.limit,
                "Budget exceeded"
            );
            return Ok(State::Terminated(StopSignal::exceeded(
                breach,
                self.last_good_output.clone(),
            )));
        }
        if lock(&self.tracker)?.iterations_exhausted() {
            tracing::info!(depth = self.depth, "Iterations exhausted, requesting forced answer");
            return Ok(State::AwaitingForcedAnswer);
        }
        Ok(State::Running)
    }

    fn emit_iteration_end(&self, index: u32, error: Option<String>) -> Result<(), RlmError> {
        let cost_so_far = lock(&self.tracker)?.spent().cost;
        self.controller.emit(ProgressEvent::IterationEnd {
            depth: self.depth,
            iteration: index + 1,
            error,
            cost_so_far,
        });
        Ok(())
    }

    /// The single closing request after iterations ran out. Whatever comes
    /// back becomes the forced answer.
    async fn forced_pass(&mut self) -> Result<StopSignal, RlmError> {
        if self.controller.cancel.is_cancelled() {
            return Ok(StopSignal::UserCancelled {
                partial_answer: self.last_good_output.clone(),
            });
        }

        let index = self.iteration;
        let started = Instant::now();
        self.history
            .push(Message::user(system_prompt::forced_answer_message()));
        let request = self.request(true)?;

        let mut record = IterationRecord {
            index,
            code_snippet: String::new(),
            output: String::new(),
            error: None,
            tokens_used: 0,
            cost_used: 0.0,
            duration: Default::default(),
            child_calls: 0,
            has_final_answer: false,
            forced: true,
        };

        let mut interrupted = false;
        let forced_answer = match self.complete(request).await {
            None => {
                return Ok(StopSignal::UserCancelled {
                    partial_answer: self.last_good_output.clone(),
                })
            }
            Some(Err(e)) if e.is_configuration() => return Err(e),
            Some(Err(e)) => {
                tracing::warn!(depth = self.depth, "Forced answer request failed: {}", e);
                record.error = Some(ErrorKind::BackendFailure {
                    message: e.to_string(),
                });
                self.last_good_output.clone()
            }
            Some(Ok(completion)) => {
                let (cost, tokens) = self.price(&completion)?;
                record.cost_used = cost;
                record.tokens_used = tokens;
                match completion.action {
                    Action::Final(text) => Some(text),
                    Action::FinalVar { name, code } => {
                        let snippet = final_var_snippet(&code, &name);
                        lock(&self.tracker)?.hold(Spend { cost, tokens });
                        let outcome = self.run_snippet(snippet.clone()).await?;
                        if let Some(e) = lock(&self.fatal)?.take() {
                            return Err(e);
                        }
                        record.code_snippet = snippet;
                        record.error = outcome.error;
                        record.child_calls = outcome.child_calls;
                        interrupted = self.controller.cancel.is_cancelled();
                        outcome
                            .final_answer
                            .or_else(|| non_empty(completion.raw.trim()))
                    }
                    Action::Code(_) => non_empty(completion.raw.trim()),
                }
            }
        };

        record.has_final_answer = forced_answer.is_some();
        record.output = forced_answer
            .as_deref()
            .map(|a| cap_chars(a, RECORD_OUTPUT_CHARS))
            .unwrap_or_default();
        record.duration = started.elapsed();
        let (cost, tokens, had_error) = (record.cost_used, record.tokens_used, record.error.is_some());
        lock(&self.recorder)?.record_iteration(record);
        // The context ends here whatever the tracker says.
        let _ = lock(&self.tracker)?.charge(cost, tokens, had_error);
        self.iteration += 1;

        if interrupted {
            return Ok(StopSignal::UserCancelled {
                partial_answer: forced_answer.or_else(|| self.last_good_output.clone()),
            });
        }
        Ok(StopSignal::IterationsExhausted { forced_answer })
    }

    /// Run the inject file, if it changed, before the next request.
    async fn apply_injection(&mut self) -> Result<(), RlmError> {
        let Some(watcher) = self.inject.as_mut() else {
            return Ok(());
        };
        let Some(contents) = watcher.poll() else {
            return Ok(());
        };
        let path = watcher.path().display().to_string();

        let outcome = self.run_snippet(contents).await?;
        match &outcome.error {
            Some(err) => tracing::warn!(path = %path, "State injection failed: {}", err),
            None => tracing::info!(path = %path, "Applied state injection"),
        }
        self.controller
            .emit(ProgressEvent::StateInjected { path });
        Ok(())
    }

    fn request(&self, force_final: bool) -> Result<CompletionRequest, RlmError> {
        let variables = lock(&self.sandbox)?.variables();
        let remaining = lock(&self.tracker)?.remaining();
        let system = system_prompt::build_system_prompt(&PromptContext {
            depth: self.depth,
            can_recurse: self.can_recurse,
            tools: &self.tools,
            variables: &variables,
            remaining: &remaining,
        });
        Ok(CompletionRequest {
            model: self.model.clone(),
            system,
            messages: self.history.clone(),
            depth: self.depth,
            force_final,
        })
    }

    /// Backend call, abandoned if the run is cancelled meanwhile.
    async fn complete(&self, request: CompletionRequest) -> Option<Result<Completion, RlmError>> {
        let cancel = self.controller.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.controller.backend.complete(request) => Some(result),
        }
    }

    /// Cost and tokens of a completion. A missing cost while a cost limit is
    /// set cannot be enforced and is a configuration error.
    fn price(&mut self, completion: &Completion) -> Result<(f64, u64), RlmError> {
        let cost = match completion.cost {
            Some(c) => {
                self.cost_reported = true;
                c
            }
            None if self.budget.max_budget.is_some() => {
                return Err(RlmError::Configuration(format!(
                    "max_budget is set but model '{}' returned no cost data",
                    completion.model
                )));
            }
            None => 0.0,
        };
        Ok((cost, completion.usage.total()))
    }

    async fn run_snippet(&self, snippet: String) -> Result<SnippetOutcome, RlmError> {
        let sandbox = self.sandbox.clone();
        tokio::task::spawn_blocking(move || {
            let mut sandbox = lock(&sandbox)?;
            Ok(sandbox.run(&snippet))
        })
        .await
        .map_err(|e| RlmError::Sandbox(format!("snippet evaluation panicked: {e}")))?
    }

    fn finish(self, stop: StopSignal) -> Result<ContextOutcome, RlmError> {
        let (spent, own) = {
            let tracker = lock(&self.tracker)?;
            (tracker.spent(), tracker.own_spent())
        };
        let own_cost = self.cost_reported.then_some(own.cost);
        let node = lock(&self.recorder)?.seal(stop.clone(), own_cost, own.tokens);

        tracing::info!(
            depth = self.depth,
            reason = %stop.reason(),
            iterations = self.iteration,
            cost = spent.cost,
            tokens = spent.tokens,
            "Context finished"
        );
        self.controller.emit(ProgressEvent::Stopped {
            depth: self.depth,
            reason: stop.reason(),
        });

        Ok(ContextOutcome { stop, node, spent })
    }
}

/// Code from a `FINAL_VAR` response followed by the signal for `name`.
fn final_var_snippet(code: &str, name: &str) -> String {
    if code.trim().is_empty() {
        format!("signal_final(\"{name}\");")
    } else {
        format!("{code}\nsignal_final(\"{name}\");")
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
