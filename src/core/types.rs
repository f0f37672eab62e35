// src/core/types.rs — Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::tree::{ExecutionSummary, ExecutionTreeNode};

/// Limits bounding one context. Supplied at the root and recomputed (never
/// mutated) for each recursive child. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub max_iterations: Option<u32>,
    pub max_budget: Option<f64>,
    pub max_timeout: Option<Duration>,
    pub max_tokens: Option<u64>,
    pub max_errors: Option<u32>,
    /// Levels of the call tree this context may occupy, itself included.
    /// 1 means the context may not recurse.
    pub max_depth: u32,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            max_iterations: None,
            max_budget: None,
            max_timeout: None,
            max_tokens: None,
            max_errors: None,
            max_depth: 1,
        }
    }
}

impl BudgetSpec {
    /// How many more levels of recursion this context may spawn.
    pub fn recursion_allowance(&self) -> u32 {
        self.max_depth.saturating_sub(1)
    }

    /// Derive the limits for a child spawned now.
    ///
    /// `self` holds the parent's original limits; cost and time are the parent's
    /// *remaining* values at spawn time. Tokens and errors are per-context
    /// pools and are copied unchanged. Returns `None` when the depth budget
    /// is spent.
    pub fn derive_child(
        &self,
        remaining_cost: Option<f64>,
        remaining_time: Option<Duration>,
    ) -> Option<BudgetSpec> {
        if self.recursion_allowance() == 0 {
            return None;
        }
        Some(BudgetSpec {
            max_iterations: self.max_iterations,
            max_budget: remaining_cost,
            max_timeout: remaining_time,
            max_tokens: self.max_tokens,
            max_errors: self.max_errors,
            max_depth: self.max_depth - 1,
        })
    }
}

/// Which limit tripped. Declaration order is the evaluation priority when
/// several cross in the same charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetKind {
    Errors,
    Tokens,
    Cost,
    Timeout,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetKind::Errors => write!(f, "errors"),
            BudgetKind::Tokens => write!(f, "tokens"),
            BudgetKind::Cost => write!(f, "cost"),
            BudgetKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// A crossed limit as reported by the budget tracker.
/// Timeout values are seconds, token values are counts, cost is USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreach {
    pub kind: BudgetKind,
    pub spent: f64,
    pub limit: f64,
}

/// Recoverable per-iteration failure. Counted against the error budget,
/// never propagated out of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    ExecutionFailure { message: String },
    UnknownVariable { name: String },
    WrongArgumentType { found: String },
    BackendFailure { message: String },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ExecutionFailure { message } => write!(f, "execution failed: {message}"),
            ErrorKind::UnknownVariable { name } => {
                write!(f, "unknown variable '{name}': define it before signalling it as final")
            }
            ErrorKind::WrongArgumentType { found } => write!(
                f,
                "signal_final expects a variable name (string), got {found}"
            ),
            ErrorKind::BackendFailure { message } => write!(f, "backend request failed: {message}"),
        }
    }
}

/// The single terminal signal of a context. Produced once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum StopSignal {
    FinalAnswer {
        value: String,
    },
    IterationsExhausted {
        forced_answer: Option<String>,
    },
    BudgetExceeded {
        kind: BudgetKind,
        spent: f64,
        limit: f64,
        partial_answer: Option<String>,
    },
    UserCancelled {
        partial_answer: Option<String>,
    },
    /// Only ever returned to a snippet that tried to recurse too deep.
    DepthExhausted,
}

impl StopSignal {
    pub fn exceeded(breach: BudgetBreach, partial_answer: Option<String>) -> Self {
        StopSignal::BudgetExceeded {
            kind: breach.kind,
            spent: breach.spent,
            limit: breach.limit,
            partial_answer,
        }
    }

    /// The answer carried by this signal, final, forced or partial.
    pub fn answer(&self) -> Option<&str> {
        match self {
            StopSignal::FinalAnswer { value } => Some(value),
            StopSignal::IterationsExhausted { forced_answer } => forced_answer.as_deref(),
            StopSignal::BudgetExceeded { partial_answer, .. }
            | StopSignal::UserCancelled { partial_answer } => partial_answer.as_deref(),
            StopSignal::DepthExhausted => None,
        }
    }

    /// Process-level success. Cancellation counts as success; every
    /// budget-exceeded path is a failure.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StopSignal::FinalAnswer { .. }
                | StopSignal::IterationsExhausted { .. }
                | StopSignal::UserCancelled { .. }
        )
    }

    pub fn reason(&self) -> StopReason {
        match self {
            StopSignal::FinalAnswer { .. } => StopReason::FinalAnswer,
            StopSignal::IterationsExhausted { .. } => StopReason::IterationsExhausted,
            StopSignal::BudgetExceeded { kind, .. } => StopReason::BudgetExceeded(*kind),
            StopSignal::UserCancelled { .. } => StopReason::UserCancelled,
            StopSignal::DepthExhausted => StopReason::Error,
        }
    }
}

/// Reason reported to the caller of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FinalAnswer,
    IterationsExhausted,
    BudgetExceeded(BudgetKind),
    UserCancelled,
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::FinalAnswer => write!(f, "final_answer"),
            StopReason::IterationsExhausted => write!(f, "iterations_exhausted"),
            StopReason::BudgetExceeded(kind) => write!(f, "budget_exceeded({kind})"),
            StopReason::UserCancelled => write!(f, "user_cancelled"),
            StopReason::Error => write!(f, "error"),
        }
    }
}

impl Serialize for StopReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// One pass of the iteration loop. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub code_snippet: String,
    /// Captured output, truncated to the display cap.
    pub output: String,
    pub error: Option<ErrorKind>,
    pub tokens_used: u64,
    pub cost_used: f64,
    pub duration: Duration,
    /// Recursive children spawned by this iteration's snippet.
    #[serde(default)]
    pub child_calls: usize,
    #[serde(default)]
    pub has_final_answer: bool,
    /// The synthetic closing request issued after iterations ran out.
    #[serde(default)]
    pub forced: bool,
}

/// Cumulative spend of a context, descendants included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Spend {
    pub cost: f64,
    pub tokens: u64,
}

/// Input to a run: the task and an optional context payload bound to the
/// `context` variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub id: String,
    pub prompt: String,
    pub context: Option<String>,
}

impl TaskInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Result exposed to the top-level caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub stop_reason: StopReason,
    pub answer: Option<String>,
    pub early_exit: bool,
    pub stop: StopSignal,
    pub execution_tree: Option<ExecutionTreeNode>,
    pub stats: ExecutionSummary,
}

/// Real-time lifecycle events, delivered to an optional callback.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    IterationStart {
        depth: u32,
        iteration: u32,
        max_iterations: Option<u32>,
    },
    IterationEnd {
        depth: u32,
        iteration: u32,
        error: Option<String>,
        cost_so_far: f64,
    },
    StateInjected {
        path: String,
    },
    ChildSpawned {
        parent_depth: u32,
        model: String,
    },
    Stopped {
        depth: u32,
        reason: StopReason,
    },
}
