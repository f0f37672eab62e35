// src/core/dispatcher.rs — Recursive sub-task dispatch
//
// One dispatcher per context. It runs on the sandbox thread (inside
// `spawn_blocking`), so it drives the child controller to completion with
// `Handle::block_on` and hands the child's stop signal back to the snippet.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

use super::budget::SharedTracker;
use super::orchestrator::{lock, ContextSpec, Controller};
use super::sandbox::RecursionHandle;
use super::tree::TreeRecorder;
use super::types::{BudgetSpec, ProgressEvent, StopSignal};
use crate::infra::errors::RlmError;
use crate::tools::ToolBridge;

/// Slot through which a child's fatal error reaches the parent controller.
/// The snippet only sees a runtime error; the parent checks this slot after
/// the snippet returns and aborts the whole run.
pub(crate) type FatalSlot = Arc<Mutex<Option<RlmError>>>;

pub(crate) struct Dispatcher {
    pub(crate) controller: Controller,
    pub(crate) depth: u32,
    /// The parent context's original limits.
    pub(crate) budget: BudgetSpec,
    pub(crate) tracker: SharedTracker,
    pub(crate) recorder: Arc<Mutex<TreeRecorder>>,
    pub(crate) model: String,
    pub(crate) tools: ToolBridge,
    pub(crate) runtime: Handle,
    pub(crate) fatal: FatalSlot,
}

impl Dispatcher {
    fn child_model(&self, model_override: Option<&str>) -> String {
        model_override
            .map(String::from)
            .or_else(|| self.controller.child_model().map(String::from))
            .unwrap_or_else(|| self.model.clone())
    }
}

impl RecursionHandle for Dispatcher {
    fn spawn_child(
        &self,
        prompt: &str,
        tools: Option<Vec<String>>,
        model_override: Option<&str>,
    ) -> Result<StopSignal, RlmError> {
        let remaining = lock(&self.tracker)?.remaining();
        let Some(child_budget) = self
            .budget
            .derive_child(remaining.max_budget, remaining.max_timeout)
        else {
            tracing::debug!(depth = self.depth, "Recursion refused, depth budget spent");
            return Ok(StopSignal::DepthExhausted);
        };

        let model = self.child_model(model_override);
        let tools = match tools {
            Some(names) => self.tools.restricted(&names),
            None => self.tools.clone(),
        };

        let slot = lock(&self.recorder)?.reserve_child();
        self.controller.emit(ProgressEvent::ChildSpawned {
            parent_depth: self.depth,
            model: model.clone(),
        });
        tracing::info!(
            depth = self.depth + 1,
            model = %model,
            budget = ?child_budget.max_budget,
            "Spawning sub-task"
        );

        let spec = ContextSpec {
            depth: self.depth + 1,
            prompt: prompt.to_string(),
            context: None,
            budget: child_budget,
            model,
            tools,
        };

        match self.runtime.block_on(self.controller.run_context(spec)) {
            Ok(outcome) => {
                lock(&self.tracker)?.absorb_child(outcome.spent);
                lock(&self.recorder)?.fill_child(slot, outcome.node);
                Ok(outcome.stop)
            }
            Err(e) => {
                let message = e.to_string();
                if let Ok(mut fatal) = self.fatal.lock() {
                    if fatal.is_none() {
                        *fatal = Some(e);
                    }
                }
                Err(RlmError::Sandbox(format!("sub-task aborted: {message}")))
            }
        }
    }
}
