// src/core/tree.rs — Execution tree recording and aggregate stats

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::types::{IterationRecord, StopSignal};
use crate::util::preview;

const PREVIEW_CHARS: usize = 200;

/// Immutable record of one finished context and its descendants.
///
/// `cost` is the context's own backend spend; descendant spend lives in
/// `children`. `None` means the backend never reported a cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTreeNode {
    depth: u32,
    model: String,
    prompt_preview: String,
    answer_preview: Option<String>,
    stop: StopSignal,
    duration: Duration,
    cost: Option<f64>,
    tokens: u64,
    iterations: Vec<IterationRecord>,
    children: Vec<ExecutionTreeNode>,
}

impl ExecutionTreeNode {
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt_preview(&self) -> &str {
        &self.prompt_preview
    }

    pub fn answer_preview(&self) -> Option<&str> {
        self.answer_preview.as_deref()
    }

    pub fn stop(&self) -> &StopSignal {
        &self.stop
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn iterations(&self) -> &[IterationRecord] {
        &self.iterations
    }

    pub fn children(&self) -> &[ExecutionTreeNode] {
        &self.children
    }

    /// Cost of this node and all descendants. `None` if nothing in the
    /// subtree reported cost.
    pub fn subtree_cost(&self) -> Option<f64> {
        let own = self.cost;
        self.children
            .iter()
            .map(ExecutionTreeNode::subtree_cost)
            .fold(own, |acc, c| match (acc, c) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            })
    }

    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(ExecutionTreeNode::node_count)
            .sum::<usize>()
    }

    /// Pre-order traversal.
    pub fn walk(&self) -> Vec<&ExecutionTreeNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// Position reserved for a child in its parent's `children`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot(usize);

/// Builds an `ExecutionTreeNode` while its context runs.
///
/// Children are reserved when spawned and filled when they finish, so the
/// sealed order is spawn order whatever the completion order.
#[derive(Debug)]
pub struct TreeRecorder {
    depth: u32,
    model: String,
    prompt_preview: String,
    started: Instant,
    iterations: Vec<IterationRecord>,
    children: Vec<Option<ExecutionTreeNode>>,
}

impl TreeRecorder {
    pub fn new(depth: u32, model: impl Into<String>, prompt: &str) -> Self {
        Self {
            depth,
            model: model.into(),
            prompt_preview: preview(prompt, PREVIEW_CHARS),
            started: Instant::now(),
            iterations: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn record_iteration(&mut self, record: IterationRecord) {
        debug_assert!(self
            .iterations
            .last()
            .map_or(true, |last| last.index < record.index));
        self.iterations.push(record);
    }

    pub fn reserve_child(&mut self) -> ChildSlot {
        self.children.push(None);
        ChildSlot(self.children.len() - 1)
    }

    pub fn fill_child(&mut self, slot: ChildSlot, node: ExecutionTreeNode) {
        if let Some(entry) = self.children.get_mut(slot.0) {
            *entry = Some(node);
        }
    }

    /// Close the record. Slots never filled (a child that failed to start)
    /// are dropped. The recorder is left empty.
    pub fn seal(&mut self, stop: StopSignal, own_cost: Option<f64>, tokens: u64) -> ExecutionTreeNode {
        ExecutionTreeNode {
            depth: self.depth,
            model: self.model.clone(),
            prompt_preview: std::mem::take(&mut self.prompt_preview),
            answer_preview: stop.answer().map(|a| preview(a, PREVIEW_CHARS)),
            stop,
            duration: self.started.elapsed(),
            cost: own_cost,
            tokens,
            iterations: std::mem::take(&mut self.iterations),
            children: std::mem::take(&mut self.children).into_iter().flatten().collect(),
        }
    }
}

// ─── Summary ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthStats {
    pub depth: u32,
    pub calls: usize,
    pub cost: Option<f64>,
    /// Seconds, summed over the calls at this depth.
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Number of distinct depth levels reached.
    pub total_depth: usize,
    pub node_count: usize,
    pub total_cost: Option<f64>,
    /// Root wall-clock seconds.
    pub total_duration: f64,
    pub by_depth: Vec<DepthStats>,
}

impl ExecutionSummary {
    pub fn from_tree(root: &ExecutionTreeNode) -> Self {
        let mut by_depth: Vec<DepthStats> = Vec::new();
        for node in root.walk() {
            let idx = match by_depth.iter().position(|d| d.depth == node.depth) {
                Some(i) => i,
                None => {
                    by_depth.push(DepthStats {
                        depth: node.depth,
                        calls: 0,
                        cost: None,
                        duration: 0.0,
                    });
                    by_depth.len() - 1
                }
            };
            let entry = &mut by_depth[idx];
            entry.calls += 1;
            entry.duration += node.duration.as_secs_f64();
            if let Some(c) = node.cost {
                entry.cost = Some(entry.cost.unwrap_or(0.0) + c);
            }
        }
        by_depth.sort_by_key(|d| d.depth);

        Self {
            total_depth: by_depth.len(),
            node_count: root.node_count(),
            total_cost: root.subtree_cost(),
            total_duration: root.duration.as_secs_f64(),
            by_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    fn iteration(index: u32, output: &str) -> IterationRecord {
        IterationRecord {
            index,
            code_snippet: format!("print({index})"),
            output: output.into(),
            error: None,
            tokens_used: 10,
            cost_used: 0.01,
            duration: Duration::from_millis(5),
            child_calls: 0,
            has_final_answer: false,
            forced: false,
        }
    }

    fn leaf(depth: u32, cost: Option<f64>) -> ExecutionTreeNode {
        let mut rec = TreeRecorder::new(depth, "child/model", "sub task");
        rec.record_iteration(iteration(0, "ok"));
        rec.seal(
            StopSignal::FinalAnswer {
                value: "leaf".into(),
            },
            cost,
            20,
        )
    }

    #[test]
    fn test_children_keep_spawn_order() {
        let mut root = TreeRecorder::new(0, "root/model", "task");
        let first = root.reserve_child();
        let second = root.reserve_child();
        root.fill_child(second, leaf(1, Some(0.2)));
        root.fill_child(first, leaf(1, Some(0.1)));
        let node = root.seal(
            StopSignal::FinalAnswer { value: "x".into() },
            Some(0.5),
            100,
        );
        assert_eq!(node.children().len(), 2);
        assert_eq!(node.children()[0].cost(), Some(0.1));
        assert_eq!(node.children()[1].cost(), Some(0.2));
    }

    #[test]
    fn test_unfilled_slot_dropped() {
        let mut root = TreeRecorder::new(0, "m", "task");
        let _ = root.reserve_child();
        let filled = root.reserve_child();
        root.fill_child(filled, leaf(1, None));
        let node = root.seal(StopSignal::UserCancelled { partial_answer: None }, None, 0);
        assert_eq!(node.children().len(), 1);
    }

    #[test]
    fn test_seal_captures_answer_preview() {
        let mut rec = TreeRecorder::new(0, "m", "line one\nline two");
        let node = rec.seal(
            StopSignal::FinalAnswer {
                value: "a".repeat(500),
            },
            None,
            0,
        );
        assert_eq!(node.prompt_preview(), "line one line two");
        assert_eq!(node.answer_preview().unwrap().chars().count(), PREVIEW_CHARS);
    }

    #[test]
    fn test_summary_aggregates_by_depth() {
        let mut root = TreeRecorder::new(0, "m", "task");
        root.record_iteration(iteration(0, "x"));
        for cost in [Some(0.1), None] {
            let slot = root.reserve_child();
            root.fill_child(slot, leaf(1, cost));
        }
        let node = root.seal(StopSignal::FinalAnswer { value: "v".into() }, Some(0.25), 50);
        let summary = ExecutionSummary::from_tree(&node);
        assert_eq!(summary.total_depth, 2);
        assert_eq!(summary.node_count, 3);
        assert!((summary.total_cost.unwrap() - 0.35).abs() < 1e-12);
        assert_eq!(summary.by_depth[0].calls, 1);
        assert_eq!(summary.by_depth[1].calls, 2);
        assert_eq!(summary.by_depth[1].cost, Some(0.1));
    }

    #[test]
    fn test_summary_cost_none_when_unreported() {
        let node = leaf(0, None);
        assert_eq!(ExecutionSummary::from_tree(&node).total_cost, None);
    }

    #[test]
    fn test_serde_roundtrip_preserves_order_and_numbers() {
        let mut root = TreeRecorder::new(0, "m", "task");
        root.record_iteration(iteration(0, "first"));
        let mut failed = iteration(1, "");
        failed.error = Some(ErrorKind::ExecutionFailure {
            message: "boom".into(),
        });
        root.record_iteration(failed);
        let slot = root.reserve_child();
        root.fill_child(slot, leaf(1, Some(0.0123456789)));
        let node = root.seal(StopSignal::FinalAnswer { value: "v".into() }, Some(1.5), 7);

        let json = serde_json::to_string(&node).unwrap();
        let back: ExecutionTreeNode = serde_json::from_str(&json).unwrap();
        pretty_assertions::assert_eq!(back, node);
        assert_eq!(back.iterations()[1].index, 1);
        assert_eq!(back.children()[0].cost(), Some(0.0123456789));
    }

    #[test]
    fn test_serde_roundtrip_keeps_full_precision_costs() {
        let cost = 0.0014244938635587807;
        let mut root = TreeRecorder::new(0, "m", "task");
        let mut spent = iteration(0, "x");
        spent.cost_used = cost / 7.0;
        root.record_iteration(spent);
        let slot = root.reserve_child();
        root.fill_child(slot, leaf(1, Some(cost / 3.0)));
        let node = root.seal(StopSignal::FinalAnswer { value: "v".into() }, Some(cost), 12);

        let json = serde_json::to_string_pretty(&node).unwrap();
        let back: ExecutionTreeNode = serde_json::from_str(&json).unwrap();
        pretty_assertions::assert_eq!(back, node);
        assert_eq!(back.cost(), Some(cost));
        assert_eq!(back.children()[0].cost(), Some(cost / 3.0));
    }
}
