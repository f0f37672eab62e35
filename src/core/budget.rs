// src/core/budget.rs — Budget accounting for one context

use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::types::{BudgetBreach, BudgetKind, BudgetSpec, Spend};

/// Shared between a context's controller and its recursion dispatcher.
/// The mutex is the single mutual-exclusion point around charges.
pub type SharedTracker = Arc<Mutex<BudgetTracker>>;

/// Tracks iterations, spend, wall-clock time, tokens and the consecutive
/// error streak of one context against its limits.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    limits: BudgetSpec,
    started: Instant,
    iterations_used: u32,
    own: Spend,
    descendants: Spend,
    /// Spend of the iteration in progress, not yet charged.
    pending: Spend,
    consecutive_errors: u32,
}

impl BudgetTracker {
    pub fn new(limits: BudgetSpec) -> Self {
        Self::started_at(limits, Instant::now())
    }

    pub fn started_at(limits: BudgetSpec, started: Instant) -> Self {
        Self {
            limits,
            started,
            iterations_used: 0,
            own: Spend::default(),
            descendants: Spend::default(),
            pending: Spend::default(),
            consecutive_errors: 0,
        }
    }

    pub fn into_shared(self) -> SharedTracker {
        Arc::new(Mutex::new(self))
    }

    /// Account for one completed iteration. Returns the first crossed limit
    /// in the order errors, tokens, cost, timeout; `None` means continue.
    pub fn charge(&mut self, cost: f64, tokens: u64, had_error: bool) -> Option<BudgetBreach> {
        self.charge_at(cost, tokens, had_error, Instant::now())
    }

    pub fn charge_at(
        &mut self,
        cost: f64,
        tokens: u64,
        had_error: bool,
        now: Instant,
    ) -> Option<BudgetBreach> {
        self.iterations_used = self.iterations_used.saturating_add(1);
        self.pending = Spend::default();
        self.own.cost += cost.max(0.0);
        self.own.tokens = self.own.tokens.saturating_add(tokens);
        if had_error {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        } else {
            self.consecutive_errors = 0;
        }
        self.check_at(now)
    }

    /// Hold the spend of the current iteration's backend call until its
    /// `charge`, so children spawned meanwhile see it in `remaining`.
    pub fn hold(&mut self, pending: Spend) {
        self.pending = pending;
    }

    /// Fold a finished child's total spend into this context. Does not
    /// consume an iteration or touch the error streak; limits are evaluated
    /// at the next `charge`.
    pub fn absorb_child(&mut self, spent: Spend) {
        self.descendants.cost += spent.cost.max(0.0);
        self.descendants.tokens = self.descendants.tokens.saturating_add(spent.tokens);
    }

    fn check_at(&self, now: Instant) -> Option<BudgetBreach> {
        if let Some(limit) = self.limits.max_errors {
            if self.consecutive_errors > limit {
                return Some(BudgetBreach {
                    kind: BudgetKind::Errors,
                    spent: self.consecutive_errors as f64,
                    limit: limit as f64,
                });
            }
        }

        let spent = self.spent();

        if let Some(limit) = self.limits.max_tokens {
            if spent.tokens > limit {
                return Some(BudgetBreach {
                    kind: BudgetKind::Tokens,
                    spent: spent.tokens as f64,
                    limit: limit as f64,
                });
            }
        }

        if let Some(limit) = self.limits.max_budget {
            if spent.cost > limit {
                return Some(BudgetBreach {
                    kind: BudgetKind::Cost,
                    spent: spent.cost,
                    limit,
                });
            }
        }

        if let Some(limit) = self.limits.max_timeout {
            let elapsed = now.saturating_duration_since(self.started);
            if elapsed > limit {
                return Some(BudgetBreach {
                    kind: BudgetKind::Timeout,
                    spent: elapsed.as_secs_f64(),
                    limit: limit.as_secs_f64(),
                });
            }
        }

        None
    }

    /// Snapshot of what is left. Every field is non-increasing over the
    /// life of the context; the error limit and depth are constant.
    pub fn remaining(&self) -> BudgetSpec {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> BudgetSpec {
        let spent = self.spent();
        let spent = Spend {
            cost: spent.cost + self.pending.cost,
            tokens: spent.tokens.saturating_add(self.pending.tokens),
        };
        BudgetSpec {
            max_iterations: self
                .limits
                .max_iterations
                .map(|l| l.saturating_sub(self.iterations_used)),
            max_budget: self.limits.max_budget.map(|l| (l - spent.cost).max(0.0)),
            max_timeout: self
                .limits
                .max_timeout
                .map(|l| l.saturating_sub(now.saturating_duration_since(self.started))),
            max_tokens: self.limits.max_tokens.map(|l| l.saturating_sub(spent.tokens)),
            max_errors: self.limits.max_errors,
            max_depth: self.limits.max_depth,
        }
    }

    pub fn remaining_cost(&self) -> Option<f64> {
        self.remaining().max_budget
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.limits
            .max_iterations
            .is_some_and(|l| self.iterations_used >= l)
    }

    pub fn iterations_used(&self) -> u32 {
        self.iterations_used
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Total spend, descendants included.
    pub fn spent(&self) -> Spend {
        Spend {
            cost: self.own.cost + self.descendants.cost,
            tokens: self.own.tokens.saturating_add(self.descendants.tokens),
        }
    }

    /// Spend of this context's own backend calls.
    pub fn own_spent(&self) -> Spend {
        self.own
    }
}
