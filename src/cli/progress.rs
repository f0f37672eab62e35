// src/cli/progress.rs — Terminal progress renderer for real-time run feedback

use crate::core::types::ProgressEvent;

/// Build a progress callback that writes formatted output to stderr.
///
/// All progress output goes to stderr so stdout remains clean for the answer.
/// Returns a closure suitable for `Controller::with_progress()`.
pub fn terminal_progress() -> impl Fn(ProgressEvent) + Send + Sync + 'static {
    move |event| eprintln!("{}", format_event(&event))
}

fn indent(depth: u32) -> String {
    "  ".repeat(depth as usize)
}

pub fn format_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::IterationStart {
            depth,
            iteration,
            max_iterations,
        } => match max_iterations {
            Some(max) => format!("{}[iter {}/{}] thinking...", indent(*depth), iteration, max),
            None => format!("{}[iter {}] thinking...", indent(*depth), iteration),
        },
        ProgressEvent::IterationEnd {
            depth,
            iteration,
            error,
            cost_so_far,
        } => match error {
            Some(e) => format!(
                "{}[iter {}] error: {} (${:.4})",
                indent(*depth),
                iteration,
                crate::util::truncate_str(e, 80),
                cost_so_far
            ),
            None => format!("{}[iter {}] ok (${:.4})", indent(*depth), iteration, cost_so_far),
        },
        ProgressEvent::StateInjected { path } => format!("[inject] applied {}", path),
        ProgressEvent::ChildSpawned {
            parent_depth,
            model,
        } => format!("{}[spawn] depth {} | {}", indent(*parent_depth), parent_depth + 1, model),
        ProgressEvent::Stopped { depth, reason } => {
            format!("{}[done] depth {}: {}", indent(*depth), depth, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BudgetKind, StopReason};

    #[test]
    fn test_iteration_start_format() {
        let msg = format_event(&ProgressEvent::IterationStart {
            depth: 0,
            iteration: 1,
            max_iterations: Some(3),
        });
        assert_eq!(msg, "[iter 1/3] thinking...");

        let msg = format_event(&ProgressEvent::IterationStart {
            depth: 1,
            iteration: 4,
            max_iterations: None,
        });
        assert_eq!(msg, "  [iter 4] thinking...");
    }

    #[test]
    fn test_iteration_end_format() {
        let msg = format_event(&ProgressEvent::IterationEnd {
            depth: 0,
            iteration: 2,
            error: None,
            cost_so_far: 0.0412,
        });
        assert_eq!(msg, "[iter 2] ok ($0.0412)");

        let msg = format_event(&ProgressEvent::IterationEnd {
            depth: 0,
            iteration: 3,
            error: Some("execution failed: boom".into()),
            cost_so_far: 0.05,
        });
        assert!(msg.contains("error: execution failed: boom"));
    }

    #[test]
    fn test_spawn_and_stop_format() {
        let msg = format_event(&ProgressEvent::ChildSpawned {
            parent_depth: 0,
            model: "cheap/model".into(),
        });
        assert_eq!(msg, "[spawn] depth 1 | cheap/model");

        let msg = format_event(&ProgressEvent::Stopped {
            depth: 1,
            reason: StopReason::BudgetExceeded(BudgetKind::Cost),
        });
        assert_eq!(msg, "  [done] depth 1: budget_exceeded(cost)");
    }

    #[test]
    fn test_injected_format() {
        let msg = format_event(&ProgressEvent::StateInjected {
            path: "state.rhai".into(),
        });
        assert_eq!(msg, "[inject] applied state.rhai");
    }
}
