// src/core/system_prompt.rs — Prompt text for each context

use super::sandbox::{SnippetOutcome, VariableInfo};
use super::types::BudgetSpec;
use crate::tools::ToolDeclaration;
use crate::util::cap_chars;

/// Everything the system prompt describes for one request.
pub struct PromptContext<'a> {
    pub depth: u32,
    pub can_recurse: bool,
    pub tools: &'a [ToolDeclaration],
    pub variables: &'a [VariableInfo],
    pub remaining: &'a BudgetSpec,
}

/// Build the system prompt sent with every request of a context.
///
/// Sections (in order):
///   1. Protocol: how to run code and how to finish
///   2. Tools: configured tool handles and `llm_query` when recursion is allowed
///   3. Environment: current variables with type and size
///   4. Budget: what is left
pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::with_capacity(4096);

    append_protocol_section(&mut prompt, ctx.depth);
    append_tools_section(&mut prompt, ctx.tools, ctx.can_recurse);
    append_environment_section(&mut prompt, ctx.variables);
    append_budget_section(&mut prompt, ctx.remaining);

    prompt
}

// ─── Section builders ───────────────────────────────────────────────────────

fn append_protocol_section(prompt: &mut String, depth: u32) {
    prompt.push_str("# Protocol\n\n");
    if depth > 0 {
        prompt.push_str(&format!(
            "You are a sub-task at recursion depth {depth}. Answer only what you were asked.\n\n"
        ));
    }
    prompt.push_str(
        "You solve the task by writing Rhai code in ```rhai fenced blocks. Each block runs \
         in a persistent environment: top-level `let` variables and `fn` definitions survive \
         into later turns. After every run you see the printed output and the value of the \
         last expression.\n\n\
         The task input is in the variable `context` and the question in `question`. Inspect \
         them with code rather than asking for them to be repeated.\n\n\
         When you are done, finish with one of:\n\
         - `FINAL(your answer)` on its own line, outside code\n\
         - `FINAL_VAR(name)` on its own line, outside code, naming a variable that holds the answer\n\
         - `signal_final(\"name\")` inside code, passing the variable *name* as a string\n\n\
         `log(msg)` writes to the host log; `print(x)` writes to your output.\n\n",
    );
}

fn append_tools_section(prompt: &mut String, tools: &[ToolDeclaration], can_recurse: bool) {
    if tools.is_empty() && !can_recurse {
        return;
    }
    prompt.push_str("# Tools\n\n");
    for tool in tools {
        prompt.push_str(&format!("- `{}`: {}\n", tool.usage, tool.description));
    }
    if can_recurse {
        prompt.push_str(
            "- `llm_query(prompt)` / `llm_query(prompt, model)` / `llm_query(prompt, model, tools)`: \
             run a sub-task with its own fresh environment and return its answer as a string. \
             Pass \"\" as model to keep the current one. Sub-tasks share your cost and time budget.\n",
        );
    }
    prompt.push('\n');
}

fn append_environment_section(prompt: &mut String, variables: &[VariableInfo]) {
    prompt.push_str("# Environment\n\n");
    if variables.is_empty() {
        prompt.push_str("(no variables)\n\n");
        return;
    }
    for v in variables {
        match v.size {
            Some(size) => prompt.push_str(&format!("- `{}`: {} ({size})\n", v.name, v.type_name)),
            None => prompt.push_str(&format!("- `{}`: {}\n", v.name, v.type_name)),
        }
    }
    prompt.push('\n');
}

fn append_budget_section(prompt: &mut String, remaining: &BudgetSpec) {
    let mut lines = Vec::new();
    if let Some(i) = remaining.max_iterations {
        lines.push(format!("- iterations left: {i}"));
    }
    if let Some(c) = remaining.max_budget {
        lines.push(format!("- cost left: ${c:.4}"));
    }
    if let Some(t) = remaining.max_timeout {
        lines.push(format!("- time left: {}s", t.as_secs()));
    }
    if let Some(t) = remaining.max_tokens {
        lines.push(format!("- tokens left: {t}"));
    }
    if lines.is_empty() {
        return;
    }
    prompt.push_str("# Budget\n\n");
    prompt.push_str(&lines.join("\n"));
    prompt.push_str("\n\n");
}

// ─── Conversation messages ──────────────────────────────────────────────────

pub fn initial_user_message(question: &str, context_chars: Option<usize>) -> String {
    match context_chars {
        Some(n) => format!(
            "{question}\n\n(`context` holds {n} characters of input. Start by exploring it with code.)"
        ),
        None => question.to_string(),
    }
}

/// What the model sees after its snippet ran.
pub fn feedback_message(outcome: &SnippetOutcome, cap: usize) -> String {
    let mut msg = String::new();
    if let Some(err) = &outcome.error {
        msg.push_str(&format!("Error: {err}\n"));
    }
    if outcome.output.trim().is_empty() {
        msg.push_str("Output: (none)");
    } else {
        msg.push_str("Output:\n");
        msg.push_str(&cap_chars(&outcome.output, cap));
    }
    msg
}

pub fn nudge_message() -> &'static str {
    "No code block found. Write a ```rhai block to make progress, or finish with FINAL(...) / FINAL_VAR(name)."
}

pub fn forced_answer_message() -> &'static str {
    "You are out of iterations. Reply now with your final answer as FINAL(your answer). Do not write more code."
}
