// src/cli/mod.rs — CLI definition (clap derive)

pub mod context;
pub mod progress;
pub mod run;

use std::path::PathBuf;

use clap::Parser;

use crate::infra::config::{Config, OutputFormat};
use context::ContextOptions;

#[derive(Parser, Debug)]
#[command(
    name = "rlm",
    about = "Answer a question by letting a model write and run code, recursively",
    version
)]
pub struct Cli {
    /// Question to answer
    #[arg(trailing_var_arg = true, required = true)]
    pub question: Vec<String>,

    /// File or directory loaded into the `context` variable (repeatable)
    #[arg(short, long = "context", value_name = "PATH")]
    pub context: Vec<PathBuf>,

    /// Only read files with these extensions from context directories
    #[arg(long = "ext", value_name = "EXT", value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Skip context-directory files matching this glob (repeatable)
    #[arg(long, value_name = "GLOB")]
    pub exclude: Vec<String>,

    /// Read ignored files from context directories too
    #[arg(long)]
    pub no_gitignore: bool,

    /// Model for the root context
    #[arg(short, long)]
    pub model: Option<String>,

    /// Model for sub-tasks that do not name one
    #[arg(long)]
    pub child_model: Option<String>,

    /// Iterations before a final answer is forced
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Cost limit in USD for the whole call tree
    #[arg(long)]
    pub max_budget: Option<f64>,

    /// Wall-clock limit in seconds for the whole call tree
    #[arg(long, value_name = "SECS")]
    pub max_timeout: Option<u64>,

    /// Token limit per context
    #[arg(long)]
    pub max_tokens: Option<u64>,

    /// Consecutive failed iterations tolerated per context
    #[arg(long)]
    pub max_errors: Option<u32>,

    /// Levels of the call tree, the root included (1 = no recursion)
    #[arg(long)]
    pub max_depth: Option<u32>,

    /// Snippet file re-run in the root environment whenever it changes
    #[arg(long, value_name = "PATH")]
    pub inject_file: Option<PathBuf>,

    /// Emit one JSON object on stdout
    #[arg(long)]
    pub json: bool,

    /// Do not print the execution tree
    #[arg(long)]
    pub no_tree: bool,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file path
    #[arg(long)]
    pub config: Option<String>,

    /// Debug logging on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn question_text(&self) -> String {
        self.question.join(" ").trim().to_string()
    }

    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            extensions: self.extensions.clone(),
            exclude: self.exclude.clone(),
            respect_gitignore: !self.no_gitignore,
        }
    }

    /// Flags override values from the config file.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref m) = self.model {
            config.models.default = m.clone();
        }
        if self.child_model.is_some() {
            config.models.child = self.child_model.clone();
        }
        let budget = &mut config.budget;
        if let Some(v) = self.max_iterations {
            budget.max_iterations = Some(v);
        }
        if let Some(v) = self.max_budget {
            budget.max_budget = Some(v);
        }
        if let Some(v) = self.max_timeout {
            budget.max_timeout_secs = Some(v);
        }
        if let Some(v) = self.max_tokens {
            budget.max_tokens = Some(v);
        }
        if let Some(v) = self.max_errors {
            budget.max_errors = Some(v);
        }
        if let Some(v) = self.max_depth {
            budget.max_depth = v;
        }
        if self.json {
            config.output.format = OutputFormat::Json;
        }
        if self.no_tree {
            config.output.show_tree = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_question_and_flags() {
        let cli = Cli::try_parse_from([
            "rlm",
            "--max-depth",
            "3",
            "--context",
            "a.txt",
            "--context",
            "b.txt",
            "--json",
            "what",
            "is",
            "this?",
        ])
        .unwrap();
        assert_eq!(cli.question_text(), "what is this?");
        assert_eq!(cli.context.len(), 2);
        assert_eq!(cli.max_depth, Some(3));
        assert!(cli.json);
    }

    #[test]
    fn test_context_directory_flags() {
        let cli = Cli::try_parse_from([
            "rlm", "-c", "src/", "--ext", "rs,toml", "--ext", "md", "--exclude", "gen/*",
            "--no-gitignore", "summarize",
        ])
        .unwrap();
        let options = cli.context_options();
        assert_eq!(options.extensions, vec!["rs", "toml", "md"]);
        assert_eq!(options.exclude, vec!["gen/*"]);
        assert!(!options.respect_gitignore);

        let plain = Cli::try_parse_from(["rlm", "q"]).unwrap();
        assert!(plain.context_options().respect_gitignore);
    }

    #[test]
    fn test_question_required() {
        assert!(Cli::try_parse_from(["rlm"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "rlm",
            "-m",
            "openai/gpt-4.1",
            "--max-budget",
            "0.25",
            "--max-timeout",
            "60",
            "--no-tree",
            "q",
        ])
        .unwrap();
        let mut config = Config::default();
        config.budget.max_iterations = Some(7);
        cli.apply_to(&mut config);

        assert_eq!(config.models.default, "openai/gpt-4.1");
        assert_eq!(config.budget.max_budget, Some(0.25));
        assert_eq!(config.budget.max_timeout_secs, Some(60));
        assert_eq!(config.budget.max_iterations, Some(7));
        assert!(!config.output.show_tree);
        assert_eq!(config.output.format, OutputFormat::Text);
    }
}
