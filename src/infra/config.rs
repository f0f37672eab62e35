// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::types::BudgetSpec;
use crate::infra::errors::RlmError;
use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Root limits. Absent optional fields mean "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_iterations: Option<u32>,
    pub max_depth: u32,
    pub max_budget: Option<f64>,
    pub max_timeout_secs: Option<u64>,
    pub max_tokens: Option<u64>,
    pub max_errors: Option<u32>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iterations: Some(30),
            max_depth: 1,
            max_budget: None,
            max_timeout_secs: None,
            max_tokens: None,
            max_errors: None,
        }
    }
}

impl TryFrom<&BudgetConfig> for BudgetSpec {
    type Error = RlmError;

    fn try_from(cfg: &BudgetConfig) -> Result<Self, Self::Error> {
        if cfg.max_depth == 0 {
            return Err(RlmError::Configuration(
                "max_depth must be at least 1 (1 = no recursion)".into(),
            ));
        }
        Ok(Self {
            max_iterations: cfg.max_iterations,
            max_budget: cfg.max_budget,
            max_timeout: cfg.max_timeout_secs.map(Duration::from_secs),
            max_tokens: cfg.max_tokens,
            max_errors: cfg.max_errors,
            max_depth: cfg.max_depth,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Model used by the root context.
    pub default: String,
    /// Model for recursive children when a snippet does not name one.
    pub child: Option<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: "google/gemini-2.0-flash-001".into(),
            child: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Retries of a transient failure before it counts as a backend failure.
    pub max_retries: u32,
    /// Cap on completion tokens per backend call. Unset leaves it to the provider.
    pub max_tokens: Option<u32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "openrouter".into(),
            base_url: "https://openrouter.ai/api/v1".into(),
            api_key_env: "OPENROUTER_API_KEY".into(),
            max_retries: 3,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    /// Characters of snippet output fed back to the model per iteration.
    pub output_cap: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 5_000_000,
            max_string_size: 16 * 1_048_576,
            max_array_size: 100_000,
            max_map_size: 100_000,
            output_cap: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Directory the search tools operate on (defaults to the working directory).
    pub root: Option<String>,
    pub pattern_search: bool,
    pub ranked_search: bool,
    pub documents: bool,
    pub max_hits: usize,
    pub default_limit: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            root: None,
            pattern_search: true,
            ranked_search: true,
            documents: true,
            max_hits: 200,
            default_limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub show_tree: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            show_tree: true,
        }
    }
}

impl Config {
    /// Load config following the lookup precedence, falling back to defaults.
    pub fn load(cli_path: Option<&str>) -> Result<Self, RlmError> {
        let env_path = std::env::var(paths::ENV_CONFIG_PATH).ok();
        let cwd = std::env::current_dir()?;
        match paths::resolve_config_path(cli_path, env_path.as_deref(), &cwd)? {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, RlmError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn budget_spec(&self) -> Result<BudgetSpec, RlmError> {
        BudgetSpec::try_from(&self.budget)
    }
}
