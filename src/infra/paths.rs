// src/infra/paths.rs — Config file discovery
//
// Precedence: explicit --config flag, then $RLM_CONFIG, then the first
// existing default location (./rlm.toml, ./.rlm.toml, <config dir>/rlm/config.toml).

use std::path::{Path, PathBuf};

use crate::infra::errors::RlmError;

pub const ENV_CONFIG_PATH: &str = "RLM_CONFIG";

/// Per-user config directory (XDG on Linux, Application Support on macOS).
pub fn user_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("rlm"))
}

/// Default config locations, in lookup order.
pub fn default_config_paths(cwd: &Path) -> Vec<PathBuf> {
    let mut paths = vec![cwd.join("rlm.toml"), cwd.join(".rlm.toml")];
    if let Some(dir) = user_config_dir() {
        paths.push(dir.join("config.toml"));
    }
    paths
}

/// Resolve which config file to load, if any.
///
/// An explicitly named file (flag or env) that does not exist is an error;
/// missing default files simply mean "use defaults".
pub fn resolve_config_path(
    cli_path: Option<&str>,
    env_path: Option<&str>,
    cwd: &Path,
) -> Result<Option<PathBuf>, RlmError> {
    if let Some(p) = cli_path {
        let candidate = PathBuf::from(p);
        if !candidate.exists() {
            return Err(RlmError::Configuration(format!(
                "config file '{p}' given with --config does not exist"
            )));
        }
        return Ok(Some(candidate));
    }

    if let Some(p) = env_path.filter(|p| !p.is_empty()) {
        let candidate = PathBuf::from(p);
        if !candidate.exists() {
            return Err(RlmError::Configuration(format!(
                "${ENV_CONFIG_PATH} points to '{p}', which does not exist"
            )));
        }
        return Ok(Some(candidate));
    }

    Ok(default_config_paths(cwd).into_iter().find(|p| p.exists()))
}
