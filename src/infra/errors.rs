// src/infra/errors.rs — Error types for rlm

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RlmError {
    // Provider errors (retriable)
    #[error("Provider '{provider}' error: {message}")]
    Provider {
        provider: String,
        message: String,
        retriable: bool,
    },

    #[error("Rate limited by '{provider}', retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    // Fatal: surfaced immediately, never degraded
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sandbox failure: {0}")]
    Sandbox(String),

    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RlmError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RlmError::Provider {
                retriable: true,
                ..
            } | RlmError::RateLimited { .. }
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, RlmError::Configuration(_) | RlmError::Toml(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_provider() {
        let e = RlmError::Provider {
            provider: "openrouter".into(),
            message: "timeout".into(),
            retriable: true,
        };
        assert!(e.is_retriable());
        assert!(!e.is_configuration());
    }

    #[test]
    fn test_configuration_not_retriable() {
        let e = RlmError::Configuration("max_budget needs cost data".into());
        assert!(!e.is_retriable());
        assert!(e.is_configuration());
        assert_eq!(
            e.to_string(),
            "Configuration error: max_budget needs cost data"
        );
    }

    #[test]
    fn test_rate_limited_display() {
        let e = RlmError::RateLimited {
            provider: "openai".into(),
            retry_after_ms: 1500,
        };
        assert!(e.is_retriable());
        assert_eq!(e.to_string(), "Rate limited by 'openai', retry after 1500ms");
    }
}
