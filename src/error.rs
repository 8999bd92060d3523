//! Error types for the agent process

use thiserror::Error;

/// Fatal startup errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("Bus error: {0:#}")]
    Bus(anyhow::Error),

    #[error("Signal handler error: {0}")]
    Signal(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Config(anyhow::anyhow!("missing file").context("loading config"));
        assert_eq!(
            err.to_string(),
            "Configuration error: loading config: missing file"
        );

        let err = AgentError::Signal("handler already set".to_string());
        assert_eq!(err.to_string(), "Signal handler error: handler already set");
    }
}
