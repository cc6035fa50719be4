//! Error types for chain execution.
//!
//! Configuration problems and transport failures are hard errors that abort the
//! current chain invocation. Unparseable model output is not represented here at
//! all: it degrades to an empty payload inside the LLM layer.

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{provider} provider requires {field}")]
    MissingField {
        provider: &'static str,
        field: &'static str,
    },
    #[error("mock provider is disabled by configuration")]
    MockDisabled,
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors from the LLM call boundary.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected LLM response: {0}")]
    UnexpectedResponse(String),
}

/// Top-level error for a chain invocation.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("invalid params for step '{step}': {message}")]
    InvalidParams { step: String, message: String },
    #[error("invalid chain definition: {0}")]
    Definition(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
