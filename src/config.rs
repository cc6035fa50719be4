use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Chain budget defaults
    pub chain: ChainConfig,

    /// Directory chain results are written to
    pub output_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            chain: ChainConfig::default(),
            output_dir: "analyses".to_string(),
        }
    }
}

/// Which backend answers LLM-backed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mock,
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Azure,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(Provider::Mock),
            "openai" => Ok(Provider::OpenAi),
            "azure" => Ok(Provider::Azure),
            other => Err(ConfigError::InvalidValue {
                key: "provider".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub cost_per_1k_tokens: f64,
    pub allow_mock: bool,
    pub azure_endpoint: String,
    pub azure_deployment: String,
    pub azure_api_version: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            api_key: String::new(),
            model: "gpt-4.1-mini".to_string(),
            timeout_seconds: 60,
            cost_per_1k_tokens: 0.001,
            allow_mock: true,
            azure_endpoint: String::new(),
            azure_deployment: String::new(),
            azure_api_version: "2024-06-01".to_string(),
        }
    }
}

/// Default limits for a chain run; definitions may override them per chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub max_depth: u32,
    pub max_branches: u32,
    pub timeout_sec: f64,
    pub budget_usd: f64,
    pub min_confidence_delta: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_branches: 2,
            timeout_sec: 45.0,
            budget_usd: 0.5,
            min_confidence_delta: 0.08,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(provider = ?config.llm.provider, model = %config.llm.model, "configuration loaded");
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AI_PROVIDER") {
            self.llm.provider = v.parse()?;
        }
        if let Some(v) = get("AI_API_KEY") {
            self.llm.api_key = v.trim().to_string();
        }
        if let Some(v) = get("FOLLOWUP_MODEL").or_else(|| get("AI_MODEL")) {
            self.llm.model = v.trim().to_string();
        }
        if let Some(v) = get("AI_TIMEOUT_SECONDS") {
            self.llm.timeout_seconds = parse_value("AI_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("CHAIN_COST_PER_1K_TOKENS") {
            self.llm.cost_per_1k_tokens = parse_value("CHAIN_COST_PER_1K_TOKENS", &v)?;
        }
        if let Some(v) = get("ALLOW_MOCK") {
            self.llm.allow_mock = parse_bool("ALLOW_MOCK", &v)?;
        }
        if let Some(v) = get("AZURE_OPENAI_ENDPOINT") {
            self.llm.azure_endpoint = v.trim().to_string();
        }
        if let Some(v) = get("AZURE_OPENAI_DEPLOYMENT") {
            self.llm.azure_deployment = v.trim().to_string();
        }
        if let Some(v) = get("AZURE_OPENAI_API_VERSION") {
            self.llm.azure_api_version = v.trim().to_string();
        }
        if let Some(v) = get("CHAIN_MAX_DEPTH") {
            self.chain.max_depth = parse_value("CHAIN_MAX_DEPTH", &v)?;
        }
        if let Some(v) = get("CHAIN_MAX_BRANCHES") {
            self.chain.max_branches = parse_value("CHAIN_MAX_BRANCHES", &v)?;
        }
        if let Some(v) = get("CHAIN_TIMEOUT_SEC") {
            self.chain.timeout_sec = parse_value("CHAIN_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = get("CHAIN_BUDGET_USD") {
            self.chain.budget_usd = parse_value("CHAIN_BUDGET_USD", &v)?;
        }
        if let Some(v) = get("CHAIN_MIN_CONFIDENCE_DELTA") {
            self.chain.min_confidence_delta = parse_value("CHAIN_MIN_CONFIDENCE_DELTA", &v)?;
        }
        if let Some(v) = get("OUTPUT_DIR") {
            self.output_dir = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.llm.validate()
    }
}

impl LlmConfig {
    /// Check that the selected provider has what it needs to make calls
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.provider {
            Provider::Mock if !self.allow_mock => Err(ConfigError::MockDisabled),
            Provider::Mock => Ok(()),
            Provider::OpenAi => {
                if self.api_key.trim().is_empty() {
                    return Err(ConfigError::MissingField {
                        provider: "openai",
                        field: "api key",
                    });
                }
                Ok(())
            }
            Provider::Azure => {
                let required = [
                    ("endpoint", &self.azure_endpoint),
                    ("deployment", &self.azure_deployment),
                    ("api key", &self.api_key),
                ];
                for (field, value) in required {
                    if value.trim().is_empty() {
                        return Err(ConfigError::MissingField {
                            provider: "azure",
                            field,
                        });
                    }
                }
                Ok(())
            }
        }
    }
}
