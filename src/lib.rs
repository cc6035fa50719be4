pub mod batch;
pub mod branch;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
mod lenient;
pub mod llm;
pub mod output;
pub mod policy;
pub mod runner;
pub mod steps;

pub use config::{ChainConfig, Config, LlmConfig, Provider};
pub use context::{AuditEntry, Decision, SeedContext, StepResult};
pub use definition::{Branching, ChainDefinition, ChainEntry, StepSpec};
pub use error::{ChainError, ConfigError, LlmError};
pub use llm::{backend_from_config, LlmBackend, LlmCall, MockLlm};
pub use runner::{ChainResult, ChainRunner, ChainStatus, ChainSummary};
pub use steps::StepKind;
