//! KDL configuration parsing for Keel.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (the KDL compiler)
//! - Server configuration
//! - Variable interpolation for the build runtime environment

pub mod error;
mod nodes;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::KdlCompiler;
pub use system::{
    AllocatorConfig, DatabaseConfig, LogFormat, QueueConfig, QueueDriver, RouteFallback,
    SecretsConfig, SecretsDriver, ServerConfig, ServerSection,
};
pub use variables::{BuildContext, VariableContext, VariableContextBuilder};
