//! Compiled pipeline definitions.
//!
//! The orchestrator treats a compiled pipeline as opaque apart from its
//! route hint and its declared secret references.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Result;
use crate::secret::SecretRef;

/// A pipeline after compilation, ready to be dispatched to a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledPipeline {
    /// Pipeline name.
    pub name: String,
    /// Requested worker route, if the pipeline asks for one.
    pub route: Option<String>,
    /// Secrets the pipeline needs at runtime.
    pub secrets: Vec<SecretRef>,
    /// Global environment variables (may contain `${...}` variables).
    pub env: HashMap<String, String>,
    /// Steps executed by the worker, in order.
    pub steps: Vec<Step>,
}

/// A single step of a compiled pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Turns a raw pipeline definition into a compiled pipeline.
pub trait Compiler: Send + Sync {
    /// Get the compiler name.
    fn name(&self) -> &'static str;

    /// Compile a raw pipeline definition.
    fn compile(&self, raw: &str) -> Result<CompiledPipeline>;
}
