//! Message broker abstraction and the dispatch message.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pipeline::CompiledPipeline;
use crate::{Build, BuildId, Error, Event, RepoId, Result};

/// Default route every build lands on unless configured otherwise.
pub const DEFAULT_ROUTE: &str = "vela";

/// Trait for queue backends.
///
/// Implementations must be safe to share between concurrent publishers and
/// must not rely on ordering between unrelated messages.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Whether every server process sees the same queues (required for
    /// cluster mode).
    fn is_shared(&self) -> bool;

    /// Append a message to a route.
    async fn publish(&self, route: &str, payload: Bytes) -> Result<()>;

    /// Remove and return the oldest message of a route, if any.
    async fn pop(&self, route: &str) -> Result<Option<Bytes>>;

    /// Number of messages waiting on a route.
    async fn length(&self, route: &str) -> Result<u64>;
}

/// Message published for a worker to pick up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub build_id: BuildId,
    pub repo_id: RepoId,
    pub number: i64,
    pub event: Event,
    pub branch: String,
    pub route: String,
    pub pipeline: CompiledPipeline,
    /// Runtime environment, resolved secrets included.
    pub env: HashMap<String, String>,
}

impl DispatchMessage {
    pub fn new(build: &Build, pipeline: CompiledPipeline, env: HashMap<String, String>) -> Self {
        Self {
            build_id: build.id,
            repo_id: build.repo_id,
            number: build.number,
            event: build.event,
            branch: build.branch.clone(),
            route: build.route.clone(),
            pipeline,
            env,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Internal(format!("encode dispatch message: {}", e)))
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::InvalidArgument(format!("decode dispatch message: {}", e)))
    }
}
