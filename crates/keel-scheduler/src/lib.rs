//! Build dispatch for Keel.
//!
//! Turns a trigger into a numbered, persisted build and a dispatch message
//! on a worker route. Holds the number allocator, the queue router and its
//! brokers, the secret gateway and its vaults, and the lifecycle
//! orchestrator that ties them to the build store.

pub mod allocator;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod router;
pub mod secrets;
pub mod vault;

pub use allocator::NumberAllocator;
pub use orchestrator::BuildOrchestrator;
pub use queue::{MemoryBroker, SqlBroker};
pub use router::QueueRouter;
pub use secrets::SecretGateway;
pub use vault::{HttpVault, MemoryVault};
