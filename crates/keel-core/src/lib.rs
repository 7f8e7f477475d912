//! Core domain types and traits for the Keel build dispatcher.
//!
//! This crate contains:
//! - Build records, events and the lifecycle state machine
//! - Compiled pipeline types and the compiler trait
//! - Secret references and the vault trait
//! - The message broker trait used by the queue router

pub mod build;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod queue;
pub mod secret;

pub use build::{Build, BuildStatus, Event, NewBuild, Pagination};
pub use error::{Error, Result};
pub use id::{BuildId, RepoId};
