//! Repository traits and implementations.

pub mod build;

pub use build::{BuildRecord, BuildStore, SqlBuildStore, StatusChange};
