//! # sweep-core
//!
//! Core types, traits, and abstractions for the sweep cleanup orchestrator.
//!
//! This crate provides the lock and job-run data structures, the error
//! taxonomy, and the repository traits that the database layer implements
//! and the job layer consumes.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
