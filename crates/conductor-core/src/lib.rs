//! Core types and error definitions for the Conductor orchestrator.
//!
//! This crate provides the foundational types shared by the orchestration engine
//! and by every worker implementation: the error taxonomy and the result a worker
//! hands back after attempting a goal.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for dispatch, workflow, and config failures.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`ExecutionResult`]: Outcome of a single worker execution.

/// Error taxonomy.
pub mod error;
/// Worker execution results.
pub mod result;

pub use error::{ConductorError, ConductorResult};
pub use result::ExecutionResult;
