//! Core domain types and state rules for Drover CI.
//!
//! This crate contains:
//! - Resource identifiers
//! - The shared build/job state enum and matrix aggregation
//! - Repository, permission, build and job records
//! - Worker event payloads and their normalization
//! - The dispatch message handed to workers

pub mod build;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod id;
pub mod repository;
pub mod state;

pub use error::{Error, Result};
pub use id::ResourceId;
pub use state::State;
