//! `storyforge-core`: shared building blocks for the generation engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the aggregate/optimistic
//! concurrency contracts the job state machine is written against.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
