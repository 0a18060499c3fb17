//! The generation job engine.
//!
//! ## Components
//!
//! - `JobStore`: durable job records with compare-and-swap updates
//! - `StepExecutor`: one unit of work per tick, behind a short lease
//! - `FinalizationGate`: completes a job only on top of a ready cover
//! - `Watchdog`: resumes stale jobs and fails the ones that stay stuck

pub mod executor;
pub mod finalize;
pub mod postgres;
pub mod store;
pub mod watchdog;

pub use executor::{EngineError, JobView, StepExecutor, TickOutcome, TickReport};
pub use finalize::{FinalizationGate, cover_brief};
pub use postgres::PostgresJobStore;
pub use store::{AttemptFilter, InMemoryJobStore, JobStore, JobStoreError, StaleQuery};
pub use watchdog::{ABANDONED_MESSAGE, CleanupReport, EXHAUSTED_MESSAGE, Watchdog, WatchdogReport};
