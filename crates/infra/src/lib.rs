//! Infrastructure layer: job storage, the step executor, the cover pipeline,
//! asset storage, configuration and the sweep scheduler.

pub mod assets;
pub mod config;
pub mod cover;
pub mod jobs;
pub mod runner;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

mod integration_tests;

pub use assets::{AssetError, AssetStore, FsAssetStore, InMemoryAssetStore};
pub use config::{ConfigError, EngineConfig};
pub use runner::{SweepRunner, SweepRunnerHandle};
