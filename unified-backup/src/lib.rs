//! Unified Backup Library
//!
//! Orchestrates restic repositories: idempotent initialization, retried
//! engine calls, latest-snapshot restores, retention pruning, and an
//! aggregated status report with partial-failure semantics.

pub mod config;
pub mod context;
pub mod engine;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod repository;
pub mod retry;
pub mod shutdown;
pub mod snapshot;
pub mod status;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use context::{RunContext, RunOptions};
pub use engine::Engine;
pub use orchestrator::{Operation, Task};
pub use repository::{Repository, RepositoryManager, RetentionWindow};
pub use status::{RunClassification, StatusBoard, StatusReport, TaskState};
pub use utils::{OrchestratorError, Result};
