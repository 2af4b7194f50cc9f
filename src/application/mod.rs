//! Application layer: Use cases and services.
//!
//! This module orchestrates domain logic with ports to implement
//! the core use cases of the application.

mod compute;
mod health;
mod key_authority;
mod orchestrator;

pub use compute::ComputeWorker;
pub use health::{HealthService, SleepScore, WeightSummary};
pub use key_authority::{DecryptedValue, KeyAuthority, KeyFingerprints};
pub use orchestrator::{LedgerEntry, PolledStatus, TaskError, TaskOrchestrator};
