//! # Coordinator
//!
//! ## Purpose
//!
//! Routes arbitrage opportunities from detectors to the execution consumers.
//! Every instance validates and deduplicates what it reads from
//! `stream:opportunities`; exactly one elected leader forwards the survivors
//! to `stream:execution-requests`.
//!
//! ## Integration Points
//!
//! - **Input**: `stream:opportunities` (consumer group `coordinator-group`)
//! - **Hand-off**: `stream:coordinator-handoff`, read by the leader only
//! - **Output**: `stream:execution-requests`
//! - **Failures**: the dead-letter queue, mirrored to `stream:dead-letter`
//! - **Health**: `/health` carries the `execution-forwarding` capability
//!
//! ## Architecture Role
//!
//! ```text
//! Detectors → [Coordinator × N] → hand-off → [Leader] → Execution consumers
//!                    ↑                           ↑
//!              dedup window                lease + breaker
//! ```
//!
//! Followers keep their forwarding dedup cache warm by reading the execution
//! stream, so a newly promoted leader does not re-forward recent requests.

pub mod dedup;
pub mod error;
pub mod leader;
pub mod replay;
pub mod service;
pub mod stages;
pub mod stats;

pub use dedup::{DedupCache, DedupOutcome};
pub use error::CoordinatorError;
pub use leader::{LeaderConfig, LeaderElector, LeadershipState};
pub use replay::ForwardReplayHandler;
pub use service::{Coordinator, CoordinatorStatus, FORWARDING_CAPABILITY};
pub use stages::{ForwardStage, IntakeStage, StageContext, WarmupStage};
pub use stats::{CoordinatorStats, CoordinatorStatsSnapshot};
