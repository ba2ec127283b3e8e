//! # Execution Consumer
//!
//! ## Purpose
//!
//! Reads routed requests from `stream:execution-requests`, checks them at the
//! boundary, and runs them through an [`ExecutionStrategy`] on a bounded
//! worker pool. A request is acked only after its outcome is on
//! `stream:execution-results`, so a crash in between leaves it pending for
//! another consumer to claim.
//!
//! ## Integration Points
//!
//! - **Input**: `stream:execution-requests`, group `execution-group`, consumer
//!   name = instance id, new messages only
//! - **Output**: `stream:execution-results`
//! - **Failures**: malformed requests and failed executions go to the
//!   dead-letter queue; rule rejections are reported and acked
//!
//! ## Failure Taxonomy
//!
//! | Case | Handling |
//! |------|----------|
//! | Malformed request | dead-lettered as terminal, acked |
//! | Stale, unknown pair, zero amount | `rejected` result, acked |
//! | Transient strategy failure | retried with backoff, then dead-lettered |
//! | Terminal strategy failure | dead-lettered as terminal, `failed` result |
//! | Results stream unavailable | request left pending, reads paused until it answers |
//! | Broker down at startup | group join retried with backoff, counted as read failures |

pub mod consumer;
pub mod error;
pub mod replay;
pub mod rules;
pub mod stats;
pub mod strategy;
pub mod test_utils;

pub use consumer::{ConsumerSettings, ExecutionConsumer, RESULTS_CAPABILITY};
pub use error::ExecutionError;
pub use replay::ExecutionReplayHandler;
pub use rules::{validate, BusinessRules, Rejection};
pub use stats::{ExecutionStats, ExecutionStatsSnapshot};
pub use strategy::{DryRunStrategy, ExecutionOutcome, ExecutionStrategy, StrategyError};
