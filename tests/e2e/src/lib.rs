//! End-to-End Test Framework for Oppflow
//!
//! Runs several coordinators and execution consumers against one shared
//! broker and lease store, the way a deployment runs them against one
//! stream server, and checks the pipeline-wide guarantees: each
//! opportunity executes at most once, a single instance forwards at a
//! time, and a lost leader is replaced within one lease lifetime plus one
//! renewal round.

pub mod fixtures;
pub mod framework;
pub mod partition;
pub mod validation;

pub use fixtures::OpportunityFixture;
pub use framework::{ServiceKind, TestCluster};
pub use partition::PartitionableLeaseStore;
pub use validation::PipelineValidator;
