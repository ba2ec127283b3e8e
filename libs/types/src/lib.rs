//! # Routing Message Model
//!
//! Shared types for every stage of the opportunity pipeline:
//!
//! ```text
//! producers → stream:opportunities → coordinator → stream:execution-requests → execution consumer
//!                                        │                                          │
//!                                        └──────────── stream:dead-letter ◄─────────┘
//! ```
//!
//! ## Design Rules
//!
//! - **Absolute amounts**: `amount_in` and `expected_profit` are integers in the
//!   token's smallest unit. Percentages travel in their own field and are never
//!   substituted for the absolute profit.
//! - **Allow-listed wire schema**: messages are written and read through explicit
//!   field lists ([`Opportunity::FIELDS`]); unknown producer fields are dropped at
//!   decode and nothing reflective reaches the wire.
//! - **Tagged validation**: decoding yields [`Validation`] (valid value or reason),
//!   never an error used for ordinary branching.
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{Opportunity, Validation};
//!
//! let opportunity = Opportunity::builder("opp-1", "WETH/USDC")
//!     .amount_in(1_000_000)
//!     .expected_profit(2_500)
//!     .profit_percentage(0.25)
//!     .gas_estimate(180_000)
//!     .created_at_ms(1_700_000_000_000)
//!     .build();
//!
//! let fields = opportunity.to_fields();
//! match Opportunity::validate_fields(&fields) {
//!     Validation::Valid(decoded) => assert_eq!(decoded, opportunity),
//!     Validation::Invalid { reason, .. } => panic!("{reason}"),
//! }
//! ```

pub mod common;
pub mod dead_letter;
pub mod execution;
pub mod fields;
pub mod opportunity;
pub mod streams;
pub mod validation;

pub use common::errors::FieldError;
pub use common::identifiers::{InstanceId, OpportunityId, SequenceId, Term};
pub use common::time::current_time_ms;
pub use dead_letter::{DeadLetterEntry, DeadLetterPriority};
pub use execution::{ExecutionReport, ExecutionRequest, ExecutionStatus};
pub use fields::FieldMap;
pub use opportunity::{Opportunity, OpportunityBuilder};
pub use streams::StreamMessage;
pub use validation::Validation;
