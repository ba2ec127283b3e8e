//! Stream and consumer-group names shared by every service, plus the
//! envelope a broker hands back on read.

use crate::{FieldMap, SequenceId};
use serde::{Deserialize, Serialize};

pub const OPPORTUNITIES: &str = "stream:opportunities";
pub const EXECUTION_REQUESTS: &str = "stream:execution-requests";
pub const DEAD_LETTER: &str = "stream:dead-letter";
pub const EXECUTION_RESULTS: &str = "stream:execution-results";
/// Intake → leader hand-off; read only by the current leader
pub const COORDINATOR_HANDOFF: &str = "stream:coordinator-handoff";

/// Shared by all coordinator intake stages (competing consumers)
pub const COORDINATOR_GROUP: &str = "coordinator-group";
/// Hand-off readers; only the leader ever joins
pub const COORDINATOR_FORWARDERS: &str = "coordinator-forwarders";
pub const EXECUTION_GROUP: &str = "execution-group";

/// Per-instance warm-up group over `stream:execution-requests`
pub fn warmup_group(instance: &str) -> String {
    format!("coordinator-warmup:{}", instance)
}

/// Per-instance group over `stream:dead-letter`; what stays pending in it is
/// the instance's unresolved dead letters
pub fn dead_letter_group(instance: &str) -> String {
    format!("dead-letter:{}", instance)
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream: String,
    pub id: SequenceId,
    pub fields: FieldMap,
    pub published_at_ms: u64,
    /// Times this entry has been handed to a consumer of the reading group
    pub delivery_count: u32,
}
