use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle event emitted by the sequence engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEvent {
    pub event_id: Uuid,
    pub event_type: SequenceEventType,
    pub enrollment_id: Uuid,
    pub sequence_id: Uuid,
    pub recipient: String,
    pub step_order: Option<u32>,
    pub branch_id: Option<String>,
    pub account_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SequenceEventType {
    Enrolled,
    StepSent,
    SendFailed,
    BranchSwitched,
    ActionClicked,
    Completed,
    Paused,
    Resumed,
    Cancelled,
}
