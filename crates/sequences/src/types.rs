use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_core::{DripError, DripResult};

/// Key of the branch an enrollment falls back to when it runs off the end of
/// its path without having switched.
pub const DEFAULT_BRANCH_ID: &str = "default";

/// Free-form merge fields attached to an enrollment.
pub type RecipientData = HashMap<String, serde_json::Value>;

/// A drip sequence definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    /// Grace period between an action click and the branch switch it causes.
    pub branch_delay_hours: u32,
    #[serde(default)]
    pub tracking: TrackingOptions,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            branch_delay_hours: 0,
            tracking: TrackingOptions::default(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingOptions {
    pub open_tracking: bool,
    pub click_tracking: bool,
}

impl TrackingOptions {
    pub fn any(&self) -> bool {
        self.open_tracking || self.click_tracking
    }
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            open_tracking: true,
            click_tracking: true,
        }
    }
}

/// When a step goes out relative to the moment it is scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDelay {
    pub days: u32,
    pub hours: u32,
    /// Fixed UTC wall-clock time the send snaps to.
    pub send_time: Option<NaiveTime>,
}

impl StepDelay {
    pub fn days(days: u32) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    pub fn hours(hours: u32) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> DripResult<()> {
        if self.days > MAX_DELAY_DAYS || self.hours > MAX_DELAY_DAYS * 24 {
            return Err(DripError::InvalidDefinition(format!(
                "step delay of {}d {}h exceeds {MAX_DELAY_DAYS} days",
                self.days, self.hours
            )));
        }
        Ok(())
    }
}

/// Upper bound on each component of a step delay.
pub const MAX_DELAY_DAYS: u32 = 3650;

/// One block from the visual editor. Opaque to the engine; only the
/// template compiler interprets `kind` and `props`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub kind: String,
    #[serde(default)]
    pub props: serde_json::Value,
}

impl ContentBlock {
    pub fn new(kind: impl Into<String>, props: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            props,
        }
    }
}

/// Where a step's body comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum StepContent {
    Inline { blocks: Vec<ContentBlock> },
    Template { template_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: Uuid,
    pub sequence_id: Uuid,
    /// None while on the main path.
    pub branch_id: Option<String>,
    pub step_order: u32,
    pub delay: StepDelay,
    pub subject: String,
    pub content: StepContent,
}

impl SequenceStep {
    pub fn new(
        sequence_id: Uuid,
        branch_id: Option<&str>,
        step_order: u32,
        subject: impl Into<String>,
        content: StepContent,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id,
            branch_id: branch_id.map(str::to_string),
            step_order,
            delay: StepDelay::default(),
            subject: subject.into(),
            content,
        }
    }

    pub fn with_delay(mut self, delay: StepDelay) -> Self {
        self.delay = delay;
        self
    }
}

/// Reusable email template referenced by steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub blocks: Vec<ContentBlock>,
}

/// Condition that reroutes an enrollment onto a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BranchTrigger {
    /// The recipient clicked an action button targeting this branch.
    ActionClick {
        #[serde(default)]
        button_id: Option<String>,
    },
    Opened {
        #[serde(default = "default_min_opens")]
        min_opens: u32,
    },
    ClickedAny,
    NoEngagement { after_steps: u32 },
}

fn default_min_opens() -> u32 {
    1
}

impl BranchTrigger {
    pub fn validate(&self) -> DripResult<()> {
        match self {
            BranchTrigger::Opened { min_opens: 0 } => Err(DripError::InvalidDefinition(
                "opened trigger needs min_opens >= 1".to_string(),
            )),
            BranchTrigger::NoEngagement { after_steps: 0 } => Err(DripError::InvalidDefinition(
                "no_engagement trigger needs after_steps >= 1".to_string(),
            )),
            BranchTrigger::ActionClick {
                button_id: Some(button),
            } if button.trim().is_empty() => Err(DripError::InvalidDefinition(
                "action_click button_id must not be blank".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BranchTrigger::ActionClick { .. } => "action_click",
            BranchTrigger::Opened { .. } => "opened",
            BranchTrigger::ClickedAny => "clicked_any",
            BranchTrigger::NoEngagement { .. } => "no_engagement",
        }
    }

    /// Whether matching needs open/click counters from the tracking service.
    pub fn needs_engagement(&self) -> bool {
        !matches!(self, BranchTrigger::ActionClick { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Unique within its sequence.
    pub id: String,
    pub sequence_id: Uuid,
    pub name: String,
    pub color: String,
    pub parent_branch_id: Option<String>,
    /// The step whose completion evaluates this branch's trigger.
    pub trigger_step_id: Option<Uuid>,
    pub trigger: BranchTrigger,
    /// Lower values are evaluated first; ties fall back to creation order.
    #[serde(default)]
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        sequence_id: Uuid,
        id: impl Into<String>,
        trigger_step_id: Option<Uuid>,
        trigger: BranchTrigger,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            sequence_id,
            color: "#6366f1".to_string(),
            parent_branch_id: None,
            trigger_step_id,
            trigger,
            priority: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Cancelled => "cancelled",
            EnrollmentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action click pointed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerData {
    pub branch_id: Option<String>,
    pub button_id: Option<String>,
}

/// One recipient's progress through a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub recipient_email: String,
    pub current_step: u32,
    pub branch_id: Option<String>,
    pub status: EnrollmentStatus,
    /// None once the enrollment is terminal.
    pub next_send_at: Option<DateTime<Utc>>,
    pub action_clicked_at: Option<DateTime<Utc>>,
    pub branch_switched_at: Option<DateTime<Utc>>,
    pub trigger_data: Option<TriggerData>,
    #[serde(default)]
    pub recipient_data: RecipientData,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Lease held by the worker currently processing this row.
    pub claimed_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn has_switched(&self) -> bool {
        self.branch_switched_at.is_some()
    }

    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Open/click counters for one tracking token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounts {
    pub opens: u32,
    pub clicks: u32,
}

/// Engagement as seen by the trigger evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engagement {
    /// No tracking token was ever issued for the recipient.
    Untracked,
    Tracked(EngagementCounts),
}
