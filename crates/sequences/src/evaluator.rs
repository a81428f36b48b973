use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::types::{Branch, BranchTrigger, Engagement, Enrollment};

/// Everything a trigger may look at when a step completes.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    pub enrollment: &'a Enrollment,
    pub engagement: Engagement,
    pub branch_delay_hours: u32,
    pub now: DateTime<Utc>,
}

/// Whether the action-click grace period has elapsed for the enrollment.
/// A deadline past the representable range never elapses.
pub fn action_delay_elapsed(enrollment: &Enrollment, delay_hours: u32, now: DateTime<Utc>) -> bool {
    enrollment
        .action_clicked_at
        .and_then(|clicked| clicked.checked_add_signed(Duration::hours(i64::from(delay_hours))))
        .is_some_and(|deadline| now >= deadline)
}

/// Decides whether an enrollment that just completed a step should be
/// rerouted, and onto which branch.
#[derive(Debug, Clone, Default)]
pub struct BranchTriggerEvaluator;

impl BranchTriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the first branch whose trigger matches. `branches` must
    /// already be in evaluation order. Enrollments that switched before never
    /// match again.
    pub fn evaluate<'b>(&self, branches: &'b [Branch], ctx: &TriggerContext<'_>) -> Option<&'b Branch> {
        if ctx.enrollment.has_switched() {
            return None;
        }
        let matched = branches.iter().find(|branch| self.matches(branch, ctx));
        if let Some(branch) = matched {
            debug!(
                enrollment_id = %ctx.enrollment.id,
                branch_id = %branch.id,
                trigger = branch.trigger.kind(),
                "Branch trigger matched"
            );
        }
        matched
    }

    pub fn matches(&self, branch: &Branch, ctx: &TriggerContext<'_>) -> bool {
        let enrollment = ctx.enrollment;
        match &branch.trigger {
            BranchTrigger::ActionClick { button_id } => {
                let Some(data) = &enrollment.trigger_data else {
                    return false;
                };
                let targets_branch = data.branch_id.as_deref() == Some(branch.id.as_str());
                let button_ok = match button_id {
                    Some(expected) => data.button_id.as_deref() == Some(expected.as_str()),
                    None => true,
                };
                targets_branch
                    && button_ok
                    && action_delay_elapsed(enrollment, ctx.branch_delay_hours, ctx.now)
            }
            BranchTrigger::Opened { min_opens } => match ctx.engagement {
                Engagement::Tracked(counts) => counts.opens >= *min_opens,
                Engagement::Untracked => false,
            },
            BranchTrigger::ClickedAny => match ctx.engagement {
                Engagement::Tracked(counts) => counts.clicks > 0,
                Engagement::Untracked => false,
            },
            BranchTrigger::NoEngagement { after_steps } => {
                if enrollment.current_step < *after_steps {
                    return false;
                }
                match ctx.engagement {
                    Engagement::Untracked => true,
                    Engagement::Tracked(counts) => counts.opens == 0,
                }
            }
        }
    }
}
