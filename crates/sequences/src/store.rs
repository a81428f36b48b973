//! Enrollment store: data access over sequences, steps, branches,
//! templates and enrollments.
//!
//! Definitions are owned by external editors; the engine only reads them.
//! Enrollment writes are conditional so that overlapping workers can share
//! one store: the due query claims rows, and markers that may be set only
//! once are guarded by the store rather than by the caller.
//!
//! Every write a worker makes after `claim_due` carries the lease it was
//! granted. If the lease expired and was re-granted, or the row was reset by a
//! re-enroll, the write fails with `ClaimLost` and leaves the row alone.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use drip_core::{DripError, DripResult};

use crate::types::{
    Branch, Enrollment, EnrollmentStatus, RecipientData, Sequence, SequenceStep, Template,
    TriggerData,
};

/// Where a branch switch lands when the target branch has steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchPlacement {
    pub step_order: u32,
    pub next_send_at: DateTime<Utc>,
}

pub trait EnrollmentStore: Send + Sync {
    // ─── Definitions ───────────────────────────────────────────────────────

    fn put_sequence(&self, sequence: Sequence);

    fn set_sequence_enabled(&self, sequence_id: Uuid, enabled: bool) -> DripResult<()>;

    /// Rejects a step whose order already exists on the same path.
    fn put_step(&self, step: SequenceStep) -> DripResult<()>;

    /// Rejects invalid trigger configuration.
    fn put_branch(&self, branch: Branch) -> DripResult<()>;

    fn put_template(&self, template: Template);

    fn get_sequence(&self, sequence_id: Uuid) -> Option<Sequence>;

    fn get_template(&self, template_id: Uuid) -> Option<Template>;

    /// The step at `step_order` on the given path (None = main path).
    fn get_step(&self, sequence_id: Uuid, branch_id: Option<&str>, step_order: u32)
        -> Option<SequenceStep>;

    /// The lowest-order step on the path.
    fn first_step(&self, sequence_id: Uuid, branch_id: Option<&str>) -> Option<SequenceStep>;

    /// The lowest-order step strictly after `after_order` on the path.
    fn next_step(
        &self,
        sequence_id: Uuid,
        branch_id: Option<&str>,
        after_order: u32,
    ) -> Option<SequenceStep>;

    fn get_branch(&self, sequence_id: Uuid, branch_id: &str) -> Option<Branch>;

    /// Returns whether the branch existed. Its steps stay in place.
    fn remove_branch(&self, sequence_id: Uuid, branch_id: &str) -> bool;

    /// Branches triggered by completing `step_id`, in evaluation order:
    /// priority, then creation time, then id.
    fn branches_for_step(&self, sequence_id: Uuid, step_id: Uuid) -> Vec<Branch>;

    // ─── Enrollments ───────────────────────────────────────────────────────

    /// Inserts the (sequence, email) enrollment or resets the existing row to
    /// active at `step_order` with every progress marker cleared.
    fn upsert_enrollment(
        &self,
        sequence_id: Uuid,
        email: &str,
        data: RecipientData,
        step_order: u32,
        next_send_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment>;

    fn get_enrollment(&self, enrollment_id: Uuid) -> Option<Enrollment>;

    fn find_enrollment(&self, sequence_id: Uuid, email: &str) -> Option<Enrollment>;

    /// Sets `to` only if the row is still in `expected`.
    fn update_status(
        &self,
        enrollment_id: Uuid,
        expected: EnrollmentStatus,
        to: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment>;

    /// Atomically claims every active, due, unclaimed enrollment of an
    /// enabled sequence, leasing it until `lease_until`, and returns exactly
    /// the claimed rows.
    fn claim_due(&self, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> DripResult<Vec<Enrollment>>;

    /// Drops the claim if `lease` still holds it; otherwise a no-op.
    fn release_claim(&self, enrollment_id: Uuid, lease: DateTime<Utc>) -> DripResult<()>;

    /// Moves the enrollment to `step_order` on its current path and releases the claim.
    fn save_progress(
        &self,
        enrollment_id: Uuid,
        step_order: u32,
        next_send_at: DateTime<Utc>,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<()>;

    fn record_sent(
        &self,
        enrollment_id: Uuid,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<()>;

    /// Completes an active enrollment, clears its schedule and releases the
    /// claim. Returns false when the row left `active` in the meantime.
    fn mark_completed(
        &self,
        enrollment_id: Uuid,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<bool>;

    /// Sets `branch_switched_at` and, with a placement, moves the enrollment
    /// onto the branch. The claim is kept. Returns false if the enrollment had
    /// already switched.
    fn switch_branch(
        &self,
        enrollment_id: Uuid,
        branch_id: &str,
        placement: Option<BranchPlacement>,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<bool>;

    /// Records the first action click. Returns false if one was already recorded.
    fn record_action_click(
        &self,
        enrollment_id: Uuid,
        trigger: TriggerData,
        now: DateTime<Utc>,
    ) -> DripResult<bool>;
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Thread-safe in-memory store backed by DashMap.
///
/// Per-row conditional updates run under the row's shard lock, which gives
/// the same guarantees as single-statement conditional updates in SQL.
#[derive(Default)]
pub struct InMemorySequenceStore {
    sequences: DashMap<Uuid, Sequence>,
    steps: DashMap<Uuid, SequenceStep>,
    branches: DashMap<(Uuid, String), Branch>,
    templates: DashMap<Uuid, Template>,
    enrollments: DashMap<Uuid, Enrollment>,
    enrollment_index: DashMap<(Uuid, String), Uuid>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        info!("Sequence store initialized (in-memory)");
        Self::default()
    }

    pub fn list_enrollments(&self, sequence_id: Uuid) -> Vec<Enrollment> {
        let mut rows: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().sequence_id == sequence_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at));
        rows
    }

    fn path_steps(&self, sequence_id: Uuid, branch_id: Option<&str>) -> Vec<SequenceStep> {
        let mut steps: Vec<SequenceStep> = self
            .steps
            .iter()
            .filter(|r| {
                let s = r.value();
                s.sequence_id == sequence_id && s.branch_id.as_deref() == branch_id
            })
            .map(|r| r.value().clone())
            .collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }

    fn sequence_enabled(&self, sequence_id: Uuid) -> bool {
        self.sequences
            .get(&sequence_id)
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    fn update_enrollment<F, T>(&self, enrollment_id: Uuid, f: F) -> DripResult<T>
    where
        F: FnOnce(&mut Enrollment) -> DripResult<T>,
    {
        let mut entry = self
            .enrollments
            .get_mut(&enrollment_id)
            .ok_or_else(|| DripError::not_found("Enrollment", enrollment_id))?;
        f(entry.value_mut())
    }

    /// Like `update_enrollment`, but only while `lease` still holds the row.
    fn update_claimed<F, T>(&self, enrollment_id: Uuid, lease: DateTime<Utc>, f: F) -> DripResult<T>
    where
        F: FnOnce(&mut Enrollment) -> DripResult<T>,
    {
        self.update_enrollment(enrollment_id, |e| {
            if e.claimed_until != Some(lease) {
                debug!(enrollment_id = %enrollment_id, "Claim lost, write skipped");
                return Err(DripError::ClaimLost { enrollment_id });
            }
            f(e)
        })
    }
}

impl EnrollmentStore for InMemorySequenceStore {
    fn put_sequence(&self, sequence: Sequence) {
        info!(sequence_id = %sequence.id, name = %sequence.name, "Storing sequence");
        self.sequences.insert(sequence.id, sequence);
    }

    fn set_sequence_enabled(&self, sequence_id: Uuid, enabled: bool) -> DripResult<()> {
        let mut entry = self
            .sequences
            .get_mut(&sequence_id)
            .ok_or_else(|| DripError::not_found("Sequence", sequence_id))?;
        entry.enabled = enabled;
        info!(sequence_id = %sequence_id, enabled, "Sequence toggled");
        Ok(())
    }

    fn put_step(&self, step: SequenceStep) -> DripResult<()> {
        step.delay.validate()?;
        if !self.sequences.contains_key(&step.sequence_id) {
            return Err(DripError::not_found("Sequence", step.sequence_id));
        }
        let clash = self.steps.iter().any(|r| {
            let s = r.value();
            s.id != step.id
                && s.sequence_id == step.sequence_id
                && s.branch_id == step.branch_id
                && s.step_order == step.step_order
        });
        if clash {
            return Err(DripError::InvalidDefinition(format!(
                "step_order {} already used on path {}",
                step.step_order,
                step.branch_id.as_deref().unwrap_or("main")
            )));
        }
        debug!(
            step_id = %step.id,
            branch = step.branch_id.as_deref().unwrap_or("main"),
            step_order = step.step_order,
            "Storing step"
        );
        self.steps.insert(step.id, step);
        Ok(())
    }

    fn put_branch(&self, branch: Branch) -> DripResult<()> {
        branch.trigger.validate()?;
        if branch.id.trim().is_empty() {
            return Err(DripError::InvalidDefinition("branch id must not be blank".to_string()));
        }
        if !self.sequences.contains_key(&branch.sequence_id) {
            return Err(DripError::not_found("Sequence", branch.sequence_id));
        }
        debug!(branch_id = %branch.id, trigger = branch.trigger.kind(), "Storing branch");
        self.branches
            .insert((branch.sequence_id, branch.id.clone()), branch);
        Ok(())
    }

    fn put_template(&self, template: Template) {
        self.templates.insert(template.id, template);
    }

    fn get_sequence(&self, sequence_id: Uuid) -> Option<Sequence> {
        self.sequences.get(&sequence_id).map(|r| r.value().clone())
    }

    fn get_template(&self, template_id: Uuid) -> Option<Template> {
        self.templates.get(&template_id).map(|r| r.value().clone())
    }

    fn get_step(
        &self,
        sequence_id: Uuid,
        branch_id: Option<&str>,
        step_order: u32,
    ) -> Option<SequenceStep> {
        self.steps
            .iter()
            .find(|r| {
                let s = r.value();
                s.sequence_id == sequence_id
                    && s.branch_id.as_deref() == branch_id
                    && s.step_order == step_order
            })
            .map(|r| r.value().clone())
    }

    fn first_step(&self, sequence_id: Uuid, branch_id: Option<&str>) -> Option<SequenceStep> {
        self.path_steps(sequence_id, branch_id).into_iter().next()
    }

    fn next_step(
        &self,
        sequence_id: Uuid,
        branch_id: Option<&str>,
        after_order: u32,
    ) -> Option<SequenceStep> {
        self.path_steps(sequence_id, branch_id)
            .into_iter()
            .find(|s| s.step_order > after_order)
    }

    fn get_branch(&self, sequence_id: Uuid, branch_id: &str) -> Option<Branch> {
        self.branches
            .get(&(sequence_id, branch_id.to_string()))
            .map(|r| r.value().clone())
    }

    fn remove_branch(&self, sequence_id: Uuid, branch_id: &str) -> bool {
        let removed = self
            .branches
            .remove(&(sequence_id, branch_id.to_string()))
            .is_some();
        if removed {
            info!(sequence_id = %sequence_id, branch_id = %branch_id, "Branch removed");
        }
        removed
    }

    fn branches_for_step(&self, sequence_id: Uuid, step_id: Uuid) -> Vec<Branch> {
        let mut branches: Vec<Branch> = self
            .branches
            .iter()
            .filter(|r| {
                let b = r.value();
                b.sequence_id == sequence_id && b.trigger_step_id == Some(step_id)
            })
            .map(|r| r.value().clone())
            .collect();
        branches.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        branches
    }

    fn upsert_enrollment(
        &self,
        sequence_id: Uuid,
        email: &str,
        data: RecipientData,
        step_order: u32,
        next_send_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        let email = normalize_email(email);
        // Holding the index entry serializes concurrent enrolls of the same recipient.
        let index_entry = self
            .enrollment_index
            .entry((sequence_id, email.clone()))
            .or_insert_with(Uuid::new_v4);
        let enrollment_id = *index_entry;

        let mut row = self.enrollments.entry(enrollment_id).or_insert_with(|| Enrollment {
            id: enrollment_id,
            sequence_id,
            recipient_email: email.clone(),
            current_step: step_order,
            branch_id: None,
            status: EnrollmentStatus::Active,
            next_send_at: Some(next_send_at),
            action_clicked_at: None,
            branch_switched_at: None,
            trigger_data: None,
            recipient_data: RecipientData::new(),
            enrolled_at: now,
            completed_at: None,
            last_sent_at: None,
            claimed_until: None,
            updated_at: now,
        });

        let e = row.value_mut();
        e.current_step = step_order;
        e.branch_id = None;
        e.status = EnrollmentStatus::Active;
        e.next_send_at = Some(next_send_at);
        e.action_clicked_at = None;
        e.branch_switched_at = None;
        e.trigger_data = None;
        e.recipient_data = data;
        e.enrolled_at = now;
        e.completed_at = None;
        e.claimed_until = None;
        e.updated_at = now;
        let enrollment = e.clone();
        drop(row);
        drop(index_entry);
        Ok(enrollment)
    }

    fn get_enrollment(&self, enrollment_id: Uuid) -> Option<Enrollment> {
        self.enrollments.get(&enrollment_id).map(|r| r.value().clone())
    }

    fn find_enrollment(&self, sequence_id: Uuid, email: &str) -> Option<Enrollment> {
        let id = *self
            .enrollment_index
            .get(&(sequence_id, normalize_email(email)))?;
        self.get_enrollment(id)
    }

    fn update_status(
        &self,
        enrollment_id: Uuid,
        expected: EnrollmentStatus,
        to: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        self.update_enrollment(enrollment_id, |e| {
            if e.status != expected {
                return Err(DripError::InvalidTransition {
                    from: e.status.to_string(),
                    to: to.to_string(),
                });
            }
            e.status = to;
            e.updated_at = now;
            Ok(e.clone())
        })
    }

    fn claim_due(&self, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> DripResult<Vec<Enrollment>> {
        let mut claimed = Vec::new();
        for mut row in self.enrollments.iter_mut() {
            let e = row.value_mut();
            let due = e.status == EnrollmentStatus::Active
                && e.next_send_at.is_some_and(|at| at <= now)
                && !e.is_claimed_at(now);
            if due && self.sequence_enabled(e.sequence_id) {
                e.claimed_until = Some(lease_until);
                claimed.push(e.clone());
            }
        }
        claimed.sort_by(|a, b| a.next_send_at.cmp(&b.next_send_at));
        Ok(claimed)
    }

    fn release_claim(&self, enrollment_id: Uuid, lease: DateTime<Utc>) -> DripResult<()> {
        self.update_enrollment(enrollment_id, |e| {
            if e.claimed_until == Some(lease) {
                e.claimed_until = None;
            }
            Ok(())
        })
    }

    fn save_progress(
        &self,
        enrollment_id: Uuid,
        step_order: u32,
        next_send_at: DateTime<Utc>,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        self.update_claimed(enrollment_id, lease, |e| {
            e.current_step = step_order;
            e.next_send_at = Some(next_send_at);
            e.claimed_until = None;
            e.updated_at = now;
            Ok(())
        })
    }

    fn record_sent(
        &self,
        enrollment_id: Uuid,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        self.update_claimed(enrollment_id, lease, |e| {
            e.last_sent_at = Some(now);
            e.updated_at = now;
            Ok(())
        })
    }

    fn mark_completed(
        &self,
        enrollment_id: Uuid,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        self.update_claimed(enrollment_id, lease, |e| {
            e.claimed_until = None;
            if e.status != EnrollmentStatus::Active {
                return Ok(false);
            }
            e.status = EnrollmentStatus::Completed;
            e.completed_at = Some(now);
            e.next_send_at = None;
            e.updated_at = now;
            Ok(true)
        })
    }

    fn switch_branch(
        &self,
        enrollment_id: Uuid,
        branch_id: &str,
        placement: Option<BranchPlacement>,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        self.update_claimed(enrollment_id, lease, |e| {
            if e.branch_switched_at.is_some() {
                return Ok(false);
            }
            e.branch_switched_at = Some(now);
            if let Some(placement) = placement {
                e.branch_id = Some(branch_id.to_string());
                e.current_step = placement.step_order;
                e.next_send_at = Some(placement.next_send_at);
            }
            e.updated_at = now;
            Ok(true)
        })
    }

    fn record_action_click(
        &self,
        enrollment_id: Uuid,
        trigger: TriggerData,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        self.update_enrollment(enrollment_id, |e| {
            if e.action_clicked_at.is_some() {
                return Ok(false);
            }
            e.action_clicked_at = Some(now);
            e.trigger_data = Some(trigger);
            e.updated_at = now;
            Ok(true)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{BranchTrigger, ContentBlock, StepContent};
    use chrono::Duration;

    fn inline() -> StepContent {
        StepContent::Inline {
            blocks: vec![ContentBlock::new("text", serde_json::json!({"text": "hi"}))],
        }
    }

    fn seeded() -> (InMemorySequenceStore, Sequence) {
        let store = InMemorySequenceStore::new();
        let sequence = Sequence::new("Onboarding");
        store.put_sequence(sequence.clone());
        for order in [1, 2, 3] {
            store
                .put_step(SequenceStep::new(sequence.id, None, order, "s", inline()))
                .unwrap();
        }
        (store, sequence)
    }

    #[test]
    fn duplicate_step_order_on_a_path_is_rejected() {
        let (store, sequence) = seeded();
        let dup = SequenceStep::new(sequence.id, None, 2, "dup", inline());
        assert!(matches!(
            store.put_step(dup),
            Err(DripError::InvalidDefinition(_))
        ));
        // Same order on a branch path is fine.
        store
            .put_step(SequenceStep::new(sequence.id, Some("vip"), 2, "b", inline()))
            .unwrap();
    }

    #[test]
    fn path_navigation_respects_branch() {
        let (store, sequence) = seeded();
        store
            .put_step(SequenceStep::new(sequence.id, Some("vip"), 10, "b", inline()))
            .unwrap();

        assert_eq!(store.first_step(sequence.id, None).unwrap().step_order, 1);
        assert_eq!(store.next_step(sequence.id, None, 1).unwrap().step_order, 2);
        assert!(store.next_step(sequence.id, None, 3).is_none());
        assert_eq!(
            store.first_step(sequence.id, Some("vip")).unwrap().step_order,
            10
        );
        assert!(store.get_step(sequence.id, Some("vip"), 1).is_none());
    }

    #[test]
    fn invalid_branch_trigger_is_rejected_at_creation() {
        let (store, sequence) = seeded();
        let branch = Branch::new(
            sequence.id,
            "cold",
            None,
            BranchTrigger::NoEngagement { after_steps: 0 },
        );
        assert!(store.put_branch(branch).is_err());
    }

    #[test]
    fn branches_are_ordered_by_priority_then_creation() {
        let (store, sequence) = seeded();
        let step = store.first_step(sequence.id, None).unwrap();
        let now = Utc::now();

        let mut late = Branch::new(sequence.id, "late", Some(step.id), BranchTrigger::ClickedAny);
        late.created_at = now + Duration::seconds(10);
        let mut early = Branch::new(sequence.id, "early", Some(step.id), BranchTrigger::ClickedAny);
        early.created_at = now;
        let mut urgent = Branch::new(sequence.id, "urgent", Some(step.id), BranchTrigger::ClickedAny);
        urgent.created_at = now + Duration::seconds(20);
        urgent.priority = 0;
        late.priority = 1;
        early.priority = 1;

        for b in [late, early, urgent] {
            store.put_branch(b).unwrap();
        }
        let ids: Vec<String> = store
            .branches_for_step(sequence.id, step.id)
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["urgent", "early", "late"]);
    }

    #[test]
    fn upsert_keeps_one_row_per_recipient() {
        let (store, sequence) = seeded();
        let now = Utc::now();
        let lease = now + Duration::minutes(5);
        let first = store
            .upsert_enrollment(sequence.id, "Ada@Example.com", RecipientData::new(), 1, now, now)
            .unwrap();
        store.claim_due(now, lease).unwrap();
        store.switch_branch(first.id, "vip", None, lease, now).unwrap();
        assert!(store.mark_completed(first.id, lease, now).unwrap());

        let again = store
            .upsert_enrollment(sequence.id, "ada@example.com ", RecipientData::new(), 1, now, now)
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.current_step, 1);
        assert_eq!(again.status, EnrollmentStatus::Active);
        assert!(again.completed_at.is_none());
        assert!(again.branch_switched_at.is_none());
        assert_eq!(store.list_enrollments(sequence.id).len(), 1);
    }

    #[test]
    fn overlapping_claims_do_not_share_rows() {
        let (store, sequence) = seeded();
        let now = Utc::now();
        store
            .upsert_enrollment(sequence.id, "a@example.com", RecipientData::new(), 1, now, now)
            .unwrap();
        store
            .upsert_enrollment(
                sequence.id,
                "b@example.com",
                RecipientData::new(),
                1,
                now + Duration::hours(1),
                now,
            )
            .unwrap();

        let lease = now + Duration::minutes(5);
        let first = store.claim_due(now, lease).unwrap();
        assert_eq!(first.len(), 1);
        assert!(store.claim_due(now, lease).unwrap().is_empty());

        // An expired lease makes the row claimable again.
        let later = lease + Duration::seconds(1);
        assert_eq!(store.claim_due(later, later + Duration::minutes(5)).unwrap().len(), 1);
    }

    #[test]
    fn disabled_sequence_is_never_claimed() {
        let (store, sequence) = seeded();
        let now = Utc::now();
        let e = store
            .upsert_enrollment(sequence.id, "a@example.com", RecipientData::new(), 1, now, now)
            .unwrap();
        store.set_sequence_enabled(sequence.id, false).unwrap();

        assert!(store.claim_due(now, now + Duration::minutes(5)).unwrap().is_empty());
        let row = store.get_enrollment(e.id).unwrap();
        assert_eq!(row.status, EnrollmentStatus::Active);
        assert!(row.claimed_until.is_none());
    }

    #[test]
    fn once_only_markers() {
        let (store, sequence) = seeded();
        let now = Utc::now();
        let lease = now + Duration::minutes(5);
        let e = store
            .upsert_enrollment(sequence.id, "a@example.com", RecipientData::new(), 1, now, now)
            .unwrap();
        store.claim_due(now, lease).unwrap();

        assert!(store.switch_branch(e.id, "vip", None, lease, now).unwrap());
        assert!(!store.switch_branch(e.id, "other", None, lease, now).unwrap());

        let click = TriggerData {
            branch_id: Some("vip".into()),
            button_id: None,
        };
        assert!(store.record_action_click(e.id, click.clone(), now).unwrap());
        assert!(!store.record_action_click(e.id, click, now).unwrap());
    }

    #[test]
    fn writes_after_a_reset_are_rejected() {
        let (store, sequence) = seeded();
        let now = Utc::now();
        let lease = now + Duration::minutes(5);
        let e = store
            .upsert_enrollment(sequence.id, "a@example.com", RecipientData::new(), 1, now, now)
            .unwrap();
        assert_eq!(store.claim_due(now, lease).unwrap().len(), 1);

        let later = now + Duration::days(7);
        store
            .upsert_enrollment(sequence.id, "a@example.com", RecipientData::new(), 1, later, now)
            .unwrap();

        assert!(matches!(
            store.save_progress(e.id, 2, now, lease, now),
            Err(DripError::ClaimLost { .. })
        ));
        assert!(matches!(
            store.mark_completed(e.id, lease, now),
            Err(DripError::ClaimLost { .. })
        ));
        assert!(store.switch_branch(e.id, "vip", None, lease, now).is_err());
        store.release_claim(e.id, lease).unwrap();

        let row = store.get_enrollment(e.id).unwrap();
        assert_eq!(row.current_step, 1);
        assert_eq!(row.next_send_at, Some(later));
        assert_eq!(row.status, EnrollmentStatus::Active);
        assert!(row.branch_switched_at.is_none());
    }

    #[test]
    fn release_leaves_a_newer_claim_alone() {
        let (store, sequence) = seeded();
        let now = Utc::now();
        let e = store
            .upsert_enrollment(sequence.id, "a@example.com", RecipientData::new(), 1, now, now)
            .unwrap();
        let stale = now + Duration::minutes(5);
        store.claim_due(now, stale).unwrap();

        let after_expiry = stale + Duration::seconds(1);
        let fresh = after_expiry + Duration::minutes(5);
        assert_eq!(store.claim_due(after_expiry, fresh).unwrap().len(), 1);

        store.release_claim(e.id, stale).unwrap();
        assert_eq!(store.get_enrollment(e.id).unwrap().claimed_until, Some(fresh));
        store.release_claim(e.id, fresh).unwrap();
        assert!(store.get_enrollment(e.id).unwrap().claimed_until.is_none());
    }

    #[test]
    fn oversized_step_delay_is_rejected() {
        let (store, sequence) = seeded();
        let step = SequenceStep::new(sequence.id, None, 9, "late", inline())
            .with_delay(crate::types::StepDelay::days(u32::MAX));
        assert!(matches!(
            store.put_step(step),
            Err(DripError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn removed_branch_is_gone() {
        let (store, sequence) = seeded();
        store
            .put_branch(Branch::new(sequence.id, "vip", None, BranchTrigger::ClickedAny))
            .unwrap();
        assert!(store.remove_branch(sequence.id, "vip"));
        assert!(!store.remove_branch(sequence.id, "vip"));
        assert!(store.get_branch(sequence.id, "vip").is_none());
    }
}
