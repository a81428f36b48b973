use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_core::config::AppConfig;
use drip_core::event_bus::{make_event, EventSink};
use drip_core::types::SequenceEventType;
use drip_core::{DripError, DripResult};
use drip_delivery::{AccountSelector, SendingAccount, TransportFactory};

use crate::content::TemplateCompiler;
use crate::evaluator::{action_delay_elapsed, BranchTriggerEvaluator, TriggerContext};
use crate::schedule::next_send_at;
use crate::state_machine::EnrollmentStateMachine;
use crate::store::{BranchPlacement, EnrollmentStore};
use crate::tracking::{campaign_key, TrackingService};
use crate::types::{
    ContentBlock, Engagement, Enrollment, EnrollmentStatus, RecipientData, Sequence, SequenceStep,
    StepContent, TriggerData, DEFAULT_BRANCH_ID,
};

/// Runtime knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Public base URL for links, images and tracking endpoints.
    pub base_url: String,
    pub claim_lease: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.tracking.base_url.clone(),
            claim_lease: Duration::seconds(config.scheduler.claim_lease_secs),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// What processing one due enrollment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Sent { step_order: u32 },
    Switched { branch_id: String },
    Completed,
    /// Nothing changed; the enrollment stays due for the next tick.
    Deferred,
}

/// Result of moving an enrollment onto a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchOutcome {
    /// The enrollment now sits on the branch's first step.
    Moved,
    /// The branch has no steps; only `branch_switched_at` was set.
    Marked,
    /// Another switch already happened.
    AlreadySwitched,
}

struct RenderedEmail {
    subject: String,
    html: String,
}

/// Drives enrollments through their steps and reroutes them onto branches.
#[derive(Clone)]
pub struct SequenceEngine {
    store: Arc<dyn EnrollmentStore>,
    selector: Arc<AccountSelector>,
    transports: Arc<dyn TransportFactory>,
    compiler: Arc<dyn TemplateCompiler>,
    tracking: Arc<dyn TrackingService>,
    evaluator: BranchTriggerEvaluator,
    event_sink: Arc<dyn EventSink>,
    settings: EngineSettings,
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

impl SequenceEngine {
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        selector: Arc<AccountSelector>,
        transports: Arc<dyn TransportFactory>,
        compiler: Arc<dyn TemplateCompiler>,
        tracking: Arc<dyn TrackingService>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            selector,
            transports,
            compiler,
            tracking,
            evaluator: BranchTriggerEvaluator::new(),
            event_sink: drip_core::event_bus::noop_sink(),
            settings,
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn get_enrollment(&self, enrollment_id: Uuid) -> Option<Enrollment> {
        self.store.get_enrollment(enrollment_id)
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    pub fn enroll(&self, sequence_id: Uuid, email: &str, data: RecipientData) -> DripResult<Uuid> {
        self.enroll_at(sequence_id, email, data, Utc::now())
    }

    /// Enrolls (or re-enrolls) the recipient at the first main-path step.
    pub fn enroll_at(
        &self,
        sequence_id: Uuid,
        email: &str,
        data: RecipientData,
        now: DateTime<Utc>,
    ) -> DripResult<Uuid> {
        self.store
            .get_sequence(sequence_id)
            .ok_or_else(|| DripError::not_found("Sequence", sequence_id))?;
        let first = self
            .store
            .first_step(sequence_id, None)
            .ok_or(DripError::NoSteps { sequence_id })?;

        let send_at = next_send_at(&first.delay, now)?;
        let enrollment =
            self.store
                .upsert_enrollment(sequence_id, email, data, first.step_order, send_at, now)?;

        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %sequence_id,
            recipient = %enrollment.recipient_email,
            next_send_at = %send_at,
            "Recipient enrolled"
        );
        metrics::counter!("sequences.enrolled").increment(1);
        self.emit(SequenceEventType::Enrolled, &enrollment, |event| {
            event.step_order = Some(first.step_order);
        });
        Ok(enrollment.id)
    }

    pub fn pause(&self, enrollment_id: Uuid) -> DripResult<()> {
        self.transition(enrollment_id, EnrollmentStatus::Paused, SequenceEventType::Paused)
    }

    pub fn cancel(&self, enrollment_id: Uuid) -> DripResult<()> {
        self.transition(
            enrollment_id,
            EnrollmentStatus::Cancelled,
            SequenceEventType::Cancelled,
        )
    }

    /// Reactivates a paused enrollment without rescheduling it; a
    /// `next_send_at` already in the past makes it due on the next tick.
    pub fn resume(&self, enrollment_id: Uuid) -> DripResult<()> {
        self.transition(enrollment_id, EnrollmentStatus::Active, SequenceEventType::Resumed)
    }

    fn transition(
        &self,
        enrollment_id: Uuid,
        to: EnrollmentStatus,
        event_type: SequenceEventType,
    ) -> DripResult<()> {
        let current = self
            .store
            .get_enrollment(enrollment_id)
            .ok_or_else(|| DripError::not_found("Enrollment", enrollment_id))?;
        let mut machine = EnrollmentStateMachine::new(current.status);
        machine.transition(to)?;

        let updated = self
            .store
            .update_status(enrollment_id, current.status, to, Utc::now())?;
        info!(
            enrollment_id = %enrollment_id,
            from = %current.status,
            to = %to,
            "Enrollment status changed"
        );
        self.emit(event_type, &updated, |_| {});
        Ok(())
    }

    pub fn record_action_click(
        &self,
        enrollment_id: Uuid,
        branch_id: &str,
        button_id: Option<String>,
    ) -> DripResult<bool> {
        self.record_action_click_at(enrollment_id, branch_id, button_id, Utc::now())
    }

    /// Records the recipient's first action-button click. The branch switch
    /// itself happens on a later tick, once the sequence's branch delay has
    /// elapsed. Returns false if a click was already recorded.
    pub fn record_action_click_at(
        &self,
        enrollment_id: Uuid,
        branch_id: &str,
        button_id: Option<String>,
        now: DateTime<Utc>,
    ) -> DripResult<bool> {
        let enrollment = self
            .store
            .get_enrollment(enrollment_id)
            .ok_or_else(|| DripError::not_found("Enrollment", enrollment_id))?;
        self.store
            .get_branch(enrollment.sequence_id, branch_id)
            .ok_or_else(|| DripError::not_found("Branch", branch_id))?;

        let trigger = TriggerData {
            branch_id: Some(branch_id.to_string()),
            button_id,
        };
        let recorded = self.store.record_action_click(enrollment_id, trigger, now)?;
        if recorded {
            info!(enrollment_id = %enrollment_id, branch_id = %branch_id, "Action click recorded");
            self.emit(SequenceEventType::ActionClicked, &enrollment, |event| {
                event.branch_id = Some(branch_id.to_string());
            });
        }
        Ok(recorded)
    }

    // ─── Due work ──────────────────────────────────────────────────────────

    /// Claims and processes every enrollment due at `now`. Failures are
    /// isolated per enrollment. Returns how many enrollments were sent,
    /// switched or completed.
    pub async fn process_due(&self, now: DateTime<Utc>) -> DripResult<usize> {
        let lease = now + self.settings.claim_lease;
        let claimed = self.store.claim_due(now, lease)?;
        if claimed.is_empty() {
            return Ok(0);
        }
        info!(count = claimed.len(), "Processing due enrollments");

        let mut processed = 0;
        for enrollment in claimed {
            let enrollment_id = enrollment.id;
            match self.process_enrollment(enrollment, now, lease).await {
                Ok(StepOutcome::Deferred) => {}
                Ok(outcome) => {
                    debug!(enrollment_id = %enrollment_id, ?outcome, "Enrollment processed");
                    processed += 1;
                }
                Err(DripError::ClaimLost { .. }) => {
                    info!(
                        enrollment_id = %enrollment_id,
                        "Enrollment changed hands mid-processing, leaving it"
                    );
                    metrics::counter!("sequences.claims_lost").increment(1);
                }
                Err(e) => {
                    warn!(enrollment_id = %enrollment_id, error = %e, "Enrollment processing failed");
                    metrics::counter!("sequences.processing_errors").increment(1);
                }
            }
            // No-op unless this tick still holds the row.
            if let Err(e) = self.store.release_claim(enrollment_id, lease) {
                warn!(enrollment_id = %enrollment_id, error = %e, "Failed to release claim");
            }
        }

        info!(processed, "Due enrollments processed");
        Ok(processed)
    }

    async fn process_enrollment(
        &self,
        mut enrollment: Enrollment,
        now: DateTime<Utc>,
        lease: DateTime<Utc>,
    ) -> DripResult<StepOutcome> {
        let sequence = self
            .store
            .get_sequence(enrollment.sequence_id)
            .ok_or_else(|| DripError::not_found("Sequence", enrollment.sequence_id))?;

        // A recorded action click switches once its grace period has passed.
        if !enrollment.has_switched()
            && action_delay_elapsed(&enrollment, sequence.branch_delay_hours, now)
        {
            let target = enrollment
                .trigger_data
                .as_ref()
                .and_then(|t| t.branch_id.clone());
            if let Some(target) = target {
                let outcome = self.switch_branch(&enrollment, &target, now, lease)?;
                enrollment = self.reload(enrollment.id)?;
                if outcome == SwitchOutcome::Moved
                    && enrollment.next_send_at.is_some_and(|at| at > now)
                {
                    return Ok(StepOutcome::Switched { branch_id: target });
                }
            }
        }

        let step = self.store.get_step(
            sequence.id,
            enrollment.branch_id.as_deref(),
            enrollment.current_step,
        );
        let Some(step) = step else {
            return self.finish_path(&enrollment, now, lease);
        };

        let (blocks, template_subject) = self.resolve_content(&step)?;

        let Some(account) = self.selector.select(now) else {
            debug!(enrollment_id = %enrollment.id, "No healthy sending account, deferring");
            metrics::counter!("sequences.deferred").increment(1);
            return Ok(StepOutcome::Deferred);
        };

        let email = self.render(
            &sequence,
            &enrollment,
            &step,
            &blocks,
            template_subject.as_deref(),
        )?;

        if let Err(e) = self.dispatch(&account, &enrollment, &email).await {
            if let Err(breaker_err) = self.selector.breaker().record_failure(&account.id, now) {
                warn!(account_id = %account.id, error = %breaker_err, "Failed to record send failure");
            }
            metrics::counter!("sequences.send_failures").increment(1);
            self.emit(SequenceEventType::SendFailed, &enrollment, |event| {
                event.step_order = Some(step.step_order);
                event.account_id = Some(account.id.clone());
                event.detail = Some(e.to_string());
            });
            return Err(e);
        }

        if let Err(e) = self.selector.breaker().record_success(&account.id) {
            warn!(account_id = %account.id, error = %e, "Failed to record send success");
        }
        if let Err(e) = self.selector.record_send(&account, now) {
            warn!(account_id = %account.id, error = %e, "Failed to count send against quota");
        }
        self.store.record_sent(enrollment.id, lease, now)?;
        metrics::counter!("sequences.steps_sent").increment(1);
        info!(
            enrollment_id = %enrollment.id,
            step_order = step.step_order,
            branch = enrollment.branch_id.as_deref().unwrap_or("main"),
            account_id = %account.id,
            "Sequence step sent"
        );
        self.emit(SequenceEventType::StepSent, &enrollment, |event| {
            event.step_order = Some(step.step_order);
            event.account_id = Some(account.id.clone());
        });

        if let Some(branch_id) =
            self.evaluate_triggers(&sequence, &enrollment, &step, now, lease)?
        {
            return Ok(StepOutcome::Switched { branch_id });
        }

        self.advance(&enrollment, &step, now, lease)
    }

    fn resolve_content(&self, step: &SequenceStep) -> DripResult<(Vec<ContentBlock>, Option<String>)> {
        match &step.content {
            StepContent::Inline { blocks } => Ok((blocks.clone(), None)),
            StepContent::Template { template_id } => {
                let template = self
                    .store
                    .get_template(*template_id)
                    .ok_or_else(|| DripError::not_found("Template", template_id))?;
                Ok((template.blocks, Some(template.subject)))
            }
        }
    }

    fn render(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        step: &SequenceStep,
        blocks: &[ContentBlock],
        template_subject: Option<&str>,
    ) -> DripResult<RenderedEmail> {
        let mut data = enrollment.recipient_data.clone();
        data.entry("email".to_string())
            .or_insert_with(|| serde_json::Value::String(enrollment.recipient_email.clone()));
        data.insert(
            "enrollment_id".to_string(),
            serde_json::Value::String(enrollment.id.to_string()),
        );

        let html = self
            .compiler
            .compile(blocks, &data, &self.settings.base_url)?;
        let raw_subject = match template_subject {
            Some(subject) if step.subject.trim().is_empty() => subject,
            _ => step.subject.as_str(),
        };
        let subject = self.compiler.replace_variables(raw_subject, &data);

        let token = self
            .tracking
            .get_or_create_token(&campaign_key(sequence.id), &enrollment.recipient_email)?;
        let html = if sequence.tracking.any() {
            self.tracking
                .inject_tracking(&html, &token, &self.settings.base_url, sequence.tracking)
        } else {
            html
        };

        Ok(RenderedEmail { subject, html })
    }

    async fn dispatch(
        &self,
        account: &SendingAccount,
        enrollment: &Enrollment,
        email: &RenderedEmail,
    ) -> DripResult<()> {
        let transport = self.transports.connect(account).await?;
        let result = transport
            .send(&enrollment.recipient_email, &email.subject, &email.html)
            .await;
        transport.disconnect().await;
        result
    }

    /// Runs the triggers attached to the completed step. Returns the branch
    /// the enrollment moved onto, if any.
    fn evaluate_triggers(
        &self,
        sequence: &Sequence,
        enrollment: &Enrollment,
        step: &SequenceStep,
        now: DateTime<Utc>,
        lease: DateTime<Utc>,
    ) -> DripResult<Option<String>> {
        let branches = self.store.branches_for_step(sequence.id, step.id);
        if branches.is_empty() || enrollment.has_switched() {
            return Ok(None);
        }

        let engagement = if branches.iter().any(|b| b.trigger.needs_engagement()) {
            match self
                .tracking
                .find_token(&campaign_key(sequence.id), &enrollment.recipient_email)
            {
                None => Engagement::Untracked,
                Some(token) => match self.tracking.engagement(&token) {
                    Ok(counts) => Engagement::Tracked(counts),
                    Err(e) => {
                        // The send already happened; advance without rerouting.
                        warn!(enrollment_id = %enrollment.id, error = %e, "Engagement lookup failed");
                        return Ok(None);
                    }
                },
            }
        } else {
            Engagement::Untracked
        };

        let ctx = TriggerContext {
            enrollment,
            engagement,
            branch_delay_hours: sequence.branch_delay_hours,
            now,
        };
        let Some(branch) = self.evaluator.evaluate(&branches, &ctx) else {
            return Ok(None);
        };

        match self.switch_branch(enrollment, &branch.id, now, lease)? {
            SwitchOutcome::Moved => Ok(Some(branch.id.clone())),
            SwitchOutcome::Marked | SwitchOutcome::AlreadySwitched => Ok(None),
        }
    }

    fn switch_branch(
        &self,
        enrollment: &Enrollment,
        branch_id: &str,
        now: DateTime<Utc>,
        lease: DateTime<Utc>,
    ) -> DripResult<SwitchOutcome> {
        if self
            .store
            .get_branch(enrollment.sequence_id, branch_id)
            .is_none()
        {
            // The target was removed after the click; spend the switch in place.
            warn!(
                enrollment_id = %enrollment.id,
                branch_id = %branch_id,
                "Switch target no longer exists, staying on current path"
            );
            let marked = self
                .store
                .switch_branch(enrollment.id, branch_id, None, lease, now)?;
            return Ok(if marked {
                SwitchOutcome::Marked
            } else {
                SwitchOutcome::AlreadySwitched
            });
        }

        let placement = match self.store.first_step(enrollment.sequence_id, Some(branch_id)) {
            Some(first) => Some(BranchPlacement {
                step_order: first.step_order,
                next_send_at: next_send_at(&first.delay, now)?,
            }),
            None => None,
        };

        if !self
            .store
            .switch_branch(enrollment.id, branch_id, placement, lease, now)?
        {
            return Ok(SwitchOutcome::AlreadySwitched);
        }

        metrics::counter!("sequences.branch_switches").increment(1);
        info!(
            enrollment_id = %enrollment.id,
            branch_id = %branch_id,
            moved = placement.is_some(),
            "Enrollment switched branch"
        );
        self.emit(SequenceEventType::BranchSwitched, enrollment, |event| {
            event.branch_id = Some(branch_id.to_string());
            event.step_order = placement.map(|p| p.step_order);
        });

        Ok(if placement.is_some() {
            SwitchOutcome::Moved
        } else {
            SwitchOutcome::Marked
        })
    }

    fn advance(
        &self,
        enrollment: &Enrollment,
        step: &SequenceStep,
        now: DateTime<Utc>,
        lease: DateTime<Utc>,
    ) -> DripResult<StepOutcome> {
        let next = self.store.next_step(
            enrollment.sequence_id,
            enrollment.branch_id.as_deref(),
            step.step_order,
        );
        match next {
            Some(next) => {
                let send_at = next_send_at(&next.delay, now)?;
                self.store
                    .save_progress(enrollment.id, next.step_order, send_at, lease, now)?;
                debug!(
                    enrollment_id = %enrollment.id,
                    step_order = next.step_order,
                    next_send_at = %send_at,
                    "Enrollment advanced"
                );
            }
            None => {
                let latest = self.reload(enrollment.id)?;
                self.finish_path(&latest, now, lease)?;
            }
        }
        Ok(StepOutcome::Sent {
            step_order: step.step_order,
        })
    }

    /// The active path has no step left: fall back onto the default branch
    /// if the enrollment never switched, otherwise complete it.
    fn finish_path(
        &self,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
        lease: DateTime<Utc>,
    ) -> DripResult<StepOutcome> {
        let on_default = enrollment.branch_id.as_deref() == Some(DEFAULT_BRANCH_ID);
        let has_default = self
            .store
            .get_branch(enrollment.sequence_id, DEFAULT_BRANCH_ID)
            .is_some();
        if !enrollment.has_switched()
            && !on_default
            && has_default
            && self.switch_branch(enrollment, DEFAULT_BRANCH_ID, now, lease)?
                == SwitchOutcome::Moved
        {
            return Ok(StepOutcome::Switched {
                branch_id: DEFAULT_BRANCH_ID.to_string(),
            });
        }

        let mut machine = EnrollmentStateMachine::new(enrollment.status);
        if let Err(e) = machine.transition(EnrollmentStatus::Completed) {
            debug!(
                enrollment_id = %enrollment.id,
                error = %e,
                "Path exhausted but enrollment cannot complete, leaving it"
            );
            return Ok(StepOutcome::Deferred);
        }

        if self.store.mark_completed(enrollment.id, lease, now)? {
            metrics::counter!("sequences.completed").increment(1);
            info!(
                enrollment_id = %enrollment.id,
                step_order = enrollment.current_step,
                "Enrollment completed"
            );
            self.emit(SequenceEventType::Completed, enrollment, |event| {
                event.step_order = Some(enrollment.current_step);
            });
        }
        Ok(StepOutcome::Completed)
    }

    fn reload(&self, enrollment_id: Uuid) -> DripResult<Enrollment> {
        self.store
            .get_enrollment(enrollment_id)
            .ok_or_else(|| DripError::not_found("Enrollment", enrollment_id))
    }

    fn emit<F>(&self, event_type: SequenceEventType, enrollment: &Enrollment, fill: F)
    where
        F: FnOnce(&mut drip_core::types::SequenceEvent),
    {
        let mut event = make_event(
            event_type,
            enrollment.id,
            enrollment.sequence_id,
            enrollment.recipient_email.clone(),
        );
        event.branch_id = enrollment.branch_id.clone();
        fill(&mut event);
        self.event_sink.emit(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::BlockCompiler;
    use crate::store::InMemorySequenceStore;
    use crate::tracking::InMemoryTracking;
    use crate::types::{Branch, BranchTrigger, StepDelay, Template};
    use async_trait::async_trait;
    use drip_core::config::CircuitBreakerConfig;
    use drip_core::event_bus::capture_sink;
    use drip_delivery::{
        AccountStore, CircuitBreaker, InMemoryAccountStore, MailTransport, ProviderKind,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String, String)>>,
        failing: AtomicBool,
    }

    struct OutboxTransport(Arc<Outbox>);

    #[async_trait]
    impl MailTransport for OutboxTransport {
        async fn send(&self, to: &str, subject: &str, html: &str) -> DripResult<()> {
            if self.0.failing.load(Ordering::SeqCst) {
                return Err(DripError::Delivery("connection reset".into()));
            }
            self.0
                .sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), html.to_string()));
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    struct OutboxFactory(Arc<Outbox>);

    #[async_trait]
    impl TransportFactory for OutboxFactory {
        async fn connect(
            &self,
            _account: &SendingAccount,
        ) -> DripResult<Box<dyn MailTransport>> {
            Ok(Box::new(OutboxTransport(self.0.clone())))
        }
    }

    struct Harness {
        engine: SequenceEngine,
        store: Arc<InMemorySequenceStore>,
        accounts: Arc<InMemoryAccountStore>,
        outbox: Arc<Outbox>,
        sequence: Sequence,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemorySequenceStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts.upsert_account(SendingAccount::new("a", "a@example.com", ProviderKind::Smtp));
        let breaker = Arc::new(CircuitBreaker::new(
            accounts.clone(),
            CircuitBreakerConfig::default(),
        ));
        let selector = Arc::new(AccountSelector::new(accounts.clone(), breaker));
        let outbox = Arc::new(Outbox::default());

        let sequence = Sequence::new("Trial");
        store.put_sequence(sequence.clone());

        let engine = SequenceEngine::new(
            store.clone(),
            selector,
            Arc::new(OutboxFactory(outbox.clone())),
            Arc::new(BlockCompiler::new()),
            Arc::new(InMemoryTracking::new()),
            EngineSettings::default(),
        );
        Harness {
            engine,
            store,
            accounts,
            outbox,
            sequence,
        }
    }

    fn text(body: &str) -> StepContent {
        StepContent::Inline {
            blocks: vec![ContentBlock::new("text", json!({ "text": body }))],
        }
    }

    fn add_step(h: &Harness, branch: Option<&str>, order: u32, delay: StepDelay) -> SequenceStep {
        let step = SequenceStep::new(h.sequence.id, branch, order, format!("Step {order}"), text("hi"))
            .with_delay(delay);
        h.store.put_step(step.clone()).unwrap();
        step
    }

    #[test]
    fn enroll_without_steps_fails() {
        let h = harness();
        let err = h
            .engine
            .enroll(h.sequence.id, "ada@example.com", RecipientData::new())
            .unwrap_err();
        assert!(matches!(err, DripError::NoSteps { .. }));
    }

    #[test]
    fn enroll_unknown_sequence_is_not_found() {
        let h = harness();
        let err = h
            .engine
            .enroll(Uuid::new_v4(), "ada@example.com", RecipientData::new())
            .unwrap_err();
        assert!(matches!(err, DripError::NotFound { .. }));
    }

    #[test]
    fn enroll_schedules_from_first_step_delay() {
        let h = harness();
        add_step(&h, None, 1, StepDelay { days: 1, hours: 2, send_time: None });
        let now = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();
        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.current_step, 1);
        assert_eq!(e.next_send_at, Some(now + Duration::hours(26)));
        assert_eq!(e.status, EnrollmentStatus::Active);
    }

    #[test]
    fn lifecycle_transitions_are_guarded() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        let sink = capture_sink();
        let engine = h.engine.clone().with_event_sink(sink.clone());
        let id = engine
            .enroll(h.sequence.id, "ada@example.com", RecipientData::new())
            .unwrap();

        engine.pause(id).unwrap();
        assert!(engine.pause(id).is_err());
        assert!(engine.cancel(id).is_err());
        engine.resume(id).unwrap();
        engine.cancel(id).unwrap();
        assert!(matches!(
            engine.resume(id),
            Err(DripError::InvalidTransition { .. })
        ));

        let e = engine.get_enrollment(id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Cancelled);
        assert_eq!(e.current_step, 1);
        assert_eq!(sink.count_type(SequenceEventType::Paused), 1);
        assert_eq!(sink.count_type(SequenceEventType::Cancelled), 1);
    }

    #[tokio::test]
    async fn resume_keeps_past_schedule_and_sends_next_tick() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        add_step(&h, None, 2, StepDelay::days(1));
        let t0 = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), t0)
            .unwrap();

        h.engine.pause(id).unwrap();
        assert_eq!(h.engine.process_due(t0 + Duration::hours(1)).await.unwrap(), 0);

        h.engine.resume(id).unwrap();
        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.next_send_at, Some(t0));

        let t1 = t0 + Duration::days(3);
        assert_eq!(h.engine.process_due(t1).await.unwrap(), 1);
        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.current_step, 2);
        assert_eq!(e.next_send_at, Some(t1 + Duration::days(1)));
    }

    #[tokio::test]
    async fn renders_template_subject_and_merge_fields() {
        let h = harness();
        let template = Template {
            id: Uuid::new_v4(),
            name: "welcome".into(),
            subject: "Welcome, {{first_name}}".into(),
            blocks: vec![ContentBlock::new("heading", json!({"text": "Hi {{first_name}}"}))],
        };
        h.store.put_template(template.clone());
        let step = SequenceStep::new(
            h.sequence.id,
            None,
            1,
            "",
            StepContent::Template {
                template_id: template.id,
            },
        );
        h.store.put_step(step).unwrap();

        let mut data = RecipientData::new();
        data.insert("first_name".into(), json!("Ada"));
        let now = Utc::now();
        h.engine
            .enroll_at(h.sequence.id, "ada@example.com", data, now)
            .unwrap();
        h.engine.process_due(now).await.unwrap();

        let sent = h.outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ada@example.com");
        assert_eq!(sent[0].1, "Welcome, Ada");
        assert!(sent[0].2.contains("<h1>Hi Ada</h1>"));
        assert!(sent[0].2.contains("/t/open/"));
    }

    #[tokio::test]
    async fn missing_template_fails_only_that_enrollment() {
        let h = harness();
        let step = SequenceStep::new(
            h.sequence.id,
            None,
            1,
            "s",
            StepContent::Template {
                template_id: Uuid::new_v4(),
            },
        );
        h.store.put_step(step).unwrap();
        let other = Sequence::new("Healthy");
        h.store.put_sequence(other.clone());
        h.store
            .put_step(SequenceStep::new(other.id, None, 1, "ok", text("ok")))
            .unwrap();

        let now = Utc::now();
        let broken = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();
        let healthy = h
            .engine
            .enroll_at(other.id, "bob@example.com", RecipientData::new(), now)
            .unwrap();

        assert_eq!(h.engine.process_due(now).await.unwrap(), 1);
        let broken = h.engine.get_enrollment(broken).unwrap();
        assert_eq!(broken.current_step, 1);
        assert!(broken.claimed_until.is_none());
        assert_eq!(
            h.engine.get_enrollment(healthy).unwrap().status,
            EnrollmentStatus::Completed
        );
    }

    #[tokio::test]
    async fn send_failure_leaves_enrollment_due_and_counts_against_account() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        let now = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();

        h.outbox.failing.store(true, Ordering::SeqCst);
        assert_eq!(h.engine.process_due(now).await.unwrap(), 0);
        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.next_send_at, Some(now));
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(h.accounts.circuit_state("a").unwrap().failures, 1);

        h.outbox.failing.store(false, Ordering::SeqCst);
        assert_eq!(h.engine.process_due(now).await.unwrap(), 1);
        assert_eq!(h.accounts.circuit_state("a").unwrap().failures, 0);
    }

    #[tokio::test]
    async fn no_account_defers_without_touching_enrollment() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        h.accounts.set_enabled("a", false).unwrap();
        let now = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();

        assert_eq!(h.engine.process_due(now).await.unwrap(), 0);
        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.current_step, 1);
        assert!(e.claimed_until.is_none());
        assert!(h.outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn branch_without_steps_only_marks_switch() {
        let h = harness();
        let first = add_step(&h, None, 1, StepDelay::default());
        add_step(&h, None, 2, StepDelay::hours(1));
        h.store
            .put_branch(Branch::new(
                h.sequence.id,
                "empty",
                Some(first.id),
                BranchTrigger::NoEngagement { after_steps: 1 },
            ))
            .unwrap();

        let now = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();
        h.engine.process_due(now).await.unwrap();

        let e = h.engine.get_enrollment(id).unwrap();
        assert!(e.branch_switched_at.is_some());
        assert!(e.branch_id.is_none());
        assert_eq!(e.current_step, 2);
    }

    #[tokio::test]
    async fn default_branch_catches_end_of_main_path() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        h.store
            .put_branch(Branch::new(
                h.sequence.id,
                DEFAULT_BRANCH_ID,
                None,
                BranchTrigger::NoEngagement { after_steps: 1 },
            ))
            .unwrap();
        add_step(&h, Some(DEFAULT_BRANCH_ID), 1, StepDelay::days(2));

        let now = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();
        assert_eq!(h.engine.process_due(now).await.unwrap(), 1);

        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.branch_id.as_deref(), Some(DEFAULT_BRANCH_ID));
        assert_eq!(e.current_step, 1);
        assert_eq!(e.next_send_at, Some(now + Duration::days(2)));
        assert_eq!(e.status, EnrollmentStatus::Active);

        // Running off the default branch completes the enrollment.
        let later = now + Duration::days(2);
        h.engine.process_due(later).await.unwrap();
        let e = h.engine.get_enrollment(id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_send_at.is_none());
    }

    #[tokio::test]
    async fn click_on_removed_branch_is_spent_in_place() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        add_step(&h, None, 2, StepDelay::days(1));
        h.store
            .put_branch(Branch::new(
                h.sequence.id,
                "vip",
                None,
                BranchTrigger::ActionClick { button_id: None },
            ))
            .unwrap();

        let now = Utc::now();
        let id = h
            .engine
            .enroll_at(h.sequence.id, "ada@example.com", RecipientData::new(), now)
            .unwrap();
        assert!(h.engine.record_action_click_at(id, "vip", None, now).unwrap());
        assert!(h.store.remove_branch(h.sequence.id, "vip"));

        assert_eq!(h.engine.process_due(now).await.unwrap(), 1);
        let e = h.engine.get_enrollment(id).unwrap();
        assert!(e.branch_switched_at.is_some());
        assert!(e.branch_id.is_none());
        assert_eq!(e.current_step, 2);
        assert!(e.claimed_until.is_none());
        assert_eq!(h.outbox.sent.lock().unwrap().len(), 1);

        // The spent click no longer blocks later ticks.
        assert_eq!(h.engine.process_due(now + Duration::days(1)).await.unwrap(), 1);
        assert_eq!(
            h.engine.get_enrollment(id).unwrap().status,
            EnrollmentStatus::Completed
        );
    }

    #[tokio::test]
    async fn action_click_requires_known_branch() {
        let h = harness();
        add_step(&h, None, 1, StepDelay::default());
        let id = h
            .engine
            .enroll(h.sequence.id, "ada@example.com", RecipientData::new())
            .unwrap();
        assert!(matches!(
            h.engine.record_action_click(id, "ghost", None),
            Err(DripError::NotFound { .. })
        ));
    }
}
