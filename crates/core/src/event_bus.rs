//! Engine event bus: trait for emitting enrollment lifecycle events.
//!
//! The engine accepts an `Arc<dyn EventSink>`; deployments route events to
//! their analytics pipeline or webhooks, tests capture them in memory.

use crate::types::{SequenceEvent, SequenceEventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SequenceEvent);
}

/// No-op sink for deployments that don't consume engine events.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: SequenceEvent) {}
}

/// Writes every event to the structured log under the `drip_events` target.
#[derive(Default)]
pub struct LogSink {
    emitted: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: SequenceEvent) {
        info!(
            target: "drip_events",
            event_id = %event.event_id,
            event_type = ?event.event_type,
            enrollment_id = %event.enrollment_id,
            sequence_id = %event.sequence_id,
            recipient = %event.recipient,
            step_order = ?event.step_order,
            branch_id = ?event.branch_id,
            account_id = ?event.account_id,
            detail = ?event.detail,
            "Sequence event"
        );
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<SequenceEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<SequenceEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: SequenceEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: SequenceEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for a `SequenceEvent` with only the identifying fields set.
pub fn make_event(
    event_type: SequenceEventType,
    enrollment_id: Uuid,
    sequence_id: Uuid,
    recipient: impl Into<String>,
) -> SequenceEvent {
    SequenceEvent {
        event_id: Uuid::new_v4(),
        event_type,
        enrollment_id,
        sequence_id,
        recipient: recipient.into(),
        step_order: None,
        branch_id: None,
        account_id: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn log_sink() -> Arc<LogSink> {
    Arc::new(LogSink::new())
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
