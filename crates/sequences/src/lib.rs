#![warn(clippy::unwrap_used)]

//! Drip sequence automation: enrollments advancing through timed email
//! steps, rerouted onto branches by engagement triggers, with dispatch gated
//! by per-account circuit breakers.

pub mod content;
pub mod demo;
pub mod engine;
pub mod evaluator;
pub mod schedule;
pub mod state_machine;
pub mod store;
pub mod tracking;
pub mod types;

pub use engine::{EngineSettings, SequenceEngine, StepOutcome};
pub use evaluator::BranchTriggerEvaluator;
pub use store::{EnrollmentStore, InMemorySequenceStore};
