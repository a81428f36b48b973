use serde::{Deserialize, Serialize};

use drip_core::{DripError, DripResult};

use crate::types::EnrollmentStatus;

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions. Completed and cancelled are terminal; failed has no
/// inbound transition in this engine.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub state: EnrollmentStatus,
    pub transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    pub fn new(state: EnrollmentStatus) -> Self {
        let transitions = vec![
            // Active ->
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Paused,
                trigger: "pause".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Cancelled,
                trigger: "cancel".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Completed,
                trigger: "path_exhausted".to_string(),
            },
            // Paused ->
            StateTransition {
                from: EnrollmentStatus::Paused,
                to: EnrollmentStatus::Active,
                trigger: "resume".to_string(),
            },
        ];

        Self { state, transitions }
    }

    pub fn can_transition(&self, from: &EnrollmentStatus, to: &EnrollmentStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`.
    pub fn transition(&mut self, to: EnrollmentStatus) -> DripResult<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(DripError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new(EnrollmentStatus::Active)
    }
}
