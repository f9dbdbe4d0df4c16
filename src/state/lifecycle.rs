//! Session lifecycle: `waiting → countdown → active → finished`.
//!
//! Transitions are computed as a [`TransitionPlan`] first; an invalid move is rejected before
//! anything is written. The caller then performs the plan's side effects (stamping player start
//! or end times) and applies the plan to the session row. A failed stamp is logged and does not
//! block the status change.

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::dao::models::{SessionEntity, SessionStatus};

/// Reason a requested status change is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The session is already in the requested status.
    #[error("session is already {0:?}")]
    Unchanged(SessionStatus),
    /// The requested status lies behind the current one.
    #[error("cannot move from {from:?} back to {to:?}")]
    Backward {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },
    /// Finished sessions never change status again.
    #[error("session is finished")]
    Terminal,
    /// A countdown needs a configured duration.
    #[error("countdown requested but the session has no countdown duration")]
    MissingCountdown,
}

/// Store work required by a transition before it may be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Record the countdown start and its length.
    StartCountdown {
        /// Countdown length taken from the session settings.
        duration: Duration,
    },
    /// Stamp `started_at` on every player.
    StartPlay,
    /// Flush pending scores, reconcile the roster and stamp `ended_at`.
    Finish,
}

/// Validated status change waiting for its effects to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    /// Status the plan was computed from.
    pub from: SessionStatus,
    /// Target status.
    pub to: SessionStatus,
    /// Work to perform before applying.
    pub effect: TransitionEffect,
}

/// Validate moving `session` to `to`.
pub fn plan_transition(
    session: &SessionEntity,
    to: SessionStatus,
) -> Result<TransitionPlan, TransitionError> {
    let from = session.status;
    if from == SessionStatus::Finished {
        return Err(TransitionError::Terminal);
    }
    if from == to {
        return Err(TransitionError::Unchanged(to));
    }
    if to.rank() < from.rank() {
        return Err(TransitionError::Backward { from, to });
    }

    let effect = match to {
        SessionStatus::Waiting => return Err(TransitionError::Backward { from, to }),
        SessionStatus::Countdown => TransitionEffect::StartCountdown {
            duration: session
                .countdown_duration()
                .ok_or(TransitionError::MissingCountdown)?,
        },
        SessionStatus::Active => TransitionEffect::StartPlay,
        SessionStatus::Finished => TransitionEffect::Finish,
    };

    Ok(TransitionPlan { from, to, effect })
}

impl TransitionPlan {
    /// Write the new status and its timestamps into `session`.
    pub fn apply(&self, session: &mut SessionEntity, at: SystemTime) {
        session.status = self.to;
        session.updated_at = at;
        match self.effect {
            TransitionEffect::StartCountdown { duration } => {
                session.countdown_started_at = Some(at);
                session.countdown_duration_ms =
                    Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
            }
            TransitionEffect::StartPlay => {
                session.started_at.get_or_insert(at);
            }
            TransitionEffect::Finish => {
                session.ended_at.get_or_insert(at);
            }
        }
    }
}
