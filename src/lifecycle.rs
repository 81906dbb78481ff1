//! Appointment state machine.
//!
//! `plan_transition` only decides; the engine applies the plan under the
//! calendar write lock so the re-validation and the state change are atomic.

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::model::*;
use crate::policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentEvent {
    /// Verify a TENTATIVE hold (public link or professional approval).
    Approve,
    /// Patient confirmation of a RESERVED appointment.
    Confirm,
    Cancel,
    MarkAttended,
    MarkNoShow,
}

impl AppointmentEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentEvent::Approve => "approve",
            AppointmentEvent::Confirm => "confirm",
            AppointmentEvent::Cancel => "cancel",
            AppointmentEvent::MarkAttended => "mark_attended",
            AppointmentEvent::MarkNoShow => "mark_no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub to: AppointmentState,
    /// Re-run the overlap check against firm appointments before committing.
    pub revalidate: bool,
    /// The appointment stops occupying its slot.
    pub frees_slot: bool,
}

impl TransitionPlan {
    fn to(to: AppointmentState) -> Self {
        Self {
            to,
            revalidate: false,
            frees_slot: false,
        }
    }
}

pub fn plan_transition(
    appointment: &Appointment,
    event: AppointmentEvent,
    actor: ActorRole,
    policy: &ProfessionalPolicy,
    now: Ms,
) -> Result<TransitionPlan, EngineError> {
    use AppointmentEvent as E;
    use AppointmentState as S;

    let from = appointment.state;
    let reject = |reason: &'static str| EngineError::InvalidTransition {
        from,
        event,
        reason,
    };

    if from.is_terminal() {
        return Err(reject("state is terminal"));
    }
    if appointment.hold_expired(now) {
        return Err(reject("soft hold has expired"));
    }

    match (from, event) {
        (S::Tentative, E::Approve) => Ok(TransitionPlan {
            to: S::Confirmed,
            revalidate: true,
            frees_slot: false,
        }),
        (S::Reserved, E::Confirm) => Ok(TransitionPlan::to(S::Confirmed)),
        (S::Tentative, E::Cancel) => Ok(TransitionPlan {
            to: S::Cancelled,
            revalidate: false,
            frees_slot: true,
        }),
        (S::Reserved | S::Confirmed, E::Cancel) => {
            if actor == ActorRole::Patient && !policy::can_cancel(policy, appointment, now) {
                return Err(EngineError::CancellationWindowViolation {
                    min_lead: policy.min_reschedule_lead_time,
                    remaining: appointment.span.start - now,
                });
            }
            Ok(TransitionPlan {
                to: S::Cancelled,
                revalidate: false,
                frees_slot: true,
            })
        }
        (S::Confirmed, E::MarkAttended | E::MarkNoShow) => {
            if actor == ActorRole::Patient {
                return Err(reject("only the practice can record attendance"));
            }
            if now < appointment.span.start {
                return Err(reject("appointment has not started"));
            }
            let to = if event == E::MarkAttended {
                S::Attended
            } else {
                S::NoShow
            };
            Ok(TransitionPlan::to(to))
        }
        _ => Err(reject("transition not allowed")),
    }
}
