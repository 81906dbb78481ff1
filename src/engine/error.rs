use ulid::Ulid;

use crate::lifecycle::AppointmentEvent;
use crate::model::{AppointmentState, Ms, Span};
use crate::policy::LeadTimeViolation;

#[derive(Debug)]
pub enum EngineError {
    /// A location or consultation type is not owned by the professional.
    OwnershipMismatch {
        entity: &'static str,
        id: Ulid,
        professional_id: Ulid,
    },
    LeadTimeViolation(LeadTimeViolation),
    DurationMismatch {
        expected: Ms,
        actual: Ms,
    },
    /// Carries the obstacle's span (buffer-expanded for appointments).
    SlotConflict {
        conflicting: Span,
    },
    OutsideAvailability(Span),
    InvalidTransition {
        from: AppointmentState,
        event: AppointmentEvent,
        reason: &'static str,
    },
    CancellationWindowViolation {
        min_lead: Ms,
        remaining: Ms,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Still referenced by at least one appointment.
    InUse(Ulid),
    InvalidInput(String),
    LimitExceeded(&'static str),
    /// The durable commit failed after all retries; nothing was applied.
    Unavailable(String),
}

impl EngineError {
    /// Stable machine-readable kind, used on the wire and as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::OwnershipMismatch { .. } => "ownership_mismatch",
            EngineError::LeadTimeViolation(_) => "lead_time_violation",
            EngineError::DurationMismatch { .. } => "duration_mismatch",
            EngineError::SlotConflict { .. } => "slot_conflict",
            EngineError::OutsideAvailability(_) => "outside_availability",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::CancellationWindowViolation { .. } => "cancellation_window_violation",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InUse(_) => "in_use",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Unavailable(_) => "unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::OwnershipMismatch {
                entity,
                id,
                professional_id,
            } => write!(f, "{entity} {id} does not belong to professional {professional_id}"),
            EngineError::LeadTimeViolation(v) => write!(f, "lead time violation: {v}"),
            EngineError::DurationMismatch { expected, actual } => write!(
                f,
                "duration {}s does not match consultation type duration {}s",
                actual / 1000,
                expected / 1000
            ),
            EngineError::SlotConflict { conflicting } => write!(
                f,
                "slot conflicts with [{}, {})",
                conflicting.start, conflicting.end
            ),
            EngineError::OutsideAvailability(span) => write!(
                f,
                "[{}, {}) is outside the weekly availability",
                span.start, span.end
            ),
            EngineError::InvalidTransition {
                from,
                event,
                reason,
            } => write!(
                f,
                "cannot {} appointment in state {}: {reason}",
                event.as_str(),
                from.as_str()
            ),
            EngineError::CancellationWindowViolation { min_lead, remaining } => write!(
                f,
                "cancellation requires {}s notice, only {}s remain",
                min_lead / 1000,
                remaining / 1000
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InUse(id) => write!(f, "{id} is referenced by appointments"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
