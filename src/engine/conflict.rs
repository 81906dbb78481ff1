use chrono::TimeZone;

use crate::limits::*;
use crate::model::*;

use super::availability::{local_window, weekday_index};
use super::store::CalendarState;
use super::EngineError;

pub(crate) fn validate_span(span: &Span, max_duration: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("span end must be after start".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > max_duration {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Which appointments count as obstacles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Obstacles {
    /// Every occupying appointment, live soft holds included.
    Occupying,
    /// RESERVED, CONFIRMED and ATTENDED only.
    FirmOnly,
}

/// `candidate` is already buffer-expanded. Blocks count raw; appointments
/// count with their own stored buffers.
pub(crate) fn check_no_conflict(
    cal: &CalendarState,
    candidate: &Span,
    now: Ms,
    exclude: Option<ulid::Ulid>,
    obstacles: Obstacles,
) -> Result<(), EngineError> {
    if let Some(block) = cal.blocks_overlapping(candidate).next() {
        return Err(EngineError::SlotConflict {
            conflicting: block.span,
        });
    }
    for appt in cal.appointments_overlapping(candidate) {
        if Some(appt.id) == exclude {
            continue;
        }
        let counts = match obstacles {
            Obstacles::Occupying => appt.is_occupying(now),
            Obstacles::FirmOnly => appt.is_firm(),
        };
        if counts {
            return Err(EngineError::SlotConflict {
                conflicting: appt.effective_span(),
            });
        }
    }
    Ok(())
}

/// The raw span must sit inside one rule window of its local weekday.
pub(crate) fn within_weekly_rules(cal: &CalendarState, span: &Span) -> bool {
    let Some(local_start) = cal.tz.timestamp_millis_opt(span.start).single() else {
        return false;
    };
    let day = local_start.date_naive();
    let weekday = weekday_index(day);
    cal.rules
        .iter()
        .filter(|r| r.weekday == weekday)
        .filter_map(|r| local_window(&cal.tz, day, r))
        .any(|window| window.contains_span(span))
}
