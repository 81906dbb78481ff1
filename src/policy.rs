//! Stateless policy checks over a professional's configuration.
//!
//! Nothing here reads the clock or touches state: callers pass `now` and the
//! record being judged, which keeps every rule trivially unit-testable.

use serde::Serialize;

use crate::model::*;

/// Which lead-time bound a candidate start violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadTimeViolation {
    TooSoon { min_lead_time: Ms, lead: Ms },
    TooFar { max_lead_time: Ms, lead: Ms },
}

impl std::fmt::Display for LeadTimeViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadTimeViolation::TooSoon { min_lead_time, lead } => write!(
                f,
                "start is {}s away, minimum lead time is {}s",
                lead / 1000,
                min_lead_time / 1000
            ),
            LeadTimeViolation::TooFar { max_lead_time, lead } => write!(
                f,
                "start is {}s away, maximum lead time is {}s",
                lead / 1000,
                max_lead_time / 1000
            ),
        }
    }
}

/// `min_lead_time <= start - now <= max_lead_time`; the upper bound is skipped when unset.
pub fn lead_time_ok(
    policy: &ProfessionalPolicy,
    candidate_start: Ms,
    now: Ms,
) -> Result<(), LeadTimeViolation> {
    let lead = candidate_start - now;
    if lead < policy.min_lead_time {
        return Err(LeadTimeViolation::TooSoon {
            min_lead_time: policy.min_lead_time,
            lead,
        });
    }
    if let Some(max) = policy.max_lead_time
        && lead > max
    {
        return Err(LeadTimeViolation::TooFar {
            max_lead_time: max,
            lead,
        });
    }
    Ok(())
}

/// Patient-initiated cancellation is allowed while the start is at least
/// `min_reschedule_lead_time` away. Professionals and admins bypass this.
pub fn can_cancel(policy: &ProfessionalPolicy, appointment: &Appointment, now: Ms) -> bool {
    appointment.span.start - now >= policy.min_reschedule_lead_time
}

pub fn cancellation_is_free(
    policy: &ProfessionalPolicy,
    appointment: &Appointment,
    now: Ms,
) -> bool {
    appointment.span.start - now >= policy.free_cancel_lead_time
}

/// Fee in minor currency units. Percent fees round half up; no price means no fee.
pub fn no_show_fee(policy: &ProfessionalPolicy, price_cents: Option<u64>) -> u64 {
    match policy.no_show_fee {
        NoShowFee::None => 0,
        NoShowFee::Flat { amount_cents } => amount_cents,
        NoShowFee::Percent { basis_points } => {
            let Some(price) = price_cents else { return 0 };
            let scaled = price as u128 * basis_points as u128;
            let fee = (scaled + 5_000) / 10_000;
            u64::try_from(fee).unwrap_or(u64::MAX)
        }
    }
}
