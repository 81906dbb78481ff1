use std::time::Instant;

use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{compute_slots, merge_overlapping, CalendarSnapshot, SlotParams};
use super::{Engine, EngineError};

/// UTC instant of local midnight can sit up to 14h either side of UTC
/// midnight; two days of slack covers every zone.
fn utc_window(from: NaiveDate, to: NaiveDate) -> Span {
    let midnight = |d: NaiveDate| d.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    let end_day = to.checked_add_days(Days::new(1)).unwrap_or(to);
    Span::new(midnight(from) - 2 * DAY_MS, midnight(end_day) + 2 * DAY_MS)
}

impl Engine {
    /// Availability Calculator over live state. Reads a snapshot under
    /// short read locks, then computes without holding any.
    pub async fn get_slots(&self, query: SlotQuery) -> Result<Vec<Slot>, EngineError> {
        let started = Instant::now();
        if query.date_to < query.date_from {
            return Err(EngineError::InvalidInput("date_to is before date_from".into()));
        }
        if (query.date_to - query.date_from).num_days() + 1 > MAX_SLOT_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("slot query spans more than 31 days"));
        }
        if query
            .duration
            .is_some_and(|d| d <= 0 || d > MAX_APPOINTMENT_DURATION_MS)
        {
            return Err(EngineError::InvalidInput("duration out of range".into()));
        }

        let ps_arc = self.require_professional(query.professional_id)?;
        let (params, keys) = {
            let ps = ps_arc.read().await;
            let ct = match query.consultation_type_id {
                Some(id) => Some(ps.consultation_types.get(&id).cloned().ok_or(
                    EngineError::OwnershipMismatch {
                        entity: "consultation type",
                        id,
                        professional_id: ps.id,
                    },
                )?),
                None => None,
            };
            let keys = match query.location_id {
                Some(location_id) => {
                    self.require_owned_location(&ps, location_id)?;
                    vec![CalendarKey {
                        professional_id: ps.id,
                        location_id,
                    }]
                }
                None => ps.location_keys(),
            };
            let buffers = ct
                .as_ref()
                .map_or(ps.policy.default_buffers(), |c| c.buffers(&ps.policy));
            let params = SlotParams {
                date_from: query.date_from,
                date_to: query.date_to,
                duration: ct.as_ref().map(|c| c.duration).or(query.duration),
                buffers,
            };
            (params, keys)
        };

        let now = self.now();
        let window = utc_window(query.date_from, query.date_to);
        let mut snapshots = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(cal_arc) = self.calendar(&key) else {
                continue;
            };
            let cal = cal_arc.read().await;
            let mut obstacles: Vec<Span> = cal.blocks_overlapping(&window).map(|b| b.span).collect();
            obstacles.extend(
                cal.appointments_overlapping(&window)
                    .filter(|a| a.is_occupying(now))
                    .map(|a| a.effective_span()),
            );
            obstacles.sort_by_key(|s| s.start);
            snapshots.push(CalendarSnapshot {
                location_id: key.location_id,
                tz: cal.tz,
                rules: cal.rules.clone(),
                obstacles: merge_overlapping(&obstacles),
            });
        }

        let slots = compute_slots(&snapshots, &params, now);
        metrics::histogram!(observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(slots)
    }

    /// The stored record, including a TENTATIVE row whose hold has lapsed.
    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let key = self.calendar_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let cal_arc = self.require_calendar(&key)?;
        let cal = cal_arc.read().await;
        cal.find_appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Appointments ordered by start. Lapsed soft holds are treated as absent.
    pub async fn list_appointments(
        &self,
        professional_id: Ulid,
        location_id: Option<Ulid>,
        window: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let ps_arc = self.require_professional(professional_id)?;
        let keys = {
            let ps = ps_arc.read().await;
            match location_id {
                Some(lid) => {
                    self.require_owned_location(&ps, lid)?;
                    vec![CalendarKey {
                        professional_id,
                        location_id: lid,
                    }]
                }
                None => ps.location_keys(),
            }
        };
        let now = self.now();
        let mut out = Vec::new();
        for key in keys {
            let Some(cal_arc) = self.calendar(&key) else {
                continue;
            };
            let cal = cal_arc.read().await;
            out.extend(
                cal.appointments
                    .iter()
                    .filter(|a| !a.hold_expired(now))
                    .filter(|a| window.is_none_or(|w| a.span.overlaps(&w)))
                    .cloned(),
            );
        }
        out.sort_by_key(|a| (a.span.start, a.id));
        Ok(out)
    }

    /// TENTATIVE rows whose hold lapsed at least `retention` ago.
    /// Skips calendars that are busy; the reaper will see them next round.
    pub fn collect_expired_holds(&self, now: Ms, retention: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.calendars.iter() {
            let Ok(cal) = entry.value().try_read() else {
                continue;
            };
            expired.extend(
                cal.appointments
                    .iter()
                    .filter(|a| a.state == AppointmentState::Tentative)
                    .filter(|a| a.soft_hold_expires_at.is_none_or(|exp| exp <= now - retention))
                    .map(|a| a.id),
            );
        }
        expired
    }
}
