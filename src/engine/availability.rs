use chrono::{Datelike, LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

/// Everything slot generation needs from one calendar, copied out under a
/// read lock so the computation never holds a guard.
#[derive(Debug, Clone)]
pub struct CalendarSnapshot {
    pub location_id: Ulid,
    pub tz: Tz,
    pub rules: Vec<WeeklyRule>,
    /// Sorted, merged. Blocks raw; appointments expanded by their own buffers.
    pub obstacles: Vec<Span>,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotParams {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    /// `None` falls back to each rule's slot granularity.
    pub duration: Option<Ms>,
    pub buffers: Buffers,
}

/// Local wall-clock instant to UTC millis. DST gaps yield `None`; a DST
/// fold resolves to the earlier instant.
pub fn to_instant(tz: &Tz, local: NaiveDateTime) -> Option<Ms> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.timestamp_millis()),
        LocalResult::Ambiguous(a, b) => Some(a.timestamp_millis().min(b.timestamp_millis())),
        LocalResult::None => None,
    }
}

/// The UTC span a weekly rule covers on `day`, if both ends exist locally.
pub fn local_window(tz: &Tz, day: NaiveDate, rule: &WeeklyRule) -> Option<Span> {
    let start = to_instant(tz, day.and_time(rule.start))?;
    let end = to_instant(tz, day.and_time(rule.end))?;
    (start < end).then(|| Span::new(start, end))
}

pub fn weekday_index(day: NaiveDate) -> u8 {
    day.weekday().num_days_from_monday() as u8
}

pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Binary search over sorted, merged obstacles.
fn hits_obstacle(obstacles: &[Span], candidate: &Span) -> bool {
    let idx = obstacles.partition_point(|o| o.end <= candidate.start);
    obstacles
        .get(idx)
        .is_some_and(|o| o.start < candidate.end)
}

/// Walk one availability window, emitting buffer-free slots whose
/// buffer-expanded span stays inside the window and clear of obstacles.
fn walk_window(
    window: Span,
    duration: Ms,
    buffers: Buffers,
    obstacles: &[Span],
    now: Ms,
    out: &mut Vec<Slot>,
) {
    let step = buffers.before + duration + buffers.after;
    if duration <= 0 || step <= 0 {
        return;
    }
    let mut t = window.start + buffers.before;
    while t + duration + buffers.after <= window.end {
        let candidate = Span::new(t, t + duration);
        if t > now && !hits_obstacle(obstacles, &candidate.expand(buffers.before, buffers.after)) {
            out.push(Slot {
                start: candidate.start,
                end: candidate.end,
            });
        }
        t += step;
    }
}

/// Candidate slots across calendars and days. Pure: same inputs, same output.
pub fn compute_slots(calendars: &[CalendarSnapshot], params: &SlotParams, now: Ms) -> Vec<Slot> {
    let mut slots = Vec::new();
    for cal in calendars {
        for day in params
            .date_from
            .iter_days()
            .take_while(|d| *d <= params.date_to)
        {
            let weekday = weekday_index(day);
            for rule in cal.rules.iter().filter(|r| r.weekday == weekday) {
                let Some(window) = local_window(&cal.tz, day, rule) else {
                    continue;
                };
                let duration = params.duration.unwrap_or(rule.slot_granularity);
                walk_window(window, duration, params.buffers, &cal.obstacles, now, &mut slots);
            }
        }
    }
    slots.sort_by_key(|s| (s.start, s.end));
    slots.dedup_by_key(|s| s.start);
    slots
}
