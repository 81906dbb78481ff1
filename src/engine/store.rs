use std::collections::HashMap;

use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::{MAX_APPOINTMENT_DURATION_MS, MAX_BLOCK_DURATION_MS, MAX_BUFFER_MS};
use crate::model::*;

/// Reference data owned by one professional. Guarded by its own lock, always
/// taken before any of the professional's calendar locks.
pub struct ProfessionalState {
    pub id: Ulid,
    pub name: String,
    pub policy: ProfessionalPolicy,
    pub locations: HashMap<Ulid, Location>,
    pub consultation_types: HashMap<Ulid, ConsultationType>,
}

impl ProfessionalState {
    pub fn new(id: Ulid, name: String, policy: ProfessionalPolicy) -> Self {
        Self {
            id,
            name,
            policy,
            locations: HashMap::new(),
            consultation_types: HashMap::new(),
        }
    }

    pub fn location_keys(&self) -> Vec<CalendarKey> {
        let mut keys: Vec<CalendarKey> = self
            .locations
            .keys()
            .map(|location_id| CalendarKey {
                professional_id: self.id,
                location_id: *location_id,
            })
            .collect();
        keys.sort();
        keys
    }
}

/// One (professional, location) calendar. Everything the no-overlap check
/// needs lives behind a single lock.
pub struct CalendarState {
    pub key: CalendarKey,
    pub tz: Tz,
    pub rules: Vec<WeeklyRule>,
    /// Sorted by `span.start`.
    pub blocks: Vec<Block>,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl CalendarState {
    pub fn new(key: CalendarKey, tz: Tz) -> Self {
        Self {
            key,
            tz,
            rules: Vec::new(),
            blocks: Vec::new(),
            appointments: Vec::new(),
        }
    }

    pub fn upsert_rule(&mut self, rule: WeeklyRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<WeeklyRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Insert keeping sort order; replaces a block with the same id.
    pub fn upsert_block(&mut self, block: Block) {
        self.remove_block(block.id);
        let pos = self.blocks.partition_point(|b| b.span.start <= block.span.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<Block> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Index of an appointment, found through its (immutable) start.
    fn appointment_pos(&self, id: Ulid, start: Ms) -> Option<usize> {
        let from = self.appointments.partition_point(|a| a.span.start < start);
        self.appointments[from..]
            .iter()
            .take_while(|a| a.span.start == start)
            .position(|a| a.id == id)
            .map(|offset| from + offset)
    }

    pub fn find_appointment(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Insert, or replace in place when the id is already present.
    pub fn upsert_appointment(&mut self, appointment: Appointment) {
        if let Some(pos) = self.appointment_pos(appointment.id, appointment.span.start) {
            self.appointments[pos] = appointment;
            return;
        }
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    /// Blocks whose raw span overlaps `query`.
    pub fn blocks_overlapping(&self, query: &Span) -> impl Iterator<Item = &Block> {
        let lo = self
            .blocks
            .partition_point(|b| b.span.start <= query.start - MAX_BLOCK_DURATION_MS);
        let hi = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[lo..hi.max(lo)]
            .iter()
            .filter(move |b| b.span.overlaps(query))
    }

    /// Appointments (any state) whose buffer-expanded span overlaps `query`.
    /// Bounds the scan with the largest possible duration and buffer.
    pub fn appointments_overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let reach = MAX_APPOINTMENT_DURATION_MS + 2 * MAX_BUFFER_MS;
        let lo = self
            .appointments
            .partition_point(|a| a.span.start <= query.start - reach);
        let hi = self
            .appointments
            .partition_point(|a| a.span.start < query.end + MAX_BUFFER_MS);
        self.appointments[lo..hi.max(lo)]
            .iter()
            .filter(move |a| a.effective_span().overlaps(query))
    }

    pub fn references(&self, consultation_type_id: Ulid) -> bool {
        self.appointments
            .iter()
            .any(|a| a.consultation_type_id == consultation_type_id)
    }
}
