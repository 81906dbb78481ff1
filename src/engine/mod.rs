mod availability;
mod booking;
mod conflict;
mod error;
mod mutations;
mod outbox;
mod queries;
mod store;
#[cfg(test)]
mod tests;
mod waitlist;

pub use availability::{compute_slots, merge_overlapping, to_instant, CalendarSnapshot, SlotParams};
pub use error::EngineError;
pub use store::{CalendarState, ProfessionalState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::{COMMIT_RETRIES, COMMIT_RETRY_BACKOFF_MS};
use crate::model::*;
use crate::notify::{FeedItem, NotifyHub};
use crate::wal::Wal;

pub type SharedProfessional = Arc<RwLock<ProfessionalState>>;
pub type SharedCalendar = Arc<RwLock<CalendarState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is queued, fsync once, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) professionals: DashMap<Ulid, SharedProfessional>,
    pub(super) calendars: DashMap<CalendarKey, SharedCalendar>,
    /// Reverse lookup: rule/block/appointment id → calendar.
    pub(super) entity_to_calendar: DashMap<Ulid, CalendarKey>,
    pub(super) waitlist: DashMap<Ulid, WaitlistEntry>,
    pub(super) offers: DashMap<Ulid, WaitlistOffer>,
    /// Unsent notifications. Sent ones are dropped.
    pub(super) outbox: DashMap<Ulid, NotificationLog>,
    /// Mutations hold it shared for their whole critical section; compaction
    /// takes it exclusively so its snapshot matches the log position.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
}

pub(super) fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

/// Apply an event to a professional record (caller holds the lock).
fn apply_to_professional(ps: &mut ProfessionalState, event: &Event) {
    match event {
        Event::PolicyUpdated { policy, .. } => ps.policy = policy.clone(),
        Event::LocationAdded { location } => {
            ps.locations.insert(location.id, location.clone());
        }
        Event::LocationRemoved { id, .. } => {
            ps.locations.remove(id);
        }
        Event::ConsultationTypeAdded { consultation_type } => {
            ps.consultation_types
                .insert(consultation_type.id, consultation_type.clone());
        }
        Event::ConsultationTypeRemoved { id, .. } => {
            ps.consultation_types.remove(id);
        }
        _ => {}
    }
}

/// Apply an event to a calendar (caller holds the lock).
fn apply_to_calendar(cal: &mut CalendarState, event: &Event) {
    match event {
        Event::RuleAdded { rule } => cal.upsert_rule(rule.clone()),
        Event::RuleRemoved { id, .. } => {
            cal.remove_rule(*id);
        }
        Event::BlockAdded { block } => cal.upsert_block(block.clone()),
        Event::BlockRemoved { id, .. } => {
            cal.remove_block(*id);
        }
        Event::AppointmentCreated { appointment, .. }
        | Event::AppointmentTransitioned { appointment, .. }
        | Event::OfferCreated {
            hold: Some(appointment),
            ..
        }
        | Event::OfferAccepted { appointment, .. }
        | Event::OfferDeclined {
            released: appointment,
            ..
        } => {
            cal.upsert_appointment(appointment.clone());
        }
        Event::AppointmentPurged { id, .. } => {
            cal.remove_appointment(*id);
        }
        _ => {}
    }
}

/// Professional whose change feed receives the event.
fn event_professional(event: &Event) -> Option<Ulid> {
    match event {
        Event::ProfessionalRegistered { id, .. }
        | Event::PolicyUpdated { id, .. }
        | Event::ProfessionalRemoved { id } => Some(*id),
        Event::LocationAdded { location } => Some(location.professional_id),
        Event::ConsultationTypeAdded { consultation_type } => Some(consultation_type.professional_id),
        Event::LocationRemoved { professional_id, .. }
        | Event::ConsultationTypeRemoved { professional_id, .. }
        | Event::WaitlistLeft { professional_id, .. } => Some(*professional_id),
        Event::RuleAdded { rule } => Some(rule.professional_id),
        Event::BlockAdded { block } => Some(block.professional_id),
        Event::RuleRemoved { key, .. }
        | Event::BlockRemoved { key, .. }
        | Event::AppointmentPurged { key, .. } => Some(key.professional_id),
        Event::AppointmentCreated { appointment, .. }
        | Event::AppointmentTransitioned { appointment, .. }
        | Event::OfferAccepted { appointment, .. }
        | Event::OfferDeclined {
            released: appointment,
            ..
        } => Some(appointment.professional_id),
        Event::WaitlistJoined { entry } => Some(entry.professional_id),
        Event::OfferCreated { offer, .. } => Some(offer.professional_id),
        Event::NotificationsQueued { .. } | Event::NotificationSent { .. } => None,
    }
}

fn event_calendar(event: &Event) -> Option<CalendarKey> {
    match event {
        Event::RuleAdded { rule } => Some(rule.key()),
        Event::BlockAdded { block } => Some(block.key()),
        Event::RuleRemoved { key, .. }
        | Event::BlockRemoved { key, .. }
        | Event::AppointmentPurged { key, .. } => Some(*key),
        Event::AppointmentCreated { appointment, .. }
        | Event::AppointmentTransitioned { appointment, .. }
        | Event::OfferCreated {
            hold: Some(appointment),
            ..
        }
        | Event::OfferAccepted { appointment, .. }
        | Event::OfferDeclined {
            released: appointment,
            ..
        } => Some(appointment.key()),
        _ => None,
    }
}

fn queue_notifications(outbox: &DashMap<Ulid, NotificationLog>, notifications: &[NotificationLog]) {
    for n in notifications {
        if n.sent_at.is_none() {
            outbox.insert(n.id, n.clone());
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            professionals: DashMap::new(),
            calendars: DashMap::new(),
            entity_to_calendar: DashMap::new(),
            waitlist: DashMap::new(),
            offers: DashMap::new(),
            outbox: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
            clock,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // Never block here: this may run inside an async context.
        for event in &events {
            if let Some(pid) = event_professional(event)
                && let Some(ps) = engine.professional(&pid)
                && let Ok(mut guard) = ps.try_write()
            {
                apply_to_professional(&mut guard, event);
            }
            if let Some(key) = event_calendar(event)
                && let Some(cal) = engine.calendar(&key)
                && let Ok(mut guard) = cal.try_write()
            {
                apply_to_calendar(&mut guard, event);
            }
            engine.apply_indexes(event);
        }

        if !events.is_empty() {
            tracing::info!(
                events = events.len(),
                professionals = engine.professionals.len(),
                calendars = engine.calendars.len(),
                "state rebuilt from WAL"
            );
        }
        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn professional(&self, id: &Ulid) -> Option<SharedProfessional> {
        self.professionals.get(id).map(|e| e.value().clone())
    }

    pub fn calendar(&self, key: &CalendarKey) -> Option<SharedCalendar> {
        self.calendars.get(key).map(|e| e.value().clone())
    }

    pub(super) fn calendar_for_entity(&self, entity_id: &Ulid) -> Option<CalendarKey> {
        self.entity_to_calendar.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn require_professional(&self, id: Ulid) -> Result<SharedProfessional, EngineError> {
        self.professional(&id).ok_or(EngineError::NotFound(id))
    }

    pub(super) fn require_calendar(&self, key: &CalendarKey) -> Result<SharedCalendar, EngineError> {
        self.calendar(key).ok_or(EngineError::NotFound(key.location_id))
    }

    /// Global indexes and the maps keyed outside any professional/calendar lock.
    fn apply_indexes(&self, event: &Event) {
        match event {
            Event::ProfessionalRegistered { id, name, policy } => {
                self.professionals.entry(*id).or_insert_with(|| {
                    Arc::new(RwLock::new(ProfessionalState::new(*id, name.clone(), policy.clone())))
                });
            }
            Event::ProfessionalRemoved { id } => {
                self.professionals.remove(id);
                self.calendars.retain(|k, _| k.professional_id != *id);
                self.entity_to_calendar.retain(|_, k| k.professional_id != *id);
                self.waitlist.retain(|_, e| e.professional_id != *id);
                self.offers.retain(|_, o| o.professional_id != *id);
            }
            Event::LocationAdded { location } => {
                let key = CalendarKey {
                    professional_id: location.professional_id,
                    location_id: location.id,
                };
                let tz = parse_timezone(&location.timezone).unwrap_or(Tz::UTC);
                self.calendars
                    .entry(key)
                    .or_insert_with(|| Arc::new(RwLock::new(CalendarState::new(key, tz))));
            }
            Event::LocationRemoved { professional_id, id } => {
                let key = CalendarKey {
                    professional_id: *professional_id,
                    location_id: *id,
                };
                self.calendars.remove(&key);
                self.entity_to_calendar.retain(|_, k| *k != key);
            }
            Event::RuleAdded { rule } => {
                self.entity_to_calendar.insert(rule.id, rule.key());
            }
            Event::BlockAdded { block } => {
                self.entity_to_calendar.insert(block.id, block.key());
            }
            Event::RuleRemoved { id, .. }
            | Event::BlockRemoved { id, .. }
            | Event::AppointmentPurged { id, .. } => {
                self.entity_to_calendar.remove(id);
            }
            Event::AppointmentCreated {
                appointment,
                notifications,
            } => {
                self.entity_to_calendar.insert(appointment.id, appointment.key());
                queue_notifications(&self.outbox, notifications);
            }
            Event::AppointmentTransitioned { notifications, .. }
            | Event::NotificationsQueued { notifications } => {
                queue_notifications(&self.outbox, notifications);
            }
            Event::WaitlistJoined { entry } => {
                self.waitlist.insert(entry.id, entry.clone());
            }
            Event::WaitlistLeft { id, .. } => {
                self.waitlist.remove(id);
            }
            Event::OfferCreated {
                offer,
                hold,
                notifications,
            } => {
                if let Some(hold) = hold {
                    self.entity_to_calendar.insert(hold.id, hold.key());
                }
                self.offers.insert(offer.id, offer.clone());
                queue_notifications(&self.outbox, notifications);
            }
            Event::OfferAccepted {
                id,
                appointment,
                notifications,
            } => {
                if let Some(mut offer) = self.offers.get_mut(id) {
                    offer.resolution = Some(OfferResolution::Accepted {
                        at: appointment.updated_at,
                        appointment_id: appointment.id,
                    });
                }
                queue_notifications(&self.outbox, notifications);
            }
            Event::OfferDeclined { id, at, .. } => {
                if let Some(mut offer) = self.offers.get_mut(id) {
                    offer.resolution = Some(OfferResolution::Declined { at: *at });
                }
            }
            Event::NotificationSent { id, .. } => {
                self.outbox.remove(id);
            }
            Event::PolicyUpdated { .. }
            | Event::ConsultationTypeAdded { .. }
            | Event::ConsultationTypeRemoved { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| "WAL writer shut down".to_string())?;
        rx.await
            .map_err(|_| "WAL writer dropped response".to_string())?
            .map_err(|e| e.to_string())
    }

    /// Durable append with bounded retries. On failure nothing may be applied.
    async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.wal_append(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < COMMIT_RETRIES => {
                    warn!(attempt, error = %e, "WAL append failed, retrying");
                    metrics::counter!(crate::observability::COMMIT_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(Duration::from_millis(
                        COMMIT_RETRY_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempts = attempt, error = %e, "WAL append failed, giving up");
                    return Err(EngineError::Unavailable(e));
                }
            }
        }
    }

    /// WAL-append, apply, publish. Callers pass the guards the event touches.
    pub(super) async fn commit(
        &self,
        event: Event,
        professional: Option<&mut ProfessionalState>,
        calendar: Option<&mut CalendarState>,
    ) -> Result<(), EngineError> {
        self.persist(&event).await?;
        if let Some(ps) = professional {
            apply_to_professional(ps, &event);
        }
        if let Some(cal) = calendar {
            apply_to_calendar(cal, &event);
        }
        self.apply_indexes(&event);
        if let Some(pid) = event_professional(&event) {
            self.notify.send(pid, FeedItem::Committed { event });
        }
        Ok(())
    }
}
