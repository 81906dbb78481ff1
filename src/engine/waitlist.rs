use chrono::TimeZone;
use chrono_tz::Tz;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::FeedItem;

use super::availability::weekday_index;
use super::outbox::creation_notifications;
use super::{CalendarState, Engine, EngineError};

/// Does a freed span fit the entry's weekday and time-of-day preferences?
fn entry_matches(entry: &WaitlistEntry, location_id: Ulid, tz: &Tz, span: &Span) -> bool {
    if entry.location_id.is_some_and(|l| l != location_id) {
        return false;
    }
    let (Some(start), Some(end)) = (
        tz.timestamp_millis_opt(span.start).single(),
        tz.timestamp_millis_opt(span.end).single(),
    ) else {
        return false;
    };
    if !entry.preferred_days.is_empty()
        && !entry.preferred_days.contains(&weekday_index(start.date_naive()))
    {
        return false;
    }
    match entry.time_window {
        None => true,
        Some((from, until)) => {
            start.date_naive() == end.date_naive() && start.time() >= from && end.time() <= until
        }
    }
}

impl Engine {
    pub async fn join_waitlist(&self, mut entry: WaitlistEntry) -> Result<WaitlistEntry, EngineError> {
        if entry.preferred_days.iter().any(|d| *d > 6) {
            return Err(EngineError::InvalidInput("weekday must be 0 (Monday) to 6".into()));
        }
        if entry.time_window.is_some_and(|(from, until)| from >= until) {
            return Err(EngineError::InvalidInput("time window end must be after start".into()));
        }
        if entry.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(entry.professional_id)?;
        let ps = ps_arc.read().await;
        if let Some(lid) = entry.location_id {
            self.require_owned_location(&ps, lid)?;
        }
        if self.waitlist.len() >= MAX_WAITLIST_ENTRIES {
            return Err(EngineError::LimitExceeded("waitlist is full"));
        }
        if self.waitlist.contains_key(&entry.id) {
            return Err(EngineError::AlreadyExists(entry.id));
        }
        // One entry per (professional, patient).
        if let Some(existing) = self.waitlist.iter().find(|e| {
            e.professional_id == entry.professional_id && e.patient_id == entry.patient_id
        }) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        entry.created_at = self.now();
        entry.preferred_days.sort_unstable();
        entry.preferred_days.dedup();
        self.commit(Event::WaitlistJoined { entry: entry.clone() }, None, None)
            .await?;
        Ok(entry)
    }

    pub async fn leave_waitlist(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let professional_id = self
            .waitlist
            .get(&id)
            .map(|e| e.professional_id)
            .ok_or(EngineError::NotFound(id))?;
        self.commit(Event::WaitlistLeft { professional_id, id }, None, None)
            .await
    }

    /// Entries whose preferences fit `span`, oldest first.
    pub(super) fn matching_entries(
        &self,
        professional_id: Ulid,
        location_id: Ulid,
        tz: &Tz,
        span: &Span,
    ) -> Vec<WaitlistEntry> {
        let mut matches: Vec<WaitlistEntry> = self
            .waitlist
            .iter()
            .filter(|e| e.professional_id == professional_id)
            .filter(|e| entry_matches(e, location_id, tz, span))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by_key(|e| (e.created_at, e.id));
        matches
    }

    pub async fn waitlist_matches(
        &self,
        professional_id: Ulid,
        location_id: Ulid,
        span: Span,
    ) -> Result<Vec<WaitlistEntry>, EngineError> {
        let key = CalendarKey {
            professional_id,
            location_id,
        };
        let cal_arc = self.require_calendar(&key)?;
        let tz = cal_arc.read().await.tz;
        Ok(self.matching_entries(professional_id, location_id, &tz, &span))
    }

    /// Time-boxed offer of a free slot to a waitlisted patient. The slot is
    /// held as a TENTATIVE appointment that lapses with the offer.
    pub async fn offer_slot(
        &self,
        offer_id: Ulid,
        entry_id: Ulid,
        location_id: Ulid,
        consultation_type_id: Ulid,
        span: Span,
        expires_at: Ms,
    ) -> Result<WaitlistOffer, EngineError> {
        if expires_at <= self.now() {
            return Err(EngineError::InvalidInput("offer expiry must be in the future".into()));
        }
        if self.offers.contains_key(&offer_id) {
            return Err(EngineError::AlreadyExists(offer_id));
        }
        let entry = self
            .waitlist
            .get(&entry_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(entry_id))?;

        let hold = NewAppointment {
            id: Ulid::new(),
            professional_id: entry.professional_id,
            location_id,
            consultation_type_id,
            span,
            requested_state: AppointmentState::Tentative,
            patient: PatientRef::Registered {
                patient_id: entry.patient_id,
            },
            source: BookingSource::Waitlist,
            channel: Channel::InPerson,
            notes: None,
            hold_expires_at: Some(expires_at),
        };
        let mut offer = WaitlistOffer {
            id: offer_id,
            entry_id,
            professional_id: entry.professional_id,
            location_id,
            consultation_type_id,
            span,
            expires_at,
            appointment_id: hold.id,
            resolution: None,
            created_at: 0,
        };
        let held = self.reserve(hold, Some(offer.clone())).await?;
        offer.created_at = held.created_at;
        info!(offer = %offer_id, entry = %entry_id, hold = %held.id, "waitlist offer sent");
        Ok(offer)
    }

    fn offer_calendar(&self, offer_id: Ulid) -> Result<CalendarKey, EngineError> {
        self.offers
            .get(&offer_id)
            .map(|o| CalendarKey {
                professional_id: o.professional_id,
                location_id: o.location_id,
            })
            .ok_or(EngineError::NotFound(offer_id))
    }

    /// The unresolved offer and its still-live hold. Caller holds the
    /// calendar write lock.
    fn live_offer(
        &self,
        cal: &CalendarState,
        offer_id: Ulid,
        now: Ms,
    ) -> Result<(WaitlistOffer, Appointment), EngineError> {
        let offer = self
            .offers
            .get(&offer_id)
            .map(|o| o.value().clone())
            .ok_or(EngineError::NotFound(offer_id))?;
        if offer.resolution.is_some() {
            return Err(EngineError::InvalidInput("offer already resolved".into()));
        }
        if !offer.is_active(now) {
            return Err(EngineError::InvalidInput("offer has expired".into()));
        }
        let hold = cal
            .find_appointment(offer.appointment_id)
            .filter(|a| a.state == AppointmentState::Tentative && a.hold_active(now))
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput("offered slot is no longer held".into()))?;
        Ok((offer, hold))
    }

    /// Accepting keeps the offer's hold as a TENTATIVE waitlist booking,
    /// renewed for the professional's soft-hold TTL; the professional then
    /// approves it.
    pub async fn accept_offer(&self, offer_id: Ulid) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.offer_calendar(offer_id)?;
        let ps_arc = self.require_professional(key.professional_id)?;
        let ps = ps_arc.read().await;
        let cal_arc = self.require_calendar(&key)?;
        let mut cal = cal_arc.write().await;
        let now = self.now();
        let (offer, hold) = self.live_offer(&cal, offer_id, now)?;

        let mut booked = hold;
        booked.soft_hold_expires_at = Some(now + ps.policy.soft_hold_ttl);
        booked.updated_at = now;
        let code = ps
            .consultation_types
            .get(&booked.consultation_type_id)
            .map(|c| c.code.as_str())
            .unwrap_or_default();
        let notifications = creation_notifications(&booked, code, now);
        self.commit(
            Event::OfferAccepted {
                id: offer.id,
                appointment: booked.clone(),
                notifications,
            },
            None,
            Some(&mut *cal),
        )
        .await?;
        info!(offer = %offer_id, appointment = %booked.id, "waitlist offer accepted");
        Ok(booked)
    }

    /// Declining releases the held slot.
    pub async fn decline_offer(&self, offer_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.offer_calendar(offer_id)?;
        let cal_arc = self.require_calendar(&key)?;
        let mut cal = cal_arc.write().await;
        let now = self.now();
        let (_, hold) = self.live_offer(&cal, offer_id, now)?;

        let mut released = hold;
        released.state = AppointmentState::Cancelled;
        released.cancellation = Some(Cancellation {
            by: ActorRole::Patient,
            at: now,
            free: true,
        });
        released.updated_at = now;
        let span = released.span;
        self.commit(
            Event::OfferDeclined {
                id: offer_id,
                at: now,
                released,
            },
            None,
            Some(&mut *cal),
        )
        .await?;

        let entries = self.matching_entries(key.professional_id, key.location_id, &cal.tz, &span);
        self.notify.send(
            key.professional_id,
            FeedItem::SlotFreed {
                professional_id: key.professional_id,
                location_id: key.location_id,
                span,
                waitlist_entries: entries.into_iter().map(|e| e.id).collect(),
            },
        );
        Ok(())
    }
}
