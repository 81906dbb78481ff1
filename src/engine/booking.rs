use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::lifecycle::{plan_transition, AppointmentEvent};
use crate::limits::*;
use crate::model::*;
use crate::notify::FeedItem;
use crate::observability;
use crate::policy;

use super::conflict::{check_no_conflict, validate_span, within_weekly_rules, Obstacles};
use super::outbox::{creation_notifications, offer_notification, transition_notifications};
use super::{Engine, EngineError};

fn validate_request(req: &NewAppointment) -> Result<(), EngineError> {
    validate_span(&req.span, MAX_APPOINTMENT_DURATION_MS)?;
    if !matches!(
        req.requested_state,
        AppointmentState::Tentative | AppointmentState::Reserved | AppointmentState::Confirmed
    ) {
        return Err(EngineError::InvalidInput(format!(
            "appointments cannot be created as {}",
            req.requested_state.as_str()
        )));
    }
    if let Some(notes) = &req.notes
        && notes.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if let PatientRef::Anonymous { contact } = &req.patient {
        let ContactSnapshot::V1 { name, email, phone } = contact;
        if name.trim().is_empty() || !email.contains('@') {
            return Err(EngineError::InvalidInput("contact needs a name and an email".into()));
        }
        if name.len() > MAX_NAME_LEN
            || email.len() > MAX_NAME_LEN
            || phone.as_ref().is_some_and(|p| p.len() > MAX_NAME_LEN)
        {
            return Err(EngineError::LimitExceeded("contact field too long"));
        }
    }
    Ok(())
}

impl Engine {
    /// Reservation Guard: validate and atomically commit a new appointment.
    pub async fn create_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        self.reserve(req, None).await
    }

    /// With `offer`, the appointment is the soft hold backing a waitlist
    /// offer and both are committed as one event.
    pub(super) async fn reserve(
        &self,
        req: NewAppointment,
        offer: Option<WaitlistOffer>,
    ) -> Result<Appointment, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(req, offer).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => {
                debug!(code = e.code(), error = %e, "reservation rejected");
                e.code()
            }
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::RESERVATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn reserve_inner(
        &self,
        req: NewAppointment,
        offer: Option<WaitlistOffer>,
    ) -> Result<Appointment, EngineError> {
        validate_request(&req)?;
        let _gate = self.commit_gate.read().await;

        let ps_arc = self.require_professional(req.professional_id)?;
        let ps = ps_arc.read().await;

        // 1. Ownership
        if !ps.locations.contains_key(&req.location_id) {
            return Err(EngineError::OwnershipMismatch {
                entity: "location",
                id: req.location_id,
                professional_id: req.professional_id,
            });
        }
        let ct = ps
            .consultation_types
            .get(&req.consultation_type_id)
            .cloned()
            .ok_or(EngineError::OwnershipMismatch {
                entity: "consultation type",
                id: req.consultation_type_id,
                professional_id: req.professional_id,
            })?;

        let cal_arc = self.require_calendar(&req.key())?;
        let mut cal = cal_arc.write().await;
        let now = self.now();

        // 2. Lead time
        policy::lead_time_ok(&ps.policy, req.span.start, now)
            .map_err(EngineError::LeadTimeViolation)?;

        // 3. Duration
        let actual = req.span.duration_ms();
        if (actual - ct.duration).abs() > DURATION_TOLERANCE_MS {
            return Err(EngineError::DurationMismatch {
                expected: ct.duration,
                actual,
            });
        }

        let hold_expires_at = match req.requested_state {
            AppointmentState::Tentative => {
                let expires = req.hold_expires_at.unwrap_or(now + ps.policy.soft_hold_ttl);
                if expires <= now || expires - now > MAX_SOFT_HOLD_TTL_MS {
                    return Err(EngineError::InvalidInput("hold expiry out of range".into()));
                }
                Some(expires)
            }
            _ => None,
        };
        let buffers = ct.buffers(&ps.policy);

        if self.entity_to_calendar.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if let Some(offer) = &offer
            && self.offers.contains_key(&offer.id)
        {
            return Err(EngineError::AlreadyExists(offer.id));
        }
        if cal.appointments.len() >= MAX_APPOINTMENTS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many appointments on calendar"));
        }

        // 4. Overlap, under the calendar write lock
        let effective = req.span.expand(buffers.before, buffers.after);
        check_no_conflict(&cal, &effective, now, None, Obstacles::Occupying)?;

        // 5. Weekly availability
        if !within_weekly_rules(&cal, &req.span) {
            return Err(EngineError::OutsideAvailability(req.span));
        }

        let appointment = Appointment {
            id: req.id,
            professional_id: req.professional_id,
            location_id: req.location_id,
            consultation_type_id: req.consultation_type_id,
            patient: req.patient,
            span: req.span,
            buffers,
            state: req.requested_state,
            soft_hold_expires_at: hold_expires_at,
            source: req.source,
            channel: req.channel,
            notes: req.notes,
            cancellation: None,
            no_show_fee_cents: None,
            created_at: now,
            updated_at: now,
        };
        let event = match offer {
            Some(mut offer) => {
                offer.created_at = now;
                let notifications = vec![offer_notification(&offer, &appointment, &ct.code, now)];
                Event::OfferCreated {
                    offer,
                    hold: Some(appointment.clone()),
                    notifications,
                }
            }
            None => Event::AppointmentCreated {
                appointment: appointment.clone(),
                notifications: creation_notifications(&appointment, &ct.code, now),
            },
        };
        self.commit(event, None, Some(&mut *cal)).await?;
        info!(
            id = %appointment.id,
            professional = %appointment.professional_id,
            state = appointment.state.as_str(),
            start = appointment.span.start,
            "appointment created"
        );
        Ok(appointment)
    }

    /// Appointment state machine entry point.
    pub async fn transition_appointment(
        &self,
        id: Ulid,
        event: AppointmentEvent,
        actor: ActorRole,
    ) -> Result<Appointment, EngineError> {
        let result = self.transition_inner(id, event, actor).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => {
                debug!(%id, event = event.as_str(), code = e.code(), error = %e, "transition rejected");
                e.code()
            }
        };
        metrics::counter!(
            observability::TRANSITIONS_TOTAL,
            "event" => event.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        result
    }

    async fn transition_inner(
        &self,
        id: Ulid,
        event: AppointmentEvent,
        actor: ActorRole,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.calendar_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let ps_arc = self.require_professional(key.professional_id)?;
        let ps = ps_arc.read().await;
        let cal_arc = self.require_calendar(&key)?;
        let mut cal = cal_arc.write().await;
        let now = self.now();

        let current = cal
            .find_appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let plan = plan_transition(&current, event, actor, &ps.policy, now)?;

        if plan.revalidate {
            check_no_conflict(
                &cal,
                &current.effective_span(),
                now,
                Some(id),
                Obstacles::FirmOnly,
            )?;
        }

        let ct = ps.consultation_types.get(&current.consultation_type_id);
        let mut updated = current.clone();
        updated.state = plan.to;
        updated.updated_at = now;
        match plan.to {
            AppointmentState::Cancelled => {
                updated.cancellation = Some(Cancellation {
                    by: actor,
                    at: now,
                    free: policy::cancellation_is_free(&ps.policy, &current, now),
                });
            }
            AppointmentState::NoShow => {
                let price = ct.and_then(|c| c.price_cents);
                updated.no_show_fee_cents = Some(policy::no_show_fee(&ps.policy, price));
            }
            _ => {}
        }

        let code = ct.map(|c| c.code.as_str()).unwrap_or_default();
        let notifications = transition_notifications(&updated, code, actor, now);
        let committed = Event::AppointmentTransitioned {
            appointment: updated.clone(),
            notifications,
        };
        self.commit(committed, None, Some(&mut *cal)).await?;
        info!(
            %id,
            from = current.state.as_str(),
            to = updated.state.as_str(),
            "appointment transitioned"
        );

        if plan.frees_slot {
            let entries = self.matching_entries(key.professional_id, key.location_id, &cal.tz, &updated.span);
            self.notify.send(
                key.professional_id,
                FeedItem::SlotFreed {
                    professional_id: key.professional_id,
                    location_id: key.location_id,
                    span: updated.span,
                    waitlist_entries: entries.into_iter().map(|e| e.id).collect(),
                },
            );
        }
        Ok(updated)
    }
}
