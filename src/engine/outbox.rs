use ulid::Ulid;

use crate::limits::MAX_NOTIFICATION_BATCH;
use crate::model::*;

use super::{Engine, EngineError};

fn log_entry(
    template: NotificationTemplate,
    payload: NotificationPayload,
    appointment_id: Option<Ulid>,
    now: Ms,
) -> NotificationLog {
    NotificationLog {
        id: Ulid::new(),
        channel: NotificationChannel::Email,
        template,
        payload,
        appointment_id,
        created_at: now,
        sent_at: None,
    }
}

fn about_appointment(
    appt: &Appointment,
    consultation_code: &str,
    template: NotificationTemplate,
    recipient: Recipient,
    now: Ms,
) -> NotificationLog {
    let act_before = match appt.state {
        AppointmentState::Tentative => appt.soft_hold_expires_at,
        _ => None,
    };
    let payload = NotificationPayload {
        recipient,
        professional_id: appt.professional_id,
        location_id: appt.location_id,
        consultation_code: consultation_code.to_string(),
        start: appt.span.start,
        end: appt.span.end,
        act_before,
        amount_cents: appt.no_show_fee_cents,
    };
    log_entry(template, payload, Some(appt.id), now)
}

fn to_patient(appt: &Appointment) -> Recipient {
    Recipient::for_patient(&appt.patient)
}

fn to_professional(appt: &Appointment) -> Recipient {
    Recipient::Professional {
        professional_id: appt.professional_id,
    }
}

/// Messages queued when the Reservation Guard commits a new appointment.
pub(super) fn creation_notifications(appt: &Appointment, code: &str, now: Ms) -> Vec<NotificationLog> {
    use NotificationTemplate as T;
    match appt.state {
        AppointmentState::Tentative if appt.source == BookingSource::Public => {
            vec![about_appointment(appt, code, T::PublicBookingVerification, to_patient(appt), now)]
        }
        AppointmentState::Tentative => {
            vec![about_appointment(appt, code, T::BookingPendingProfessional, to_professional(appt), now)]
        }
        AppointmentState::Reserved => vec![
            about_appointment(appt, code, T::BookingReservedPatient, to_patient(appt), now),
            about_appointment(appt, code, T::BookingReservedProfessional, to_professional(appt), now),
        ],
        AppointmentState::Confirmed => confirmed_pair(appt, code, now),
        _ => Vec::new(),
    }
}

fn confirmed_pair(appt: &Appointment, code: &str, now: Ms) -> Vec<NotificationLog> {
    vec![
        about_appointment(appt, code, NotificationTemplate::BookingConfirmedPatient, to_patient(appt), now),
        about_appointment(
            appt,
            code,
            NotificationTemplate::BookingConfirmedProfessional,
            to_professional(appt),
            now,
        ),
    ]
}

/// Messages queued by a state change; `appt` is the updated record.
pub(super) fn transition_notifications(
    appt: &Appointment,
    code: &str,
    actor: ActorRole,
    now: Ms,
) -> Vec<NotificationLog> {
    match appt.state {
        AppointmentState::Confirmed => confirmed_pair(appt, code, now),
        AppointmentState::Cancelled => {
            // The side that did not cancel is told.
            let recipient = match actor {
                ActorRole::Patient => to_professional(appt),
                _ => to_patient(appt),
            };
            vec![about_appointment(appt, code, NotificationTemplate::BookingCancelled, recipient, now)]
        }
        AppointmentState::NoShow if appt.no_show_fee_cents.unwrap_or(0) > 0 => {
            vec![about_appointment(appt, code, NotificationTemplate::NoShowFee, to_patient(appt), now)]
        }
        _ => Vec::new(),
    }
}

/// Tells the patient a slot is held for them until the offer expires.
pub(super) fn offer_notification(
    offer: &WaitlistOffer,
    hold: &Appointment,
    code: &str,
    now: Ms,
) -> NotificationLog {
    let payload = NotificationPayload {
        recipient: to_patient(hold),
        professional_id: offer.professional_id,
        location_id: offer.location_id,
        consultation_code: code.to_string(),
        start: offer.span.start,
        end: offer.span.end,
        act_before: Some(offer.expires_at),
        amount_cents: None,
    };
    log_entry(NotificationTemplate::WaitlistOffer, payload, Some(hold.id), now)
}

impl Engine {
    pub(super) fn unsent_notifications(&self) -> Vec<NotificationLog> {
        let mut pending: Vec<NotificationLog> =
            self.outbox.iter().map(|e| e.value().clone()).collect();
        pending.sort_by_key(|n| (n.created_at, n.id));
        pending
    }

    /// Oldest unsent notifications first, for the external delivery worker.
    pub fn pending_notifications(&self, limit: usize) -> Vec<NotificationLog> {
        let mut pending = self.unsent_notifications();
        pending.truncate(limit.min(MAX_NOTIFICATION_BATCH));
        pending
    }

    pub async fn mark_notification_sent(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if !self.outbox.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::NotificationSent { id, at: self.now() };
        self.commit(event, None, None).await
    }
}
