use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{HOUR_MS, MINUTE_MS};

/// Unix milliseconds, UTC. Durations use the same unit.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Grow the span outward: `[start - before, end + after)`.
    pub fn expand(&self, before: Ms, after: Ms) -> Span {
        Span {
            start: self.start - before,
            end: self.end + after,
        }
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Padding kept free around an appointment. Never shown to patients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffers {
    pub before: Ms,
    pub after: Ms,
}

/// One calendar = one professional at one location. The no-overlap
/// invariant is scoped to a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalendarKey {
    pub professional_id: Ulid,
    pub location_id: Ulid,
}

// ── Reference data ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoShowFee {
    None,
    Flat { amount_cents: u64 },
    /// 10_000 basis points = 100% of the consultation price.
    Percent { basis_points: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfessionalPolicy {
    pub min_lead_time: Ms,
    pub max_lead_time: Option<Ms>,
    /// Patients cannot cancel closer than this to the start.
    pub min_reschedule_lead_time: Ms,
    /// Cancellations made earlier than this are free of charge.
    pub free_cancel_lead_time: Ms,
    pub buffer_before: Ms,
    pub buffer_after: Ms,
    pub no_show_fee: NoShowFee,
    /// How long a TENTATIVE appointment holds its slot.
    pub soft_hold_ttl: Ms,
}

impl Default for ProfessionalPolicy {
    fn default() -> Self {
        Self {
            min_lead_time: 2 * HOUR_MS,
            max_lead_time: Some(60 * 24 * HOUR_MS),
            min_reschedule_lead_time: 12 * HOUR_MS,
            free_cancel_lead_time: 24 * HOUR_MS,
            buffer_before: 0,
            buffer_after: 0,
            no_show_fee: NoShowFee::None,
            soft_hold_ttl: 15 * MINUTE_MS,
        }
    }
}

impl ProfessionalPolicy {
    pub fn default_buffers(&self) -> Buffers {
        Buffers {
            before: self.buffer_before,
            after: self.buffer_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub name: String,
    #[serde(default)]
    pub is_virtual: bool,
    /// IANA timezone name, e.g. `America/Argentina/Cordoba`.
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationType {
    pub id: Ulid,
    pub professional_id: Ulid,
    /// Unique per professional (e.g. `initial`, `follow_up`).
    pub code: String,
    pub duration: Ms,
    #[serde(default)]
    pub buffer_before: Option<Ms>,
    #[serde(default)]
    pub buffer_after: Option<Ms>,
    #[serde(default)]
    pub price_cents: Option<u64>,
}

impl ConsultationType {
    /// Type-level buffers override the professional's defaults field by field.
    pub fn buffers(&self, policy: &ProfessionalPolicy) -> Buffers {
        Buffers {
            before: self.buffer_before.unwrap_or(policy.buffer_before),
            after: self.buffer_after.unwrap_or(policy.buffer_after),
        }
    }
}

/// Recurring availability in the location's local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub location_id: Ulid,
    /// 0 = Monday … 6 = Sunday.
    pub weekday: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slot_granularity: Ms,
}

impl WeeklyRule {
    pub fn key(&self) -> CalendarKey {
        CalendarKey {
            professional_id: self.professional_id,
            location_id: self.location_id,
        }
    }
}

/// Explicit unavailability (vacation, personal time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub location_id: Ulid,
    pub span: Span,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Block {
    pub fn key(&self) -> CalendarKey {
        CalendarKey {
            professional_id: self.professional_id,
            location_id: self.location_id,
        }
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentState {
    Tentative,
    Reserved,
    Confirmed,
    Attended,
    NoShow,
    Cancelled,
}

impl AppointmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentState::Attended | AppointmentState::NoShow | AppointmentState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentState::Tentative => "TENTATIVE",
            AppointmentState::Reserved => "RESERVED",
            AppointmentState::Confirmed => "CONFIRMED",
            AppointmentState::Attended => "ATTENDED",
            AppointmentState::NoShow => "NO_SHOW",
            AppointmentState::Cancelled => "CANCELLED",
        }
    }
}

/// Contact details captured from a public booking form. Versioned so the
/// shape can grow without breaking stored records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactSnapshot {
    V1 {
        name: String,
        email: String,
        phone: Option<String>,
    },
}

impl ContactSnapshot {
    pub fn name(&self) -> &str {
        match self {
            ContactSnapshot::V1 { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientRef {
    Registered { patient_id: Ulid },
    Anonymous { contact: ContactSnapshot },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingSource {
    #[default]
    Public,
    Internal,
    Waitlist,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    InPerson,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Patient,
    Professional,
    Admin,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: ActorRole,
    pub at: Ms,
    /// Whether the cancellation fell inside the free-cancellation window.
    pub free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub location_id: Ulid,
    pub consultation_type_id: Ulid,
    pub patient: PatientRef,
    pub span: Span,
    /// Resolved at creation; conflict checks use these, not today's config.
    pub buffers: Buffers,
    pub state: AppointmentState,
    pub soft_hold_expires_at: Option<Ms>,
    pub source: BookingSource,
    pub channel: Channel,
    pub notes: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub no_show_fee_cents: Option<u64>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn key(&self) -> CalendarKey {
        CalendarKey {
            professional_id: self.professional_id,
            location_id: self.location_id,
        }
    }

    pub fn effective_span(&self) -> Span {
        self.span.expand(self.buffers.before, self.buffers.after)
    }

    /// A TENTATIVE hold is live strictly before its expiry instant.
    pub fn hold_active(&self, now: Ms) -> bool {
        self.state == AppointmentState::Tentative
            && self.soft_hold_expires_at.is_some_and(|exp| now < exp)
    }

    pub fn hold_expired(&self, now: Ms) -> bool {
        self.state == AppointmentState::Tentative && !self.hold_active(now)
    }

    /// Whether this appointment counts toward the no-overlap invariant.
    pub fn is_occupying(&self, now: Ms) -> bool {
        match self.state {
            AppointmentState::Reserved
            | AppointmentState::Confirmed
            | AppointmentState::Attended => true,
            AppointmentState::Tentative => self.hold_active(now),
            AppointmentState::NoShow | AppointmentState::Cancelled => false,
        }
    }

    /// Occupying, ignoring soft holds. Used when approving a hold.
    pub fn is_firm(&self) -> bool {
        matches!(
            self.state,
            AppointmentState::Reserved | AppointmentState::Confirmed | AppointmentState::Attended
        )
    }
}

/// Input of the Reservation Guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub location_id: Ulid,
    pub consultation_type_id: Ulid,
    pub span: Span,
    pub requested_state: AppointmentState,
    pub patient: PatientRef,
    #[serde(default)]
    pub source: BookingSource,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub notes: Option<String>,
    /// Overrides the policy's soft-hold TTL for TENTATIVE requests.
    #[serde(default)]
    pub hold_expires_at: Option<Ms>,
}

impl NewAppointment {
    pub fn key(&self) -> CalendarKey {
        CalendarKey {
            professional_id: self.professional_id,
            location_id: self.location_id,
        }
    }
}

/// A bookable slot as reported to callers. Buffers are never included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
}

/// Input of the Availability Calculator. Dates are local to each location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotQuery {
    pub professional_id: Ulid,
    pub date_from: NaiveDate,
    /// Inclusive.
    pub date_to: NaiveDate,
    #[serde(default)]
    pub consultation_type_id: Option<Ulid>,
    #[serde(default)]
    pub location_id: Option<Ulid>,
    /// Used when no consultation type is given.
    #[serde(default)]
    pub duration: Option<Ms>,
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub patient_id: Ulid,
    #[serde(default)]
    pub location_id: Option<Ulid>,
    /// 0 = Monday … 6 = Sunday. Empty means any day.
    #[serde(default)]
    pub preferred_days: Vec<u8>,
    /// Local wall-clock window `[from, until]` the patient can attend.
    #[serde(default)]
    pub time_window: Option<(NaiveTime, NaiveTime)>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferResolution {
    Accepted { at: Ms, appointment_id: Ulid },
    Declined { at: Ms },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistOffer {
    pub id: Ulid,
    pub entry_id: Ulid,
    pub professional_id: Ulid,
    pub location_id: Ulid,
    pub consultation_type_id: Ulid,
    pub span: Span,
    pub expires_at: Ms,
    /// TENTATIVE appointment holding the slot until `expires_at`.
    pub appointment_id: Ulid,
    pub resolution: Option<OfferResolution>,
    pub created_at: Ms,
}

impl WaitlistOffer {
    pub fn is_active(&self, now: Ms) -> bool {
        self.resolution.is_none() && now < self.expires_at
    }
}

// ── Notification outbox ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    #[default]
    Email,
    Whatsapp,
    Sms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    PublicBookingVerification,
    BookingPendingProfessional,
    BookingReservedPatient,
    BookingReservedProfessional,
    BookingConfirmedPatient,
    BookingConfirmedProfessional,
    BookingCancelled,
    WaitlistOffer,
    NoShowFee,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::PublicBookingVerification => "public_booking_verification",
            NotificationTemplate::BookingPendingProfessional => "booking_pending_professional",
            NotificationTemplate::BookingReservedPatient => "booking_reserved_patient",
            NotificationTemplate::BookingReservedProfessional => "booking_reserved_professional",
            NotificationTemplate::BookingConfirmedPatient => "booking_confirmed_patient",
            NotificationTemplate::BookingConfirmedProfessional => "booking_confirmed_professional",
            NotificationTemplate::BookingCancelled => "booking_cancelled",
            NotificationTemplate::WaitlistOffer => "waitlist_offer",
            NotificationTemplate::NoShowFee => "no_show_fee",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Patient { patient_id: Ulid },
    Contact { contact: ContactSnapshot },
    Professional { professional_id: Ulid },
}

impl Recipient {
    pub fn for_patient(patient: &PatientRef) -> Self {
        match patient {
            PatientRef::Registered { patient_id } => Recipient::Patient {
                patient_id: *patient_id,
            },
            PatientRef::Anonymous { contact } => Recipient::Contact {
                contact: contact.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub recipient: Recipient,
    pub professional_id: Ulid,
    pub location_id: Ulid,
    pub consultation_code: String,
    pub start: Ms,
    pub end: Ms,
    /// Hold or offer expiry, when the message asks the recipient to act.
    pub act_before: Option<Ms>,
    pub amount_cents: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: Ulid,
    pub channel: NotificationChannel,
    pub template: NotificationTemplate,
    pub payload: NotificationPayload,
    pub appointment_id: Option<Ulid>,
    pub created_at: Ms,
    pub sent_at: Option<Ms>,
}

// ── Events ───────────────────────────────────────────────────────

/// Every committed mutation, flat. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ProfessionalRegistered {
        id: Ulid,
        name: String,
        policy: ProfessionalPolicy,
    },
    PolicyUpdated {
        id: Ulid,
        policy: ProfessionalPolicy,
    },
    ProfessionalRemoved {
        id: Ulid,
    },
    LocationAdded {
        location: Location,
    },
    LocationRemoved {
        professional_id: Ulid,
        id: Ulid,
    },
    ConsultationTypeAdded {
        consultation_type: ConsultationType,
    },
    ConsultationTypeRemoved {
        professional_id: Ulid,
        id: Ulid,
    },
    RuleAdded {
        rule: WeeklyRule,
    },
    RuleRemoved {
        key: CalendarKey,
        id: Ulid,
    },
    BlockAdded {
        block: Block,
    },
    BlockRemoved {
        key: CalendarKey,
        id: Ulid,
    },
    AppointmentCreated {
        appointment: Appointment,
        notifications: Vec<NotificationLog>,
    },
    AppointmentTransitioned {
        appointment: Appointment,
        notifications: Vec<NotificationLog>,
    },
    AppointmentPurged {
        key: CalendarKey,
        id: Ulid,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistLeft {
        professional_id: Ulid,
        id: Ulid,
    },
    /// `hold` is absent only in compacted logs, where the appointment is
    /// recreated on its own.
    OfferCreated {
        offer: WaitlistOffer,
        hold: Option<Appointment>,
        notifications: Vec<NotificationLog>,
    },
    OfferAccepted {
        id: Ulid,
        appointment: Appointment,
        notifications: Vec<NotificationLog>,
    },
    OfferDeclined {
        id: Ulid,
        at: Ms,
        released: Appointment,
    },
    NotificationsQueued {
        notifications: Vec<NotificationLog>,
    },
    NotificationSent {
        id: Ulid,
        at: Ms,
    },
}
