use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::lifecycle::AppointmentEvent;
use crate::limits::MAX_NOTIFICATION_BATCH;
use crate::model::*;
use crate::notify::FeedItem;

/// One line of client input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterProfessional {
        id: Ulid,
        name: String,
        #[serde(default)]
        policy: ProfessionalPolicy,
    },
    UpdatePolicy {
        id: Ulid,
        policy: ProfessionalPolicy,
    },
    RemoveProfessional {
        id: Ulid,
    },
    AddLocation {
        location: Location,
    },
    RemoveLocation {
        professional_id: Ulid,
        id: Ulid,
    },
    AddConsultationType {
        consultation_type: ConsultationType,
    },
    RemoveConsultationType {
        professional_id: Ulid,
        id: Ulid,
    },
    AddRule {
        rule: WeeklyRule,
    },
    RemoveRule {
        id: Ulid,
    },
    AddBlock {
        block: Block,
    },
    RemoveBlock {
        id: Ulid,
    },
    GetSlots {
        query: SlotQuery,
    },
    CreateAppointment {
        appointment: NewAppointment,
    },
    TransitionAppointment {
        id: Ulid,
        event: AppointmentEvent,
        actor: ActorRole,
    },
    GetAppointment {
        id: Ulid,
    },
    ListAppointments {
        professional_id: Ulid,
        #[serde(default)]
        location_id: Option<Ulid>,
        #[serde(default)]
        window: Option<Span>,
    },
    JoinWaitlist {
        entry: WaitlistEntry,
    },
    LeaveWaitlist {
        id: Ulid,
    },
    WaitlistMatches {
        professional_id: Ulid,
        location_id: Ulid,
        span: Span,
    },
    OfferSlot {
        id: Ulid,
        entry_id: Ulid,
        location_id: Ulid,
        consultation_type_id: Ulid,
        span: Span,
        expires_at: Ms,
    },
    AcceptOffer {
        id: Ulid,
    },
    DeclineOffer {
        id: Ulid,
    },
    PendingNotifications {
        #[serde(default = "default_batch")]
        limit: usize,
    },
    MarkNotificationSent {
        id: Ulid,
    },
    /// Subscribe this connection to a professional's change feed.
    Listen {
        professional_id: Ulid,
    },
    Unlisten {
        professional_id: Ulid,
    },
}

fn default_batch() -> usize {
    MAX_NOTIFICATION_BATCH
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// One line of server output: `{"ok": ...}`, `{"error": {...}}`, or a
/// pushed `{"feed": ...}` item on a listening connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Error(ErrorBody),
    Feed(FeedItem),
}

impl Reply {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Reply::Error(ErrorBody {
            code,
            message: message.into(),
        })
    }

    pub fn status(&self) -> &'static str {
        match self {
            Reply::Ok(_) | Reply::Feed(_) => "ok",
            Reply::Error(body) => body.code,
        }
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        Reply::error(e.code(), e.to_string())
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Unavailable(e.to_string()))
}

/// Run a request against the engine. `listen`/`unlisten` need connection
/// state and are answered by the connection handler instead.
pub async fn handle(engine: &Engine, req: Request) -> Reply {
    match execute(engine, req).await {
        Ok(value) => Reply::Ok(value),
        Err(e) => e.into(),
    }
}

async fn execute(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    match req {
        Request::RegisterProfessional { id, name, policy } => {
            engine.register_professional(id, name, policy).await?;
            Ok(Value::Null)
        }
        Request::UpdatePolicy { id, policy } => {
            engine.update_policy(id, policy).await?;
            Ok(Value::Null)
        }
        Request::RemoveProfessional { id } => {
            engine.remove_professional(id).await?;
            Ok(Value::Null)
        }
        Request::AddLocation { location } => {
            engine.add_location(location).await?;
            Ok(Value::Null)
        }
        Request::RemoveLocation { professional_id, id } => {
            engine.remove_location(professional_id, id).await?;
            Ok(Value::Null)
        }
        Request::AddConsultationType { consultation_type } => {
            engine.add_consultation_type(consultation_type).await?;
            Ok(Value::Null)
        }
        Request::RemoveConsultationType { professional_id, id } => {
            engine.remove_consultation_type(professional_id, id).await?;
            Ok(Value::Null)
        }
        Request::AddRule { rule } => {
            engine.add_rule(rule).await?;
            Ok(Value::Null)
        }
        Request::RemoveRule { id } => {
            engine.remove_rule(id).await?;
            Ok(Value::Null)
        }
        Request::AddBlock { block } => {
            engine.add_block(block).await?;
            Ok(Value::Null)
        }
        Request::RemoveBlock { id } => {
            engine.remove_block(id).await?;
            Ok(Value::Null)
        }
        Request::GetSlots { query } => to_value(engine.get_slots(query).await?),
        Request::CreateAppointment { appointment } => {
            to_value(engine.create_appointment(appointment).await?)
        }
        Request::TransitionAppointment { id, event, actor } => {
            to_value(engine.transition_appointment(id, event, actor).await?)
        }
        Request::GetAppointment { id } => to_value(engine.get_appointment(id).await?),
        Request::ListAppointments {
            professional_id,
            location_id,
            window,
        } => to_value(
            engine
                .list_appointments(professional_id, location_id, window)
                .await?,
        ),
        Request::JoinWaitlist { entry } => to_value(engine.join_waitlist(entry).await?),
        Request::LeaveWaitlist { id } => {
            engine.leave_waitlist(id).await?;
            Ok(Value::Null)
        }
        Request::WaitlistMatches {
            professional_id,
            location_id,
            span,
        } => to_value(
            engine
                .waitlist_matches(professional_id, location_id, span)
                .await?,
        ),
        Request::OfferSlot {
            id,
            entry_id,
            location_id,
            consultation_type_id,
            span,
            expires_at,
        } => to_value(
            engine
                .offer_slot(id, entry_id, location_id, consultation_type_id, span, expires_at)
                .await?,
        ),
        Request::AcceptOffer { id } => to_value(engine.accept_offer(id).await?),
        Request::DeclineOffer { id } => {
            engine.decline_offer(id).await?;
            Ok(Value::Null)
        }
        Request::PendingNotifications { limit } => to_value(engine.pending_notifications(limit)),
        Request::MarkNotificationSent { id } => {
            engine.mark_notification_sent(id).await?;
            Ok(Value::Null)
        }
        Request::Listen { .. } | Request::Unlisten { .. } => Err(EngineError::InvalidInput(
            "listen is only available on a client connection".into(),
        )),
    }
}
