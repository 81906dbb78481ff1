use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotguard_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotguard_request_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (ok or the error code).
pub const RESERVATIONS_TOTAL: &str = "slotguard_reservations_total";

/// Histogram: Reservation Guard latency in seconds, lock wait included.
pub const RESERVATION_DURATION_SECONDS: &str = "slotguard_reservation_duration_seconds";

/// Counter: appointment transitions. Labels: event, outcome.
pub const TRANSITIONS_TOTAL: &str = "slotguard_transitions_total";

/// Histogram: slot query latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "slotguard_slot_query_duration_seconds";

/// Counter: expired soft holds deleted by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "slotguard_holds_reaped_total";

/// Counter: WAL appends retried after a failure.
pub const COMMIT_RETRIES_TOTAL: &str = "slotguard_commit_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotguard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotguard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotguard_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Request variant to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::RegisterProfessional { .. } => "register_professional",
        Request::UpdatePolicy { .. } => "update_policy",
        Request::RemoveProfessional { .. } => "remove_professional",
        Request::AddLocation { .. } => "add_location",
        Request::RemoveLocation { .. } => "remove_location",
        Request::AddConsultationType { .. } => "add_consultation_type",
        Request::RemoveConsultationType { .. } => "remove_consultation_type",
        Request::AddRule { .. } => "add_rule",
        Request::RemoveRule { .. } => "remove_rule",
        Request::AddBlock { .. } => "add_block",
        Request::RemoveBlock { .. } => "remove_block",
        Request::GetSlots { .. } => "get_slots",
        Request::CreateAppointment { .. } => "create_appointment",
        Request::TransitionAppointment { .. } => "transition_appointment",
        Request::GetAppointment { .. } => "get_appointment",
        Request::ListAppointments { .. } => "list_appointments",
        Request::JoinWaitlist { .. } => "join_waitlist",
        Request::LeaveWaitlist { .. } => "leave_waitlist",
        Request::WaitlistMatches { .. } => "waitlist_matches",
        Request::OfferSlot { .. } => "offer_slot",
        Request::AcceptOffer { .. } => "accept_offer",
        Request::DeclineOffer { .. } => "decline_offer",
        Request::PendingNotifications { .. } => "pending_notifications",
        Request::MarkNotificationSent { .. } => "mark_notification_sent",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
