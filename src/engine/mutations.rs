use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::{parse_timezone, Engine, EngineError, ProfessionalState, WalCommand};

fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_buffer(ms: Ms) -> Result<(), EngineError> {
    if ms < 0 {
        return Err(EngineError::InvalidInput("buffers must not be negative".into()));
    }
    if ms > MAX_BUFFER_MS {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    Ok(())
}

pub(super) fn validate_policy(policy: &ProfessionalPolicy) -> Result<(), EngineError> {
    let leads = [
        policy.min_lead_time,
        policy.min_reschedule_lead_time,
        policy.free_cancel_lead_time,
    ];
    if leads.iter().any(|l| *l < 0) || policy.max_lead_time.is_some_and(|m| m < 0) {
        return Err(EngineError::InvalidInput("lead times must not be negative".into()));
    }
    if leads.iter().any(|l| *l > MAX_LEAD_TIME_MS)
        || policy.max_lead_time.is_some_and(|m| m > MAX_LEAD_TIME_MS)
    {
        return Err(EngineError::LimitExceeded("lead time too long"));
    }
    if policy
        .max_lead_time
        .is_some_and(|max| max < policy.min_lead_time)
    {
        return Err(EngineError::InvalidInput(
            "max_lead_time must not be below min_lead_time".into(),
        ));
    }
    validate_buffer(policy.buffer_before)?;
    validate_buffer(policy.buffer_after)?;
    if policy.soft_hold_ttl <= 0 || policy.soft_hold_ttl > MAX_SOFT_HOLD_TTL_MS {
        return Err(EngineError::InvalidInput("soft_hold_ttl out of range".into()));
    }
    if let NoShowFee::Percent { basis_points } = policy.no_show_fee
        && basis_points > 10_000
    {
        return Err(EngineError::InvalidInput("no-show percent above 100%".into()));
    }
    Ok(())
}

impl Engine {
    // ── Professionals ────────────────────────────────────────

    pub async fn register_professional(
        &self,
        id: Ulid,
        name: String,
        policy: ProfessionalPolicy,
    ) -> Result<(), EngineError> {
        validate_name(&name, "professional name")?;
        validate_policy(&policy)?;
        let _gate = self.commit_gate.read().await;
        if self.professionals.len() >= MAX_PROFESSIONALS {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        if self.professionals.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.commit(Event::ProfessionalRegistered { id, name, policy }, None, None)
            .await?;
        info!(%id, "professional registered");
        Ok(())
    }

    pub async fn update_policy(&self, id: Ulid, policy: ProfessionalPolicy) -> Result<(), EngineError> {
        validate_policy(&policy)?;
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(id)?;
        let mut ps = ps_arc.write().await;
        self.commit(Event::PolicyUpdated { id, policy }, Some(&mut *ps), None)
            .await
    }

    /// Cascades to locations, consultation types, rules, blocks and waitlist.
    /// Refused while any appointment exists.
    pub async fn remove_professional(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(id)?;
        let ps = ps_arc.write().await;
        for key in ps.location_keys() {
            if let Some(cal) = self.calendar(&key)
                && !cal.read().await.appointments.is_empty()
            {
                return Err(EngineError::InUse(id));
            }
        }
        self.commit(Event::ProfessionalRemoved { id }, None, None).await?;
        drop(ps);
        self.notify.remove(&id);
        info!(%id, "professional removed");
        Ok(())
    }

    // ── Locations ────────────────────────────────────────────

    pub async fn add_location(&self, location: Location) -> Result<(), EngineError> {
        validate_name(&location.name, "location name")?;
        if location.timezone.len() > MAX_TIMEZONE_LEN || parse_timezone(&location.timezone).is_none() {
            return Err(EngineError::InvalidInput(format!(
                "unknown timezone: {}",
                location.timezone
            )));
        }
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(location.professional_id)?;
        let mut ps = ps_arc.write().await;
        if ps.locations.len() >= MAX_LOCATIONS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        if ps.locations.contains_key(&location.id) {
            return Err(EngineError::AlreadyExists(location.id));
        }
        if let Some(existing) = ps.locations.values().find(|l| l.name == location.name) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        self.commit(Event::LocationAdded { location }, Some(&mut *ps), None)
            .await
    }

    /// Rules and blocks go with the location; appointments keep it alive.
    pub async fn remove_location(&self, professional_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(professional_id)?;
        let mut ps = ps_arc.write().await;
        if !ps.locations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let key = CalendarKey {
            professional_id,
            location_id: id,
        };
        if let Some(cal) = self.calendar(&key)
            && !cal.read().await.appointments.is_empty()
        {
            return Err(EngineError::InUse(id));
        }
        self.commit(
            Event::LocationRemoved { professional_id, id },
            Some(&mut *ps),
            None,
        )
        .await
    }

    // ── Consultation types ───────────────────────────────────

    pub async fn add_consultation_type(&self, ct: ConsultationType) -> Result<(), EngineError> {
        validate_name(&ct.code, "consultation code")?;
        if ct.duration <= 0 || ct.duration > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::InvalidInput("duration out of range".into()));
        }
        if let Some(b) = ct.buffer_before {
            validate_buffer(b)?;
        }
        if let Some(b) = ct.buffer_after {
            validate_buffer(b)?;
        }
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(ct.professional_id)?;
        let mut ps = ps_arc.write().await;
        if ps.consultation_types.len() >= MAX_CONSULTATION_TYPES_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many consultation types"));
        }
        if ps.consultation_types.contains_key(&ct.id) {
            return Err(EngineError::AlreadyExists(ct.id));
        }
        if let Some(existing) = ps.consultation_types.values().find(|c| c.code == ct.code) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        self.commit(
            Event::ConsultationTypeAdded {
                consultation_type: ct,
            },
            Some(&mut *ps),
            None,
        )
        .await
    }

    pub async fn remove_consultation_type(
        &self,
        professional_id: Ulid,
        id: Ulid,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(professional_id)?;
        let mut ps = ps_arc.write().await;
        if !ps.consultation_types.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        for key in ps.location_keys() {
            if let Some(cal) = self.calendar(&key)
                && cal.read().await.references(id)
            {
                return Err(EngineError::InUse(id));
            }
        }
        self.commit(
            Event::ConsultationTypeRemoved { professional_id, id },
            Some(&mut *ps),
            None,
        )
        .await
    }

    // ── Weekly rules ─────────────────────────────────────────

    pub async fn add_rule(&self, rule: WeeklyRule) -> Result<(), EngineError> {
        if rule.weekday > 6 {
            return Err(EngineError::InvalidInput("weekday must be 0 (Monday) to 6".into()));
        }
        if rule.start >= rule.end {
            return Err(EngineError::InvalidInput("rule end must be after start".into()));
        }
        if rule.slot_granularity <= 0 || rule.slot_granularity > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::InvalidInput("slot granularity out of range".into()));
        }
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(rule.professional_id)?;
        let ps = ps_arc.read().await;
        self.require_owned_location(&ps, rule.location_id)?;
        let cal_arc = self.require_calendar(&rule.key())?;
        let mut cal = cal_arc.write().await;
        if self.entity_to_calendar.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        if cal.rules.len() >= MAX_RULES_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many rules on calendar"));
        }
        self.commit(Event::RuleAdded { rule }, None, Some(&mut *cal)).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.calendar_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let cal_arc = self.require_calendar(&key)?;
        let mut cal = cal_arc.write().await;
        if !cal.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        self.commit(Event::RuleRemoved { key, id }, None, Some(&mut *cal)).await
    }

    // ── Blocks ───────────────────────────────────────────────

    pub async fn add_block(&self, block: Block) -> Result<(), EngineError> {
        validate_span(&block.span, MAX_BLOCK_DURATION_MS)?;
        if block.reason.as_ref().is_some_and(|r| r.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.commit_gate.read().await;
        let ps_arc = self.require_professional(block.professional_id)?;
        let ps = ps_arc.read().await;
        self.require_owned_location(&ps, block.location_id)?;
        let cal_arc = self.require_calendar(&block.key())?;
        let mut cal = cal_arc.write().await;
        if self.entity_to_calendar.contains_key(&block.id) {
            return Err(EngineError::AlreadyExists(block.id));
        }
        if cal.blocks.len() >= MAX_BLOCKS_PER_CALENDAR {
            return Err(EngineError::LimitExceeded("too many blocks on calendar"));
        }
        self.commit(Event::BlockAdded { block }, None, Some(&mut *cal)).await
    }

    pub async fn remove_block(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let key = self.calendar_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let cal_arc = self.require_calendar(&key)?;
        let mut cal = cal_arc.write().await;
        if !cal.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        self.commit(Event::BlockRemoved { key, id }, None, Some(&mut *cal)).await
    }

    pub(super) fn require_owned_location(
        &self,
        ps: &ProfessionalState,
        location_id: Ulid,
    ) -> Result<(), EngineError> {
        if ps.locations.contains_key(&location_id) {
            Ok(())
        } else {
            Err(EngineError::OwnershipMismatch {
                entity: "location",
                id: location_id,
                professional_id: ps.id,
            })
        }
    }

    // ── Soft-hold cleanup ────────────────────────────────────

    /// Delete a TENTATIVE row whose hold has lapsed. Idempotent: a row that
    /// is already gone, or was approved meanwhile, is left alone.
    pub async fn purge_expired_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(key) = self.calendar_for_entity(&id) else {
            return Ok(false);
        };
        let Some(cal_arc) = self.calendar(&key) else {
            return Ok(false);
        };
        let mut cal = cal_arc.write().await;
        let now = self.now();
        match cal.find_appointment(id) {
            Some(a) if a.hold_expired(now) => {}
            _ => return Ok(false),
        }
        self.commit(Event::AppointmentPurged { key, id }, None, Some(&mut *cal))
            .await?;
        Ok(true)
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut professional_ids: Vec<Ulid> = self.professionals.iter().map(|e| *e.key()).collect();
        professional_ids.sort();
        for pid in professional_ids {
            let Some(ps_arc) = self.professional(&pid) else {
                continue;
            };
            let ps = ps_arc.read().await;
            events.push(Event::ProfessionalRegistered {
                id: ps.id,
                name: ps.name.clone(),
                policy: ps.policy.clone(),
            });
            for location in ps.locations.values() {
                events.push(Event::LocationAdded {
                    location: location.clone(),
                });
            }
            for ct in ps.consultation_types.values() {
                events.push(Event::ConsultationTypeAdded {
                    consultation_type: ct.clone(),
                });
            }
            for key in ps.location_keys() {
                let Some(cal_arc) = self.calendar(&key) else {
                    continue;
                };
                let cal = cal_arc.read().await;
                events.extend(cal.rules.iter().map(|r| Event::RuleAdded { rule: r.clone() }));
                events.extend(cal.blocks.iter().map(|b| Event::BlockAdded { block: b.clone() }));
                events.extend(cal.appointments.iter().map(|a| Event::AppointmentCreated {
                    appointment: a.clone(),
                    notifications: Vec::new(),
                }));
            }
        }
        events.extend(self.waitlist.iter().map(|e| Event::WaitlistJoined {
            entry: e.value().clone(),
        }));
        events.extend(self.offers.iter().map(|o| Event::OfferCreated {
            offer: o.value().clone(),
            hold: None,
            notifications: Vec::new(),
        }));
        let pending = self.unsent_notifications();
        if !pending.is_empty() {
            events.push(Event::NotificationsQueued {
                notifications: pending,
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
