use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::checks::*;
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_schedule(&self, req: NewSchedule) -> Result<ScheduleInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        validate_capacity(req.capacity)?;
        validate_exam_types(&req.exam_types)?;
        let window = validate_session_window(req.start, req.end)?;
        validate_text("institution", &req.institution.name, MAX_NAME_LEN)?;
        validate_optional_text(
            "institution address",
            req.institution.address.as_deref(),
            MAX_CONTACT_FIELD_LEN,
        )?;
        validate_optional_text(
            "institution phone",
            req.institution.phone.as_deref(),
            MAX_CONTACT_FIELD_LEN,
        )?;

        let plan = self
            .get_plan_state(&req.plan_id)
            .ok_or(EngineError::NotFound(req.plan_id))?;
        // Held until the schedule is installed so a concurrent cancel/complete
        // cannot miss it.
        let plan = plan.read().await;
        if !plan.status.accepts_schedules() {
            return Err(EngineError::InvalidTransition {
                id: plan.id,
                from: plan.status.as_str(),
                action: "add a schedule to",
            });
        }
        if !plan.period.contains_instant(window.start) {
            return Err(EngineError::validation("session starts outside the plan period"));
        }
        if self.schedule_ids_of(&plan.id).len() >= MAX_SCHEDULES_PER_PLAN {
            return Err(EngineError::LimitExceeded("too many schedules in plan"));
        }
        if !self.index.schedule_claims.insert(req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let event = Event::ScheduleCreated {
            id: req.id,
            plan_id: req.plan_id,
            window,
            institution: req.institution,
            exam_types: req.exam_types,
            capacity: req.capacity,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.index.schedule_claims.remove(&req.id);
            return Err(e);
        }
        self.install_schedule(&event);
        drop(plan);
        info!(
            "schedule {} created under plan {} with {} slots",
            req.id, req.plan_id, req.capacity
        );
        self.get_schedule(req.id).await
    }

    /// Change total capacity. Never below the slots already taken.
    pub async fn update_capacity(&self, id: Ulid, capacity: u32) -> Result<ScheduleInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        validate_capacity(capacity)?;
        let mut ss = self.schedule_write(&id).await?;
        if capacity < ss.reserved_count() {
            return Err(EngineError::validation(format!(
                "capacity {capacity} below the {} slots already reserved",
                ss.reserved_count()
            )));
        }
        if capacity == ss.total_capacity {
            return Ok(ss.info());
        }
        let event = Event::ScheduleCapacityUpdated { id, capacity };
        self.persist_schedule(&mut ss, &event).await?;
        info!("schedule {id} capacity set to {capacity}");
        Ok(ss.info())
    }

    /// Stop taking bookings. Existing reservations are untouched.
    pub async fn deactivate_schedule(&self, id: Ulid) -> Result<ScheduleInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut ss = self.schedule_write(&id).await?;
        if !ss.is_active {
            return Ok(ss.info());
        }
        let event = Event::ScheduleDeactivated { id };
        self.persist_schedule(&mut ss, &event).await?;
        info!("schedule {id} deactivated");
        Ok(ss.info())
    }

    /// Re-open a deactivated schedule while its plan still accepts schedules.
    pub async fn reactivate_schedule(&self, id: Ulid) -> Result<ScheduleInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let plan_id = self
            .get_schedule_state(&id)
            .ok_or(EngineError::NotFound(id))?
            .read()
            .await
            .plan_id;
        let plan = self
            .get_plan_state(&plan_id)
            .ok_or(EngineError::NotFound(plan_id))?;
        let plan = plan.read().await;
        if !plan.status.accepts_schedules() {
            return Err(EngineError::InvalidTransition {
                id: plan.id,
                from: plan.status.as_str(),
                action: "reopen a schedule of",
            });
        }
        let mut ss = self.schedule_write(&id).await?;
        if ss.is_active {
            return Ok(ss.info());
        }
        let event = Event::ScheduleReactivated { id };
        self.persist_schedule(&mut ss, &event).await?;
        info!("schedule {id} reactivated");
        Ok(ss.info())
    }
}
