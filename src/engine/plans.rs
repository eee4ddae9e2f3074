use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::checks::*;
use super::{Engine, EngineError};

fn transition_error(plan: &Plan, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: plan.id,
        from: plan.status.as_str(),
        action,
    }
}

impl Engine {
    pub async fn create_plan(&self, req: NewPlan) -> Result<Plan, EngineError> {
        let _gate = self.compaction_gate.read().await;
        if self.plans.len() >= MAX_PLANS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many plans"));
        }
        validate_year(req.year)?;
        validate_text("name", &req.name, MAX_NAME_LEN)?;
        validate_targets(&req.targets)?;
        let period = validate_span(req.period_start, req.period_end, "plan period")?;
        validate_period(req.year, &period)?;
        validate_optional_text("approver", req.approver.as_deref(), MAX_NAME_LEN)?;
        validate_optional_text("notes", req.notes.as_deref(), MAX_NOTES_LEN)?;
        // Claim the id before anything becomes durable; concurrent creates
        // with the same id lose here.
        if !self.index.plan_claims.insert(req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let event = Event::PlanCreated {
            id: req.id,
            year: req.year,
            name: req.name,
            targets: req.targets,
            period,
            approver: req.approver,
            notes: req.notes,
            at: now_ms(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.index.plan_claims.remove(&req.id);
            return Err(e);
        }
        self.install_plan(&event);
        info!("plan {} created for {}", req.id, req.year);
        self.get_plan(req.id).await
    }

    /// Amend a draft. Structural edits after approval are not supported.
    pub async fn update_plan(&self, id: Ulid, changes: PlanChanges) -> Result<Plan, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut plan = self.plan_write(&id).await?;
        if plan.status != PlanStatus::Draft {
            return Err(transition_error(&plan, "amend"));
        }
        if changes.is_empty() {
            return Ok(plan.clone());
        }

        let name = changes.name.unwrap_or_else(|| plan.name.clone());
        let targets = Targets {
            total: changes.target_total.unwrap_or(plan.targets.total),
            general: changes.target_general.unwrap_or(plan.targets.general),
            special: changes.target_special.unwrap_or(plan.targets.special),
            night_work: changes.target_night.unwrap_or(plan.targets.night_work),
        };
        let period = validate_span(
            changes.period_start.unwrap_or(plan.period.start),
            changes.period_end.unwrap_or(plan.period.end),
            "plan period",
        )?;
        let approver = changes.approver.or_else(|| plan.approver.clone());
        let notes = changes.notes.or_else(|| plan.notes.clone());

        validate_text("name", &name, MAX_NAME_LEN)?;
        validate_targets(&targets)?;
        validate_period(plan.year, &period)?;
        validate_optional_text("approver", approver.as_deref(), MAX_NAME_LEN)?;
        validate_optional_text("notes", notes.as_deref(), MAX_NOTES_LEN)?;

        let event = Event::PlanUpdated {
            id,
            name,
            targets,
            period,
            approver,
            notes,
        };
        self.persist_plan(&mut plan, &event).await?;
        Ok(plan.clone())
    }

    pub async fn approve_plan(&self, id: Ulid, approver: Option<String>) -> Result<Plan, EngineError> {
        let _gate = self.compaction_gate.read().await;
        validate_optional_text("approver", approver.as_deref(), MAX_NAME_LEN)?;
        let mut plan = self.plan_write(&id).await?;
        if plan.status != PlanStatus::Draft {
            return Err(transition_error(&plan, "approve"));
        }
        let event = Event::PlanApproved {
            id,
            approver,
            at: now_ms(),
        };
        self.persist_plan(&mut plan, &event).await?;
        info!("plan {id} approved");
        Ok(plan.clone())
    }

    pub async fn start_plan(&self, id: Ulid) -> Result<Plan, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut plan = self.plan_write(&id).await?;
        if plan.status != PlanStatus::Approved {
            return Err(transition_error(&plan, "start"));
        }
        let event = Event::PlanStarted { id, at: now_ms() };
        self.persist_plan(&mut plan, &event).await?;
        info!("plan {id} in progress");
        Ok(plan.clone())
    }

    /// Finish the plan's campaign. Its schedules stop taking bookings;
    /// existing reservations can still be checked in and out.
    pub async fn complete_plan(&self, id: Ulid) -> Result<Plan, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut plan = self.plan_write(&id).await?;
        if plan.status != PlanStatus::InProgress {
            return Err(transition_error(&plan, "complete"));
        }
        let event = Event::PlanCompleted { id, at: now_ms() };
        self.persist_plan(&mut plan, &event).await?;
        self.close_schedules(id, &event).await;
        info!("plan {id} completed");
        Ok(plan.clone())
    }

    /// Cancel the plan. Plans are never deleted; their schedules stop taking
    /// bookings.
    pub async fn cancel_plan(&self, id: Ulid, reason: Option<String>) -> Result<Plan, EngineError> {
        let _gate = self.compaction_gate.read().await;
        validate_optional_text("reason", reason.as_deref(), MAX_REASON_LEN)?;
        let mut plan = self.plan_write(&id).await?;
        if matches!(plan.status, PlanStatus::Completed | PlanStatus::Cancelled) {
            return Err(transition_error(&plan, "cancel"));
        }
        let event = Event::PlanCancelled {
            id,
            reason,
            at: now_ms(),
        };
        self.persist_plan(&mut plan, &event).await?;
        self.close_schedules(id, &event).await;
        info!("plan {id} cancelled");
        Ok(plan.clone())
    }

    /// Apply a plan-closing event to each of the plan's schedules. The event
    /// is already durable; the caller holds the plan's write lock, which keeps
    /// new schedules out while we go.
    async fn close_schedules(&self, plan_id: Ulid, event: &Event) {
        for sid in self.schedule_ids_of(&plan_id) {
            if let Some(ss) = self.get_schedule_state(&sid) {
                let mut guard = ss.write().await;
                super::apply_to_schedule(&mut guard, event, &self.index);
            }
        }
    }
}
