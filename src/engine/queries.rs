use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedScheduleState};

impl Engine {
    pub async fn get_plan(&self, id: Ulid) -> Result<Plan, EngineError> {
        let plan = self.get_plan_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = plan.read().await;
        Ok(guard.clone())
    }

    /// All plans, optionally for one year, oldest first.
    pub async fn list_plans(&self, year: Option<i32>) -> Vec<Plan> {
        let shared: Vec<_> = self.plans.iter().map(|e| e.value().clone()).collect();
        let mut plans = Vec::with_capacity(shared.len());
        for plan in shared {
            let guard = plan.read().await;
            if year.is_none_or(|y| guard.year == y) {
                plans.push(guard.clone());
            }
        }
        plans.sort_by_key(|p| p.id);
        plans
    }

    pub async fn get_schedule(&self, id: Ulid) -> Result<ScheduleInfo, EngineError> {
        let ss = self.get_schedule_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        Ok(guard.info())
    }

    fn plan_schedule_states(&self, plan_id: &Ulid) -> Result<Vec<SharedScheduleState>, EngineError> {
        if !self.plans.contains_key(plan_id) {
            return Err(EngineError::NotFound(*plan_id));
        }
        Ok(self
            .schedule_ids_of(plan_id)
            .iter()
            .filter_map(|sid| self.get_schedule_state(sid))
            .collect())
    }

    /// Schedules of a plan in creation order.
    pub async fn list_schedules(&self, plan_id: Ulid) -> Result<Vec<ScheduleInfo>, EngineError> {
        let mut out = Vec::new();
        for ss in self.plan_schedule_states(&plan_id)? {
            out.push(ss.read().await.info());
        }
        Ok(out)
    }

    /// Remaining slots, for display. Bookings re-check under the write lock.
    pub async fn availability(&self, schedule_id: Ulid) -> Result<u32, EngineError> {
        let ss = self
            .get_schedule_state(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let guard = ss.read().await;
        Ok(guard.available())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let sid = self
            .schedule_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ss = self.get_schedule_state(&sid).ok_or(EngineError::NotFound(sid))?;
        let guard = ss.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn get_reservation_by_number(&self, number: &str) -> Option<Reservation> {
        let id = self.index.numbers.get(number).map(|e| *e.value())?;
        self.get_reservation(id).await.ok()
    }

    /// Every reservation ever made on a schedule, cancelled ones included.
    pub async fn list_reservations(&self, schedule_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let ss = self
            .get_schedule_state(&schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;
        let guard = ss.read().await;
        Ok(guard.reservations().cloned().collect())
    }

    /// A worker's reservations across all schedules, oldest first.
    pub async fn list_reservations_for_worker(&self, worker_ref: &str) -> Vec<Reservation> {
        let shared: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ss in shared {
            let guard = ss.read().await;
            out.extend(
                guard
                    .reservations()
                    .filter(|r| r.worker_ref == worker_ref)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Roll up a plan's schedules against its head-count target.
    pub async fn plan_progress(&self, plan_id: Ulid) -> Result<PlanProgress, EngineError> {
        let plan = self.get_plan(plan_id).await?;
        let mut progress = PlanProgress {
            plan_id,
            status: plan.status,
            target_total: plan.targets.total,
            schedules: 0,
            capacity: 0,
            reserved: 0,
            completed: 0,
        };
        for ss in self.plan_schedule_states(&plan_id)? {
            let guard = ss.read().await;
            progress.schedules += 1;
            progress.capacity += u64::from(guard.total_capacity);
            progress.reserved += u64::from(guard.reserved_count());
            progress.completed += guard
                .reservations()
                .filter(|r| r.status == ReservationStatus::CheckedOut)
                .count() as u64;
        }
        Ok(progress)
    }
}
