use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

/// Events that rebuild a plan's status on top of its `PlanCreated`.
fn plan_status_events(plan: &Plan) -> Vec<Event> {
    let mut events = Vec::new();
    if let Some(at) = plan.approved_at {
        events.push(Event::PlanApproved {
            id: plan.id,
            approver: plan.approver.clone(),
            at,
        });
    }
    if let Some(at) = plan.started_at {
        events.push(Event::PlanStarted { id: plan.id, at });
    }
    match plan.status {
        PlanStatus::Completed => events.push(Event::PlanCompleted {
            id: plan.id,
            at: plan.completed_at.unwrap_or(plan.created_at),
        }),
        PlanStatus::Cancelled => events.push(Event::PlanCancelled {
            id: plan.id,
            reason: plan.cancellation_reason.clone(),
            at: plan.cancelled_at.unwrap_or(plan.created_at),
        }),
        _ => {}
    }
    events
}

/// Events that rebuild one reservation, lifecycle included.
fn reservation_events(r: &Reservation) -> Vec<Event> {
    let mut events = vec![Event::ReservationCreated {
        id: r.id,
        schedule_id: r.schedule_id,
        worker_ref: r.worker_ref.clone(),
        number: r.number.clone(),
        exam_types: r.exam_types.clone(),
        delivery: r.delivery,
        contact: r.contact.clone(),
        at: r.reserved_at,
    }];
    if let Some(at) = r.checked_in_at {
        events.push(Event::ReservationCheckedIn {
            id: r.id,
            schedule_id: r.schedule_id,
            at,
        });
    }
    if let Some(at) = r.checked_out_at {
        events.push(Event::ReservationCheckedOut {
            id: r.id,
            schedule_id: r.schedule_id,
            at,
        });
    }
    if r.status == ReservationStatus::Cancelled {
        events.push(Event::ReservationCancelled {
            id: r.id,
            schedule_id: r.schedule_id,
            reason: r.cancellation_reason.clone(),
            at: r.cancelled_at.unwrap_or(r.reserved_at),
        });
    }
    events
}

impl Engine {
    /// Snapshot the current state as the minimal event list that recreates it.
    ///
    /// Per plan: creation, its schedules (each with reservations), then the
    /// plan's status chain, so a closing event deactivates the schedules
    /// that precede it on replay.
    pub(super) async fn snapshot_events(&self) -> Vec<Event> {
        let mut plans: Vec<_> = self.plans.iter().map(|e| (*e.key(), e.value().clone())).collect();
        plans.sort_by_key(|(id, _)| *id);

        let mut events = Vec::new();
        for (plan_id, plan) in plans {
            let plan = plan.read().await;
            events.push(Event::PlanCreated {
                id: plan.id,
                year: plan.year,
                name: plan.name.clone(),
                targets: plan.targets,
                period: plan.period,
                approver: plan.approver.clone(),
                notes: plan.notes.clone(),
                at: plan.created_at,
            });

            for sid in self.schedule_ids_of(&plan_id) {
                let Some(ss) = self.get_schedule_state(&sid) else {
                    continue;
                };
                let ss = ss.read().await;
                events.push(Event::ScheduleCreated {
                    id: ss.id,
                    plan_id: ss.plan_id,
                    window: ss.window,
                    institution: ss.institution.clone(),
                    exam_types: ss.exam_types.clone(),
                    capacity: ss.total_capacity,
                });
                for r in ss.reservations() {
                    events.extend(reservation_events(r));
                }
                if !ss.is_active && plan.status.accepts_schedules() {
                    events.push(Event::ScheduleDeactivated { id: ss.id });
                }
            }

            events.extend(plan_status_events(&plan));
        }
        events
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Mutations wait while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("WAL compacted to {count} events");
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
