mod checks;
mod compact;
mod error;
mod plans;
mod queries;
mod reservations;
mod schedules;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::directory::WorkerDirectory;
use crate::model::*;
use crate::numbering::{ReservationNumbers, UlidNumbers};
use crate::wal::Wal;

pub type SharedPlan = Arc<RwLock<Plan>>;
pub type SharedScheduleState = Arc<RwLock<ScheduleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        // Compaction must observe every append acknowledged before it.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (this batch is reported failed as a whole).
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

// ── Secondary indexes ────────────────────────────────────

/// Lookups that span schedules. Written only while applying events.
#[derive(Default)]
pub(super) struct Index {
    /// Plan → its schedules, in creation order.
    pub plan_schedules: DashMap<Ulid, Vec<Ulid>>,
    /// Reservation → owning schedule.
    pub reservation_schedule: DashMap<Ulid, Ulid>,
    /// Reservation number → reservation. Guards number uniqueness.
    pub numbers: DashMap<String, Ulid>,
    /// Plan ids taken by an installed plan or a create still in flight.
    pub plan_claims: DashSet<Ulid>,
    /// Schedule ids, same as `plan_claims`.
    pub schedule_claims: DashSet<Ulid>,
}

/// Per-tenant examination scheduling engine.
///
/// Every plan and every schedule sits behind its own `RwLock`. A schedule's
/// `reserved_count` changes only while its write lock is held, after the
/// corresponding event is durable in the WAL. Locks are taken plan first,
/// then schedule, never the other way round.
pub struct Engine {
    pub(super) plans: DashMap<Ulid, SharedPlan>,
    pub(super) schedules: DashMap<Ulid, SharedScheduleState>,
    pub(super) index: Index,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot cannot miss an event that is durable but not yet applied.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) directory: Arc<dyn WorkerDirectory>,
    pub(super) numbering: Arc<dyn ReservationNumbers>,
}

fn plan_from_event(event: &Event) -> Option<Plan> {
    let Event::PlanCreated {
        id,
        year,
        name,
        targets,
        period,
        approver,
        notes,
        at,
    } = event
    else {
        return None;
    };
    Some(Plan {
        id: *id,
        year: *year,
        name: name.clone(),
        status: PlanStatus::Draft,
        targets: *targets,
        period: *period,
        approver: approver.clone(),
        notes: notes.clone(),
        created_at: *at,
        approved_at: None,
        started_at: None,
        completed_at: None,
        cancelled_at: None,
        cancellation_reason: None,
    })
}

fn schedule_from_event(event: &Event) -> Option<ScheduleState> {
    let Event::ScheduleCreated {
        id,
        plan_id,
        window,
        institution,
        exam_types,
        capacity,
    } = event
    else {
        return None;
    };
    Some(ScheduleState::new(
        *id,
        *plan_id,
        *window,
        institution.clone(),
        exam_types.clone(),
        *capacity,
    ))
}

/// Apply a plan event (caller holds the plan's write lock).
fn apply_to_plan(plan: &mut Plan, event: &Event) {
    match event {
        Event::PlanUpdated {
            name,
            targets,
            period,
            approver,
            notes,
            ..
        } => {
            plan.name = name.clone();
            plan.targets = *targets;
            plan.period = *period;
            plan.approver = approver.clone();
            plan.notes = notes.clone();
        }
        Event::PlanApproved { approver, at, .. } => {
            plan.status = PlanStatus::Approved;
            plan.approved_at = Some(*at);
            if approver.is_some() {
                plan.approver = approver.clone();
            }
        }
        Event::PlanStarted { at, .. } => {
            plan.status = PlanStatus::InProgress;
            plan.started_at = Some(*at);
        }
        Event::PlanCompleted { at, .. } => {
            plan.status = PlanStatus::Completed;
            plan.completed_at = Some(*at);
        }
        Event::PlanCancelled { reason, at, .. } => {
            plan.status = PlanStatus::Cancelled;
            plan.cancelled_at = Some(*at);
            plan.cancellation_reason = reason.clone();
        }
        _ => {}
    }
}

/// Apply a schedule or reservation event (caller holds the
/// schedule's write lock). The only writer of `reserved_count`.
fn apply_to_schedule(ss: &mut ScheduleState, event: &Event, index: &Index) {
    match event {
        Event::ScheduleCapacityUpdated { capacity, .. } => ss.total_capacity = *capacity,
        Event::ScheduleDeactivated { .. }
        | Event::PlanCompleted { .. }
        | Event::PlanCancelled { .. } => ss.is_active = false,
        Event::ScheduleReactivated { .. } => ss.is_active = true,
        Event::ReservationCreated {
            id,
            schedule_id,
            worker_ref,
            number,
            exam_types,
            delivery,
            contact,
            at,
        } => {
            ss.admit(Reservation {
                id: *id,
                schedule_id: *schedule_id,
                worker_ref: worker_ref.clone(),
                number: number.clone(),
                exam_types: exam_types.clone(),
                status: ReservationStatus::Reserved,
                reserved_at: *at,
                checked_in_at: None,
                checked_out_at: None,
                cancelled_at: None,
                cancellation_reason: None,
                delivery: *delivery,
                contact: contact.clone(),
            });
            index.reservation_schedule.insert(*id, *schedule_id);
            index.numbers.insert(number.clone(), *id);
        }
        Event::ReservationCheckedIn { id, at, .. } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.status = ReservationStatus::CheckedIn;
                r.checked_in_at = Some(*at);
            }
        }
        Event::ReservationCheckedOut { id, at, .. } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.status = ReservationStatus::CheckedOut;
                r.checked_out_at = Some(*at);
            }
        }
        Event::ReservationCancelled { id, reason, at, .. } => {
            ss.release(id, *at, reason.clone());
        }
        _ => {}
    }
}

/// The schedule a schedule-level or reservation-level event belongs to.
fn event_schedule_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ScheduleCapacityUpdated { id, .. }
        | Event::ScheduleDeactivated { id }
        | Event::ScheduleReactivated { id } => Some(*id),
        Event::ReservationCreated { schedule_id, .. }
        | Event::ReservationCheckedIn { schedule_id, .. }
        | Event::ReservationCheckedOut { schedule_id, .. }
        | Event::ReservationCancelled { schedule_id, .. } => Some(*schedule_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, directory: Arc<dyn WorkerDirectory>) -> io::Result<Self> {
        Self::with_numbering(wal_path, directory, Arc::new(UlidNumbers))
    }

    pub fn with_numbering(
        wal_path: PathBuf,
        directory: Arc<dyn WorkerDirectory>,
        numbering: Arc<dyn ReservationNumbers>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            plans: DashMap::new(),
            schedules: DashMap::new(),
            index: Index::default(),
            wal_tx,
            compaction_gate: RwLock::new(()),
            directory,
            numbering,
        };
        // We're the sole owner of every lock here, so try_read/try_write always
        // succeed. Never block: this may run inside an async context (lazy
        // tenant creation).
        for event in &events {
            engine.replay_event(event);
        }
        tracing::debug!(
            "replayed {} events: {} plans, {} schedules, {} reservations",
            events.len(),
            engine.plans.len(),
            engine.schedules.len(),
            engine.index.reservation_schedule.len()
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::PlanCreated { .. } => self.install_plan(event),
            Event::ScheduleCreated { .. } => self.install_schedule(event),
            Event::PlanUpdated { id, .. }
            | Event::PlanApproved { id, .. }
            | Event::PlanStarted { id, .. }
            | Event::PlanCompleted { id, .. }
            | Event::PlanCancelled { id, .. } => {
                if let Some(plan) = self.get_plan_state(id)
                    && let Ok(mut guard) = plan.try_write()
                {
                    apply_to_plan(&mut guard, event);
                }
                if matches!(event, Event::PlanCompleted { .. } | Event::PlanCancelled { .. }) {
                    for sid in self.schedule_ids_of(id) {
                        if let Some(ss) = self.get_schedule_state(&sid)
                            && let Ok(mut guard) = ss.try_write()
                        {
                            apply_to_schedule(&mut guard, event, &self.index);
                        }
                    }
                }
            }
            other => {
                if let Some(sid) = event_schedule_id(other)
                    && let Some(ss) = self.get_schedule_state(&sid)
                    && let Ok(mut guard) = ss.try_write()
                {
                    apply_to_schedule(&mut guard, other, &self.index);
                }
            }
        }
    }

    /// Insert a freshly created plan. Caller has already made the event durable.
    pub(super) fn install_plan(&self, event: &Event) {
        if let Some(plan) = plan_from_event(event) {
            self.index.plan_claims.insert(plan.id);
            self.plans.insert(plan.id, Arc::new(RwLock::new(plan)));
        }
    }

    /// Insert a freshly created schedule. Caller has already made the event durable.
    pub(super) fn install_schedule(&self, event: &Event) {
        if let Some(ss) = schedule_from_event(event) {
            let (id, plan_id) = (ss.id, ss.plan_id);
            self.index.schedule_claims.insert(id);
            self.schedules.insert(id, Arc::new(RwLock::new(ss)));
            self.index.plan_schedules.entry(plan_id).or_default().push(id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_plan_state(&self, id: &Ulid) -> Option<SharedPlan> {
        self.plans.get(id).map(|e| e.value().clone())
    }

    pub fn get_schedule_state(&self, id: &Ulid) -> Option<SharedScheduleState> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub fn schedule_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.index
            .reservation_schedule
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub(super) fn schedule_ids_of(&self, plan_id: &Ulid) -> Vec<Ulid> {
        self.index
            .plan_schedules
            .get(plan_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// WAL-append + apply in one call, under the plan's write lock.
    pub(super) async fn persist_plan(&self, plan: &mut Plan, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_plan(plan, event);
        Ok(())
    }

    /// WAL-append + apply in one call, under the schedule's write lock.
    pub(super) async fn persist_schedule(
        &self,
        ss: &mut ScheduleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_schedule(ss, event, &self.index);
        Ok(())
    }

    /// Lookup plan, acquire its write lock.
    pub(super) async fn plan_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Plan>, EngineError> {
        let plan = self.get_plan_state(id).ok_or(EngineError::NotFound(*id))?;
        Ok(plan.write_owned().await)
    }

    /// Lookup schedule, acquire its write lock.
    pub(super) async fn schedule_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ScheduleState>, EngineError> {
        let ss = self.get_schedule_state(id).ok_or(EngineError::NotFound(*id))?;
        Ok(ss.write_owned().await)
    }

    /// Lookup reservation → schedule, acquire the schedule's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ScheduleState>, EngineError> {
        let schedule_id = self
            .schedule_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = self.schedule_write(&schedule_id).await?;
        if guard.reservation(reservation_id).is_none() {
            // Id claimed by a booking still in flight (or one that failed).
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok(guard)
    }
}
