//! Booking, cancellation and attendance.
//!
//! Capacity accounting lives entirely under the schedule's write lock: the
//! check against `total_capacity`, the WAL append and the counter change
//! happen while it is held, so concurrent bookings on one schedule serialize
//! and a slot freed by a cancellation is visible to exactly the next booking.
//! Bookings on different schedules never contend.

use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::checks::*;
use super::{Engine, EngineError};

fn transition_error(r: &Reservation, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: r.id,
        from: r.status.as_str(),
        action,
    }
}

impl Engine {
    /// Book one slot on a schedule for a worker.
    ///
    /// Either the reservation is created and the schedule's `reserved_count`
    /// goes up by one, or neither happens.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        validate_text("worker_ref", &req.worker_ref, MAX_WORKER_REF_LEN)?;
        validate_exam_types(&req.exam_types)?;
        validate_contact(&req.contact)?;

        // The directory is external and may be slow; resolve before taking
        // the gate so a waiting compaction is not held up behind it.
        let worker_ref = self
            .directory
            .resolve(&req.worker_ref)
            .await
            .ok_or_else(|| EngineError::WorkerNotFound(req.worker_ref.clone()))?;

        let _gate = self.compaction_gate.read().await;

        let mut ss = self.schedule_write(&req.schedule_id).await?;
        if !ss.is_active {
            return Err(EngineError::InvalidTransition {
                id: ss.id,
                from: "inactive",
                action: "book",
            });
        }
        if !req.exam_types.is_subset(&ss.exam_types) {
            return Err(EngineError::validation(format!(
                "exam types {} not offered by schedule (offers {})",
                format_exam_types(&req.exam_types),
                format_exam_types(&ss.exam_types)
            )));
        }
        if let Some(existing) = ss.active_for_worker(&worker_ref) {
            return Err(EngineError::validation(format!(
                "worker {worker_ref} already holds reservation {} on this schedule",
                existing.number
            )));
        }
        // Authoritative capacity check: re-read under the write lock.
        if ss.is_full() {
            metrics::counter!(observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
            debug!("schedule {} full, rejecting {}", ss.id, req.id);
            return Err(EngineError::CapacityExceeded {
                schedule_id: ss.id,
                capacity: ss.total_capacity,
            });
        }

        // Claim the id across all schedules before anything becomes durable.
        match self.index.reservation_schedule.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(ss.id);
            }
        }
        let number = match self.claim_number(req.id, ss.window.start) {
            Ok(number) => number,
            Err(e) => {
                self.index.reservation_schedule.remove(&req.id);
                return Err(e);
            }
        };

        let event = Event::ReservationCreated {
            id: req.id,
            schedule_id: ss.id,
            worker_ref,
            number: number.clone(),
            exam_types: req.exam_types,
            delivery: req.delivery,
            contact: req.contact,
            at: now_ms(),
        };
        if let Err(e) = self.persist_schedule(&mut ss, &event).await {
            self.index.reservation_schedule.remove(&req.id);
            self.index.numbers.remove(&number);
            return Err(e);
        }

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {number} ({}) booked on schedule {}: {}/{}",
            req.id,
            ss.id,
            ss.reserved_count(),
            ss.total_capacity
        );
        ss.reservation(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))
    }

    /// Mint a reservation number nobody holds yet. Each attempt goes through
    /// the uniqueness index, so a collision only costs another draw.
    fn claim_number(&self, id: Ulid, session_start: Ms) -> Result<String, EngineError> {
        for _ in 0..MAX_NUMBER_ATTEMPTS {
            let number = self.numbering.mint(session_start);
            if let Entry::Vacant(slot) = self.index.numbers.entry(number.clone()) {
                slot.insert(id);
                return Ok(number);
            }
            debug!("reservation number {number} taken, drawing again");
        }
        Err(EngineError::ConcurrencyConflict(
            "could not mint a unique reservation number",
        ))
    }

    /// Cancel a reservation and give its slot back to the schedule.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        validate_optional_text("reason", reason.as_deref(), MAX_REASON_LEN)?;
        let mut ss = self.resolve_reservation_write(&id).await?;
        let current = ss.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(transition_error(current, "cancel"));
        }

        let event = Event::ReservationCancelled {
            id,
            schedule_id: ss.id,
            reason,
            at: now_ms(),
        };
        self.persist_schedule(&mut ss, &event).await?;
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(
            "reservation {id} cancelled, schedule {} at {}/{}",
            ss.id,
            ss.reserved_count(),
            ss.total_capacity
        );
        ss.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Record arrival. The slot stays taken.
    pub async fn check_in(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut ss = self.resolve_reservation_write(&id).await?;
        let current = ss.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::Reserved {
            return Err(transition_error(current, "check in"));
        }
        let event = Event::ReservationCheckedIn {
            id,
            schedule_id: ss.id,
            at: now_ms(),
        };
        self.persist_schedule(&mut ss, &event).await?;
        ss.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Record departure after a completed examination. Terminal; the visit
    /// keeps its historical slot.
    pub async fn check_out(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut ss = self.resolve_reservation_write(&id).await?;
        let current = ss.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if current.status != ReservationStatus::CheckedIn {
            return Err(transition_error(current, "check out"));
        }
        let event = Event::ReservationCheckedOut {
            id,
            schedule_id: ss.id,
            at: now_ms(),
        };
        self.persist_schedule(&mut ss, &event).await?;
        ss.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
