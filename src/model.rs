use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Callers validate `start < end` before building spans from user input.
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Returned when a textual enum value does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

fn unknown<T>(kind: &'static str, value: &str) -> Result<T, UnknownVariant> {
    Err(UnknownVariant {
        kind,
        value: value.to_string(),
    })
}

// ── Plans ────────────────────────────────────────────────────────

/// `Draft → Approved → InProgress → Completed`; `Cancelled` from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanStatus {
    Draft,
    Approved,
    InProgress,
    Completed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Approved => "approved",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    /// Schedules can be created (and stay bookable) only under these states.
    pub fn accepts_schedules(&self) -> bool {
        matches!(self, PlanStatus::Approved | PlanStatus::InProgress)
    }
}

impl FromStr for PlanStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(PlanStatus::Draft),
            "approved" => Ok(PlanStatus::Approved),
            "in_progress" => Ok(PlanStatus::InProgress),
            "completed" => Ok(PlanStatus::Completed),
            "cancelled" | "canceled" => Ok(PlanStatus::Cancelled),
            other => unknown("plan status", other),
        }
    }
}

/// Head-count targets of a yearly plan. Informational until approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    pub total: u32,
    pub general: u32,
    pub special: u32,
    pub night_work: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: Ulid,
    pub year: i32,
    pub name: String,
    pub status: PlanStatus,
    pub targets: Targets,
    pub period: Span,
    pub approver: Option<String>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub approved_at: Option<Ms>,
    pub started_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
}

// ── Exam types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExamType {
    General,
    Special,
    PrePlacement,
    Occasional,
    NightWork,
}

impl ExamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamType::General => "general",
            ExamType::Special => "special",
            ExamType::PrePlacement => "pre_placement",
            ExamType::Occasional => "occasional",
            ExamType::NightWork => "night_work",
        }
    }
}

impl FromStr for ExamType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "general" => Ok(ExamType::General),
            "special" => Ok(ExamType::Special),
            "pre_placement" | "placement" => Ok(ExamType::PrePlacement),
            "occasional" => Ok(ExamType::Occasional),
            "night_work" | "night" => Ok(ExamType::NightWork),
            other => unknown("exam type", other),
        }
    }
}

pub type ExamTypes = BTreeSet<ExamType>;

/// Parse a comma-separated exam-type list. Blank entries are skipped, so
/// `""` yields an empty set and the caller decides whether that is allowed.
pub fn parse_exam_types(s: &str) -> Result<ExamTypes, UnknownVariant> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ExamType::from_str)
        .collect()
}

pub fn format_exam_types(types: &ExamTypes) -> String {
    types
        .iter()
        .map(ExamType::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

// ── Schedules ────────────────────────────────────────────────────

/// The examining institution (clinic, mobile unit) running a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub id: Ulid,
    pub plan_id: Ulid,
    pub window: Span,
    pub institution: Institution,
    pub exam_types: ExamTypes,
    pub total_capacity: u32,
    pub is_active: bool,
    /// Number of reservations whose status is not `Cancelled`.
    reserved_count: u32,
    /// Every reservation ever made against this schedule, keyed (and so
    /// ordered) by ULID. Cancelled ones stay for the audit trail.
    reservations: BTreeMap<Ulid, Reservation>,
}

impl ScheduleState {
    pub fn new(
        id: Ulid,
        plan_id: Ulid,
        window: Span,
        institution: Institution,
        exam_types: ExamTypes,
        total_capacity: u32,
    ) -> Self {
        Self {
            id,
            plan_id,
            window,
            institution,
            exam_types,
            total_capacity,
            is_active: true,
            reserved_count: 0,
            reservations: BTreeMap::new(),
        }
    }

    pub fn reserved_count(&self) -> u32 {
        self.reserved_count
    }

    /// Remaining slots. Display only: booking decisions re-check under the write lock.
    pub fn available(&self) -> u32 {
        self.total_capacity.saturating_sub(self.reserved_count)
    }

    pub fn is_full(&self) -> bool {
        self.reserved_count >= self.total_capacity
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    pub(crate) fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.get_mut(id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn reservation_len(&self) -> usize {
        self.reservations.len()
    }

    /// The worker's slot-holding reservation on this schedule, if any.
    pub fn active_for_worker(&self, worker_ref: &str) -> Option<&Reservation> {
        self.reservations
            .values()
            .find(|r| r.status.holds_slot() && r.worker_ref == worker_ref)
    }

    /// Recount slot-holding reservations from scratch.
    pub fn count_holding(&self) -> u32 {
        self.reservations
            .values()
            .filter(|r| r.status.holds_slot())
            .count() as u32
    }

    /// Record a new reservation and take its slot.
    pub(crate) fn admit(&mut self, reservation: Reservation) {
        if reservation.status.holds_slot() {
            self.reserved_count += 1;
        }
        self.reservations.insert(reservation.id, reservation);
    }

    /// Mark a reservation cancelled and give its slot back. Returns false
    /// (and changes nothing) when it was not holding a slot.
    pub(crate) fn release(&mut self, id: &Ulid, at: Ms, reason: Option<String>) -> bool {
        let Some(r) = self.reservations.get_mut(id) else {
            return false;
        };
        if !r.status.holds_slot() {
            return false;
        }
        r.status = ReservationStatus::Cancelled;
        r.cancelled_at = Some(at);
        r.cancellation_reason = reason;
        self.reserved_count -= 1;
        true
    }

    pub fn info(&self) -> ScheduleInfo {
        ScheduleInfo {
            id: self.id,
            plan_id: self.plan_id,
            window: self.window,
            institution: self.institution.clone(),
            exam_types: self.exam_types.clone(),
            total_capacity: self.total_capacity,
            reserved_count: self.reserved_count,
            is_active: self.is_active,
        }
    }
}

// ── Reservations ─────────────────────────────────────────────────

/// `Reserved → CheckedIn → CheckedOut`; `Cancelled` from Reserved or CheckedIn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Reserved,
    CheckedIn,
    CheckedOut,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::CheckedIn => "checked_in",
            ReservationStatus::CheckedOut => "checked_out",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Everything except a cancellation keeps occupying the session slot,
    /// including a completed visit.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::CheckedOut | ReservationStatus::Cancelled)
    }
}

impl FromStr for ReservationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reserved" => Ok(ReservationStatus::Reserved),
            "checked_in" => Ok(ReservationStatus::CheckedIn),
            "checked_out" => Ok(ReservationStatus::CheckedOut),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            other => unknown("reservation status", other),
        }
    }
}

/// How the examination results reach the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    Email,
    Post,
    #[default]
    InPerson,
}

impl Delivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Email => "email",
            Delivery::Post => "post",
            Delivery::InPerson => "in_person",
        }
    }
}

impl FromStr for Delivery {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "email" => Ok(Delivery::Email),
            "post" | "mail" => Ok(Delivery::Post),
            "in_person" | "pickup" => Ok(Delivery::InPerson),
            other => unknown("delivery", other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub worker_ref: String,
    /// Human-legible, unique within a tenant.
    pub number: String,
    pub exam_types: ExamTypes,
    pub status: ReservationStatus,
    pub reserved_at: Ms,
    pub checked_in_at: Option<Ms>,
    pub checked_out_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
    pub delivery: Delivery,
    pub contact: Contact,
}

/// The event types. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PlanCreated {
        id: Ulid,
        year: i32,
        name: String,
        targets: Targets,
        period: Span,
        approver: Option<String>,
        notes: Option<String>,
        at: Ms,
    },
    PlanUpdated {
        id: Ulid,
        name: String,
        targets: Targets,
        period: Span,
        approver: Option<String>,
        notes: Option<String>,
    },
    PlanApproved {
        id: Ulid,
        approver: Option<String>,
        at: Ms,
    },
    PlanStarted {
        id: Ulid,
        at: Ms,
    },
    /// Also closes every schedule of the plan for booking.
    PlanCompleted {
        id: Ulid,
        at: Ms,
    },
    /// Also closes every schedule of the plan for booking.
    PlanCancelled {
        id: Ulid,
        reason: Option<String>,
        at: Ms,
    },
    ScheduleCreated {
        id: Ulid,
        plan_id: Ulid,
        window: Span,
        institution: Institution,
        exam_types: ExamTypes,
        capacity: u32,
    },
    ScheduleCapacityUpdated {
        id: Ulid,
        capacity: u32,
    },
    ScheduleDeactivated {
        id: Ulid,
    },
    ScheduleReactivated {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        schedule_id: Ulid,
        worker_ref: String,
        number: String,
        exam_types: ExamTypes,
        delivery: Delivery,
        contact: Contact,
        at: Ms,
    },
    ReservationCheckedIn {
        id: Ulid,
        schedule_id: Ulid,
        at: Ms,
    },
    ReservationCheckedOut {
        id: Ulid,
        schedule_id: Ulid,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        schedule_id: Ulid,
        reason: Option<String>,
        at: Ms,
    },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPlan {
    pub id: Ulid,
    pub year: i32,
    pub name: String,
    pub targets: Targets,
    pub period_start: Ms,
    pub period_end: Ms,
    pub approver: Option<String>,
    pub notes: Option<String>,
}

/// Field-wise amendment of a draft plan; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanChanges {
    pub name: Option<String>,
    pub target_total: Option<u32>,
    pub target_general: Option<u32>,
    pub target_special: Option<u32>,
    pub target_night: Option<u32>,
    pub period_start: Option<Ms>,
    pub period_end: Option<Ms>,
    pub approver: Option<String>,
    pub notes: Option<String>,
}

impl PlanChanges {
    pub fn is_empty(&self) -> bool {
        *self == PlanChanges::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchedule {
    pub id: Ulid,
    pub plan_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub institution: Institution,
    pub exam_types: ExamTypes,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub worker_ref: String,
    pub exam_types: ExamTypes,
    pub delivery: Delivery,
    pub contact: Contact,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub id: Ulid,
    pub plan_id: Ulid,
    pub window: Span,
    pub institution: Institution,
    pub exam_types: ExamTypes,
    pub total_capacity: u32,
    pub reserved_count: u32,
    pub is_active: bool,
}

impl ScheduleInfo {
    pub fn available(&self) -> u32 {
        self.total_capacity.saturating_sub(self.reserved_count)
    }
}

/// Read-only roll-up of a plan against its targets.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanProgress {
    pub plan_id: Ulid,
    pub status: PlanStatus,
    pub target_total: u32,
    pub schedules: usize,
    pub capacity: u64,
    pub reserved: u64,
    pub completed: u64,
}

impl PlanProgress {
    /// Reserved slots as a percentage of summed capacity.
    pub fn occupancy_pct(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.reserved as f64 * 100.0 / self.capacity as f64
    }
}
