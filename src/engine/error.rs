use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input; the caller has to correct it.
    Validation(String),
    NotFound(Ulid),
    WorkerNotFound(String),
    AlreadyExists(Ulid),
    /// State-machine violation, e.g. check-out before check-in.
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        action: &'static str,
    },
    /// The session is fully booked.
    CapacityExceeded { schedule_id: Ulid, capacity: u32 },
    /// Bounded internal retries ran out; transient.
    ConcurrencyConflict(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::WorkerNotFound(w) => write!(f, "worker not found: {w}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} {id}: status is {from}")
            }
            EngineError::CapacityExceeded {
                schedule_id,
                capacity,
            } => {
                write!(f, "schedule {schedule_id} fully booked: all {capacity} slots taken")
            }
            EngineError::ConcurrencyConflict(msg) => write!(f, "concurrency conflict: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
