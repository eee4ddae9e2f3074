use chrono::DateTime;
use ulid::Ulid;

use crate::model::Ms;

/// Source of human-legible reservation numbers. Uniqueness is enforced by
/// the engine, which draws again on a collision.
pub trait ReservationNumbers: Send + Sync {
    fn mint(&self, session_start: Ms) -> String;
}

/// `EX-<session date>-<10 random Crockford base32 chars>`, e.g.
/// `EX-20260302-7ZQ4M0C1RX`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidNumbers;

impl ReservationNumbers for UlidNumbers {
    fn mint(&self, session_start: Ms) -> String {
        let date = DateTime::from_timestamp_millis(session_start)
            .map(|dt| dt.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "00000000".into());
        // The last 16 chars of a ULID are randomness; keep 10 of them.
        let ulid = Ulid::new().to_string();
        format!("EX-{date}-{}", &ulid[16..])
    }
}
