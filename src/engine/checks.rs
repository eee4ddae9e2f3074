use chrono::{DateTime, Datelike};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Calendar year of a timestamp (UTC).
pub(crate) fn year_of(t: Ms) -> Option<i32> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.year())
}

pub(crate) fn validate_span(start: Ms, end: Ms, what: &str) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::validation(format!("{what}: start must be before end")));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_session_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = validate_span(start, end, "session window")?;
    if window.duration_ms() > MAX_SESSION_DURATION_MS {
        return Err(EngineError::validation("session window longer than a day"));
    }
    Ok(window)
}

pub(crate) fn validate_year(year: i32) -> Result<(), EngineError> {
    if !(MIN_PLAN_YEAR..=MAX_PLAN_YEAR).contains(&year) {
        return Err(EngineError::validation(format!(
            "year {year} outside {MIN_PLAN_YEAR}..={MAX_PLAN_YEAR}"
        )));
    }
    Ok(())
}

/// The period must start inside the plan's own year.
pub(crate) fn validate_period(year: i32, period: &Span) -> Result<(), EngineError> {
    if year_of(period.start) != Some(year) {
        return Err(EngineError::validation(format!(
            "plan period must start within {year}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_targets(targets: &Targets) -> Result<(), EngineError> {
    if targets.total == 0 {
        return Err(EngineError::validation("target total must be positive"));
    }
    let all = [targets.total, targets.general, targets.special, targets.night_work];
    if all.iter().any(|&t| t > MAX_TARGET_COUNT) {
        return Err(EngineError::LimitExceeded("target count too large"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::validation("capacity must be positive"));
    }
    if capacity > MAX_SCHEDULE_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

pub(crate) fn validate_exam_types(types: &ExamTypes) -> Result<(), EngineError> {
    if types.is_empty() {
        return Err(EngineError::validation("exam type set is empty"));
    }
    Ok(())
}

/// Required text: non-blank and bounded.
pub(crate) fn validate_text(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} is empty")));
    }
    validate_optional_text(field, Some(value), max)
}

pub(crate) fn validate_optional_text(
    field: &str,
    value: Option<&str>,
    max: usize,
) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::validation(format!(
            "{field} longer than {max} bytes"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn validate_contact(contact: &Contact) -> Result<(), EngineError> {
    validate_optional_text("phone", contact.phone.as_deref(), MAX_CONTACT_FIELD_LEN)?;
    validate_optional_text("email", contact.email.as_deref(), MAX_CONTACT_FIELD_LEN)?;
    validate_optional_text("address", contact.address.as_deref(), MAX_CONTACT_FIELD_LEN)?;
    if let Some(email) = &contact.email
        && !email.contains('@')
    {
        return Err(EngineError::validation(format!("malformed email: {email}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-03-02T09:00:00Z
    const T: Ms = 1_772_442_000_000;

    #[test]
    fn span_must_be_ordered() {
        assert!(matches!(validate_span(T, T, "w"), Err(EngineError::Validation(_))));
        assert!(validate_span(T, T + 1, "w").is_ok());
    }

    #[test]
    fn span_out_of_range() {
        assert!(matches!(
            validate_span(0, 1000, "w"),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn session_longer_than_a_day_rejected() {
        let r = validate_session_window(T, T + MAX_SESSION_DURATION_MS + 1);
        assert!(matches!(r, Err(EngineError::Validation(_))));
    }

    #[test]
    fn period_year_must_match() {
        let period = Span::new(T, T + 1000);
        assert!(validate_period(2026, &period).is_ok());
        assert!(validate_period(2025, &period).is_err());
    }

    #[test]
    fn capacity_bounds() {
        assert!(matches!(validate_capacity(0), Err(EngineError::Validation(_))));
        assert!(validate_capacity(1).is_ok());
        assert!(matches!(
            validate_capacity(MAX_SCHEDULE_CAPACITY + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn text_checks() {
        assert!(validate_text("name", "  ", 10).is_err());
        assert!(validate_text("name", "ok", 10).is_ok());
        assert!(validate_text("name", "way too long", 5).is_err());
        assert!(validate_optional_text("notes", None, 0).is_ok());
    }

    #[test]
    fn contact_email_needs_at_sign() {
        let bad = Contact {
            email: Some("nobody".into()),
            ..Contact::default()
        };
        assert!(validate_contact(&bad).is_err());
        assert!(validate_contact(&Contact::default()).is_ok());
    }
}
