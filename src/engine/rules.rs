//! Pure booking rules: window validation and the decide transition.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::limits;
use crate::model::{BookingStatus, Ms, Span};

use super::EngineError;

/// Wall clock in unix milliseconds. Read once at the edge of each request
/// and passed down, so a single request sees one consistent instant.
pub fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Validate a requested booking window against `now`. Range checks are
/// resource guards (LimitExceeded); ordering and past-start are business
/// validation.
pub fn validate_booking_window(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    if !(limits::MIN_VALID_TIMESTAMP_MS..=limits::MAX_VALID_TIMESTAMP_MS).contains(&start)
        || !(limits::MIN_VALID_TIMESTAMP_MS..=limits::MAX_VALID_TIMESTAMP_MS).contains(&end)
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if start >= end {
        return Err(EngineError::Validation("booking start must be before its end"));
    }
    if start < now {
        return Err(EngineError::Validation("booking start must not be in the past"));
    }
    if end - start > limits::MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking window too long"));
    }
    Ok(Span::new(start, end))
}

/// Status transition for an owner decision. Returns the new status, or
/// `None` when the booking already carries the requested terminal status.
///
/// The rule is deliberately asymmetric: re-approving an APPROVED booking or
/// re-rejecting a REJECTED one fails, but rejecting an APPROVED booking
/// succeeds (the owner changed their mind before handover).
pub fn decide_transition(current: BookingStatus, approve: bool) -> Option<BookingStatus> {
    let target = if approve {
        BookingStatus::Approved
    } else {
        BookingStatus::Rejected
    };
    if current == target { None } else { Some(target) }
}
