use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::invalid(format!(
            "start ({}) must be before end ({})",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_id(what: &'static str, id: &str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be empty")));
    }
    if id.len() > crate::limits::MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

/// Admission check for a new booking over `span`.
///
/// Existing pending/confirmed bookings are checked first, then blocked time,
/// so a range that is both booked and blocked reports "already booked".
/// The caller must hold the ledger's write lock across this check and the
/// insert that follows.
pub(crate) fn check_admission(ledger: &Ledger, span: &Span) -> Result<(), EngineError> {
    if let Some(existing) = ledger.active_bookings_overlapping(span).next() {
        return Err(EngineError::Conflict(ConflictReason::AlreadyBooked {
            booking_id: existing.id,
        }));
    }
    if let Some(block) = ledger.blocked_overlapping(span).next() {
        return Err(EngineError::Conflict(ConflictReason::Blocked {
            blocked_id: block.id,
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::*;
    use ulid::Ulid;

    const T0: Ms = 1_800_000_000_000;

    fn ledger_with(bookings: &[(Ms, Ms, BookingStatus)], blocked: &[(Ms, Ms)]) -> Ledger {
        let mut ledger = Ledger::new("pro".into());
        for &(start, end, status) in bookings {
            ledger.insert_booking(Booking {
                id: Ulid::new(),
                professional_id: "pro".into(),
                client_id: Some("client".into()),
                service: "haircut".into(),
                span: Span::new(T0 + start, T0 + end),
                status,
                created_at: T0,
            });
        }
        for &(start, end) in blocked {
            ledger.insert_blocked(BlockedTime {
                id: Ulid::new(),
                professional_id: "pro".into(),
                span: Span::new(T0 + start, T0 + end),
                reason: None,
            });
        }
        ledger
    }

    #[test]
    fn empty_span_rejected() {
        let span = Span { start: T0, end: T0 };
        assert!(matches!(validate_span(&span), Err(EngineError::Validation(_))));
        let reversed = Span { start: T0 + 1, end: T0 };
        assert!(matches!(validate_span(&reversed), Err(EngineError::Validation(_))));
    }

    #[test]
    fn out_of_range_rejected() {
        let span = Span::new(0, 1_000);
        assert!(matches!(validate_span(&span), Err(EngineError::LimitExceeded(_))));
        let wide = Span::new(T0, T0 + MAX_SPAN_DURATION_MS + 1);
        assert!(matches!(validate_span(&wide), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn blank_id_rejected() {
        assert!(validate_id("professional_id", "  ").is_err());
        assert!(validate_id("professional_id", &"x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(validate_id("professional_id", "dr-who").is_ok());
    }

    #[test]
    fn overlap_with_booking_reports_already_booked() {
        let ledger = ledger_with(&[(100, 200, BookingStatus::Confirmed)], &[]);
        let err = check_admission(&ledger, &Span::new(T0 + 150, T0 + 250)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conflict(ConflictReason::AlreadyBooked { .. })
        ));
    }

    #[test]
    fn overlap_with_blocked_reports_blocked() {
        let ledger = ledger_with(&[], &[(100, 200)]);
        let err = check_admission(&ledger, &Span::new(T0 + 50, T0 + 101)).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(ConflictReason::Blocked { .. })));
    }

    #[test]
    fn booked_wins_over_blocked() {
        let ledger = ledger_with(&[(100, 200, BookingStatus::Pending)], &[(100, 200)]);
        let err = check_admission(&ledger, &Span::new(T0 + 100, T0 + 200)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conflict(ConflictReason::AlreadyBooked { .. })
        ));
    }

    #[test]
    fn adjacent_ranges_admitted() {
        let ledger = ledger_with(&[(100, 200, BookingStatus::Confirmed)], &[(300, 400)]);
        assert!(check_admission(&ledger, &Span::new(T0 + 200, T0 + 300)).is_ok());
    }

    #[test]
    fn terminal_bookings_do_not_conflict() {
        let ledger = ledger_with(
            &[
                (100, 200, BookingStatus::Cancelled),
                (100, 200, BookingStatus::Expired),
            ],
            &[],
        );
        assert!(check_admission(&ledger, &Span::new(T0 + 100, T0 + 200)).is_ok());
    }
}
