use ulid::Ulid;

use crate::model::*;

use super::{EngineError, ValidationError};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Build a span from raw instants, rejecting empty/inverted and out-of-range input.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(ValidationError::EndNotAfterStart.into());
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

/// Everything a candidate interval collides with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conflicts {
    /// Committed (pending/confirmed) bookings.
    pub bookings: Vec<Ulid>,
    pub breaks: Vec<Ulid>,
}

impl Conflicts {
    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty() && self.breaks.is_empty()
    }
}

/// Strict half-open overlap against committed bookings and breaks.
/// `exclude` skips one booking, for re-validating a booking against itself.
pub(crate) fn find_conflicts(ps: &ProviderState, span: &Span, exclude: Option<Ulid>) -> Conflicts {
    Conflicts {
        bookings: ps
            .committed_overlapping(span)
            .filter(|b| Some(b.id) != exclude)
            .map(|b| b.id)
            .collect(),
        breaks: ps.breaks_overlapping(span).map(|b| b.id).collect(),
    }
}

pub(crate) fn has_conflict(ps: &ProviderState, span: &Span, exclude: Option<Ulid>) -> bool {
    ps.committed_overlapping(span).any(|b| Some(b.id) != exclude)
        || ps.breaks_overlapping(span).next().is_some()
}

pub(crate) fn check_no_conflict(ps: &ProviderState, span: &Span) -> Result<(), EngineError> {
    let found = find_conflicts(ps, span, None);
    if found.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict {
            span: *span,
            bookings: found.bookings,
            breaks: found.breaks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;

    fn state() -> ProviderState {
        ProviderState::new(Provider {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            name: None,
            service_minutes: 45,
            buffer_minutes: 15,
            max_daily_bookings: 10,
            active: true,
            created_at: 0,
            updated_at: 0,
        })
    }

    fn add_booking(ps: &mut ProviderState, start: Ms, end: Ms, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        ps.insert_booking(Booking {
            id,
            provider_id: ps.provider.id,
            user_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            confirmation_code: "AAAA0000".into(),
            notes: None,
            cancel_reason: None,
            reminder_sent: false,
            review_settled: false,
            created_at: 0,
            updated_at: 0,
        });
        id
    }

    fn add_break(ps: &mut ProviderState, start: Ms, end: Ms) -> Ulid {
        let id = Ulid::new();
        ps.insert_break(Break { id, span: Span::new(start, end), reason: None });
        id
    }

    #[test]
    fn overlap_with_committed_booking() {
        let mut ps = state();
        let a = add_booking(&mut ps, 600 * M, 645 * M, BookingStatus::Confirmed);

        let clash = Span::new(630 * M, 675 * M);
        assert!(has_conflict(&ps, &clash, None));
        assert_eq!(find_conflicts(&ps, &clash, None).bookings, vec![a]);

        // Starting exactly at the end is fine.
        assert!(!has_conflict(&ps, &Span::new(645 * M, 690 * M), None));
    }

    #[test]
    fn released_bookings_do_not_block() {
        let mut ps = state();
        add_booking(&mut ps, 0, 100, BookingStatus::Canceled);
        add_booking(&mut ps, 0, 100, BookingStatus::Completed);
        add_booking(&mut ps, 0, 100, BookingStatus::Archived);
        assert!(!has_conflict(&ps, &Span::new(0, 100), None));
    }

    #[test]
    fn breaks_block() {
        let mut ps = state();
        let b = add_break(&mut ps, 50, 60);
        let found = find_conflicts(&ps, &Span::new(0, 100), None);
        assert_eq!(found.breaks, vec![b]);
        assert!(found.bookings.is_empty());
    }

    #[test]
    fn exclude_skips_self() {
        let mut ps = state();
        let a = add_booking(&mut ps, 0, 100, BookingStatus::Pending);
        assert!(has_conflict(&ps, &Span::new(0, 100), None));
        assert!(!has_conflict(&ps, &Span::new(0, 100), Some(a)));
        assert!(find_conflicts(&ps, &Span::new(0, 100), Some(a)).is_empty());
    }

    #[test]
    fn conflict_error_names_everything() {
        let mut ps = state();
        let a = add_booking(&mut ps, 0, 100, BookingStatus::Pending);
        let b = add_break(&mut ps, 90, 200);
        match check_no_conflict(&ps, &Span::new(50, 150)) {
            Err(EngineError::Conflict { span, bookings, breaks }) => {
                assert_eq!(span, Span::new(50, 150));
                assert_eq!(bookings, vec![a]);
                assert_eq!(breaks, vec![b]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn checked_span_rules() {
        let t = crate::limits::MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            checked_span(t + 10, t + 10),
            Err(EngineError::Validation(ValidationError::EndNotAfterStart))
        ));
        assert!(matches!(
            checked_span(0, 10),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(checked_span(t, t + 1).unwrap(), Span::new(t, t + 1));
    }
}
