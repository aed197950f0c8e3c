use std::time::Duration;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Edges of the booking lifecycle. Nothing returns to `Pending`; `Archived` is terminal.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Canceled)
            | (Confirmed, Canceled)
            | (Confirmed, Completed)
            | (Completed, Archived)
            | (Canceled, Archived)
    )
}

pub(crate) fn check_transition(
    id: Ulid,
    from: BookingStatus,
    to: BookingStatus,
) -> Result<(), EngineError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { id, from, to })
    }
}

/// Time thresholds of the automatic transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// A pending booking older than this is canceled.
    pub confirmation_timeout_ms: Ms,
    /// Delay between completion and the review request.
    pub review_delay: Duration,
    /// Completed/canceled bookings whose end is further back than this are archived.
    pub archive_after_ms: Ms,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: 12 * HOUR_MS,
            review_delay: Duration::from_secs(3600),
            archive_after_ms: 365 * DAY_MS,
        }
    }
}

impl LifecyclePolicy {
    pub fn confirmation_expired(&self, booking: &Booking, now: Ms) -> bool {
        booking.status == BookingStatus::Pending
            && now - booking.created_at > self.confirmation_timeout_ms
    }

    pub fn completable(&self, booking: &Booking, now: Ms) -> bool {
        booking.status == BookingStatus::Confirmed && now > booking.span.end
    }

    pub fn archivable(&self, booking: &Booking, now: Ms) -> bool {
        matches!(booking.status, BookingStatus::Completed | BookingStatus::Canceled)
            && now - booking.span.end > self.archive_after_ms
    }
}
