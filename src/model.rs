use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every stored instant uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Booking lifecycle states. Transitions only ever move forward, see `engine::lifecycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Canceled,
    Completed,
    Archived,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Completed => "completed",
            BookingStatus::Archived => "archived",
        }
    }

    /// Committed bookings block their interval for everyone else.
    pub fn is_committed(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Ulid,
    /// Account that owns this provider profile.
    pub owner_id: Ulid,
    pub name: Option<String>,
    pub service_minutes: u32,
    /// Idle gap after each slot; never bookable on its own.
    pub buffer_minutes: u32,
    pub max_daily_bookings: u32,
    pub active: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Provider {
    pub fn service_ms(&self) -> Ms {
        Ms::from(self.service_minutes) * MINUTE_MS
    }

    /// Distance between consecutive slot starts.
    pub fn step_ms(&self) -> Ms {
        Ms::from(self.service_minutes + self.buffer_minutes) * MINUTE_MS
    }
}

/// Recurring availability for one weekday (0 = Monday .. 6 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub weekday: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub is_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Break {
    pub id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub confirmation_code: String,
    pub notes: Option<String>,
    pub cancel_reason: Option<String>,
    pub reminder_sent: bool,
    /// The review request after completion reached a final delivery outcome.
    pub review_settled: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingListEntry {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub user_id: Ulid,
    pub desired_date: NaiveDate,
    pub time_preference: Option<String>,
    /// Flips false → true once, never back.
    pub notified: bool,
    pub created_at: Ms,
}

/// A candidate window of exactly one service duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub is_available: bool,
}

/// Everything the engine knows about one provider. Guarded by a single lock,
/// so every check-then-write on a provider is atomic.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider: Provider,
    /// Indexed by weekday; the array shape enforces one record per weekday.
    pub week: [Option<WeeklyAvailability>; 7],
    /// Sorted by `span.start`.
    pub breaks: Vec<Break>,
    /// Sorted by `span.start`, all statuses.
    pub bookings: Vec<Booking>,
    pub waiting_list: Vec<WaitingListEntry>,
}

impl ProviderState {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            week: [None; 7],
            breaks: Vec::new(),
            bookings: Vec::new(),
            waiting_list: Vec::new(),
        }
    }

    pub fn availability(&self, weekday: u8) -> Option<&WeeklyAvailability> {
        self.week.get(usize::from(weekday)).and_then(|a| a.as_ref())
    }

    pub fn set_availability(&mut self, availability: WeeklyAvailability) {
        if let Some(slot) = self.week.get_mut(usize::from(availability.weekday)) {
            *slot = Some(availability);
        }
    }

    pub fn clear_availability(&mut self, weekday: u8) -> Option<WeeklyAvailability> {
        self.week.get_mut(usize::from(weekday)).and_then(|a| a.take())
    }

    /// Insert break maintaining sort order by span.start.
    pub fn insert_break(&mut self, brk: Break) {
        let pos = self
            .breaks
            .binary_search_by_key(&brk.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.breaks.insert(pos, brk);
    }

    pub fn remove_break(&mut self, id: Ulid) -> Option<Break> {
        let pos = self.breaks.iter().position(|b| b.id == id)?;
        Some(self.breaks.remove(pos))
    }

    /// Breaks whose span overlaps the query window.
    pub fn breaks_overlapping(&self, query: &Span) -> impl Iterator<Item = &Break> {
        let right_bound = self.breaks.partition_point(|b| b.span.start < query.end);
        self.breaks[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings of any status whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn bookings_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Pending/confirmed bookings overlapping the query window.
    pub fn committed_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.bookings_overlapping(query)
            .filter(|b| b.status.is_committed())
    }

    pub fn waiting_entry_mut(&mut self, id: Ulid) -> Option<&mut WaitingListEntry> {
        self.waiting_list.iter_mut().find(|w| w.id == id)
    }
}

/// Committed state changes, one per WAL record. Replaying them in order rebuilds memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        service_minutes: u32,
        buffer_minutes: u32,
        max_daily_bookings: u32,
        active: bool,
        at: Ms,
    },
    ProviderUpdated {
        id: Ulid,
        name: Option<String>,
        service_minutes: u32,
        buffer_minutes: u32,
        max_daily_bookings: u32,
        active: bool,
        at: Ms,
    },
    AvailabilitySet {
        provider_id: Ulid,
        availability: WeeklyAvailability,
    },
    AvailabilityCleared {
        provider_id: Ulid,
        weekday: u8,
    },
    BreakAdded {
        id: Ulid,
        provider_id: Ulid,
        span: Span,
        reason: Option<String>,
    },
    BreakRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        provider_id: Ulid,
        user_id: Ulid,
        span: Span,
        confirmation_code: String,
        notes: Option<String>,
        at: Ms,
    },
    BookingTransitioned {
        id: Ulid,
        provider_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
        reason: Option<String>,
        at: Ms,
    },
    ReminderSent {
        id: Ulid,
        provider_id: Ulid,
    },
    ReviewSettled {
        id: Ulid,
        provider_id: Ulid,
    },
    WaitingListJoined {
        id: Ulid,
        provider_id: Ulid,
        user_id: Ulid,
        desired_date: NaiveDate,
        time_preference: Option<String>,
        at: Ms,
    },
    WaitingListNotified {
        id: Ulid,
        provider_id: Ulid,
    },
}

impl Event {
    /// Provider the event belongs to.
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::ProviderCreated { id, .. } | Event::ProviderUpdated { id, .. } => *id,
            Event::AvailabilitySet { provider_id, .. }
            | Event::AvailabilityCleared { provider_id, .. }
            | Event::BreakAdded { provider_id, .. }
            | Event::BreakRemoved { provider_id, .. }
            | Event::BookingCreated { provider_id, .. }
            | Event::BookingTransitioned { provider_id, .. }
            | Event::ReminderSent { provider_id, .. }
            | Event::ReviewSettled { provider_id, .. }
            | Event::WaitingListJoined { provider_id, .. }
            | Event::WaitingListNotified { provider_id, .. } => *provider_id,
        }
    }
}
