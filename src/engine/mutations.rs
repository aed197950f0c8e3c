use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::calendar;
use crate::dispatch::{Notification, NotificationKind, RelatedEntity};
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKING_CONFLICTS_TOTAL, BOOKINGS_CREATED_TOTAL, TRANSITIONS_TOTAL};

use super::conflict::{check_no_conflict, checked_span, now_ms};
use super::lifecycle::check_transition;
use super::store::snapshot_events;
use super::{Engine, EngineError, ValidationError, WalCommand};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 8;

/// Eight characters from `[A-Z0-9]`.
pub(crate) fn confirmation_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Partial provider update; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub service_minutes: Option<u32>,
    pub buffer_minutes: Option<u32>,
    pub max_daily_bookings: Option<u32>,
    pub active: Option<bool>,
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ValidationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: i64::from(value),
            min: i64::from(min),
            max: i64::from(max),
        })
    }
}

fn check_settings(service: u32, buffer: u32, daily: u32) -> Result<(), ValidationError> {
    check_range("service_minutes", service, MIN_SERVICE_MINUTES, MAX_SERVICE_MINUTES)?;
    check_range("buffer_minutes", buffer, MIN_BUFFER_MINUTES, MAX_BUFFER_MINUTES)?;
    check_range("max_daily_bookings", daily, MIN_DAILY_BOOKINGS, MAX_DAILY_BOOKINGS)
}

fn check_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), ValidationError> {
    match value {
        Some(v) if v.len() > max => Err(ValidationError::TextTooLong(what)),
        _ => Ok(()),
    }
}

fn check_weekday(weekday: u8) -> Result<(), ValidationError> {
    if weekday <= 6 {
        Ok(())
    } else {
        Err(ValidationError::WeekdayOutOfRange(weekday))
    }
}

impl Engine {
    // ── Providers ────────────────────────────────────────────

    pub async fn create_provider(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        service_minutes: u32,
        buffer_minutes: u32,
        max_daily_bookings: u32,
    ) -> Result<Provider, EngineError> {
        if self.store.provider_count() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        check_text(name.as_deref(), MAX_NAME_LEN, "provider name")?;
        check_settings(service_minutes, buffer_minutes, max_daily_bookings)?;
        if self.store.contains_provider(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ProviderCreated {
            id,
            owner_id,
            name,
            service_minutes,
            buffer_minutes,
            max_daily_bookings,
            active: true,
            at: now_ms(),
        };
        let Some(provider) = super::store::provider_from_event(&event) else {
            return Err(EngineError::NotFound(id));
        };

        // Claim the id with the state locked until the WAL has the event.
        let shared = Arc::new(RwLock::new(ProviderState::new(provider.clone())));
        let guard = shared.clone().write_owned().await;
        if !self.store.try_insert_provider(id, shared) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Err(e) = self.wal_append(&event).await {
            self.store.remove_provider(&id);
            return Err(e);
        }
        drop(guard);
        self.notify.send(id, &event);
        info!(provider_id = %id, service_minutes, buffer_minutes, "provider created");
        Ok(provider)
    }

    /// Existing bookings keep their intervals; new durations apply to new bookings only.
    pub async fn update_provider(
        &self,
        id: Ulid,
        update: ProviderUpdate,
    ) -> Result<Provider, EngineError> {
        check_text(update.name.as_deref(), MAX_NAME_LEN, "provider name")?;
        let mut guard = self.provider_write(id).await?;
        let current = &guard.provider;

        let service_minutes = update.service_minutes.unwrap_or(current.service_minutes);
        let buffer_minutes = update.buffer_minutes.unwrap_or(current.buffer_minutes);
        let max_daily_bookings = update.max_daily_bookings.unwrap_or(current.max_daily_bookings);
        check_settings(service_minutes, buffer_minutes, max_daily_bookings)?;

        let event = Event::ProviderUpdated {
            id,
            name: update.name.or_else(|| current.name.clone()),
            service_minutes,
            buffer_minutes,
            max_daily_bookings,
            active: update.active.unwrap_or(current.active),
            at: now_ms(),
        };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(guard.provider.clone())
    }

    // ── Weekly availability & breaks ─────────────────────────

    /// Upsert the provider's record for `weekday`; at most one per weekday.
    pub async fn set_availability(
        &self,
        provider_id: Ulid,
        weekday: u8,
        start: NaiveTime,
        end: NaiveTime,
        is_available: bool,
    ) -> Result<(), EngineError> {
        check_weekday(weekday)?;
        if end <= start {
            return Err(ValidationError::EndNotAfterStart.into());
        }
        let mut guard = self.provider_write(provider_id).await?;
        let event = Event::AvailabilitySet {
            provider_id,
            availability: WeeklyAvailability {
                weekday,
                start,
                end,
                is_available,
            },
        };
        self.persist_and_apply(provider_id, &mut guard, &event).await
    }

    /// Returns false if there was no record to clear.
    pub async fn clear_availability(&self, provider_id: Ulid, weekday: u8) -> Result<bool, EngineError> {
        check_weekday(weekday)?;
        let mut guard = self.provider_write(provider_id).await?;
        if guard.availability(weekday).is_none() {
            return Ok(false);
        }
        let event = Event::AvailabilityCleared { provider_id, weekday };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(true)
    }

    /// Existing bookings under the break stay as they are.
    pub async fn add_break(
        &self,
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let span = checked_span(start, end)?;
        if span.duration_ms() > MAX_BREAK_DURATION_MS {
            return Err(EngineError::LimitExceeded("break too long"));
        }
        check_text(reason.as_deref(), MAX_REASON_LEN, "break reason")?;
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.provider_write(provider_id).await?;
        if guard.breaks.len() >= MAX_BREAKS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many breaks on provider"));
        }
        let event = Event::BreakAdded { id, provider_id, span, reason };
        self.persist_and_apply(provider_id, &mut guard, &event).await
    }

    pub async fn remove_break(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.breaks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BreakRemoved { id, provider_id };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(provider_id)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Book `[start, start + service)` for `user_id`. The conflict check and the
    /// insert happen under the provider's write lock, so of two overlapping
    /// requests exactly one commits.
    pub async fn create_booking(
        &self,
        provider_id: Ulid,
        user_id: Ulid,
        start: Ms,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.book(provider_id, user_id, start, notes, None).await
    }

    /// `create_booking` against a fixed clock.
    pub async fn create_booking_at(
        &self,
        provider_id: Ulid,
        user_id: Ulid,
        start: Ms,
        notes: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.book(provider_id, user_id, start, notes, Some(now)).await
    }

    /// Without a fixed `now`, the clock is read once the provider lock is held.
    async fn book(
        &self,
        provider_id: Ulid,
        user_id: Ulid,
        start: Ms,
        notes: Option<String>,
        now: Option<Ms>,
    ) -> Result<Booking, EngineError> {
        check_text(notes.as_deref(), MAX_NOTES_LEN, "notes")?;
        let mut guard = self.provider_write(provider_id).await?;
        let now = now.unwrap_or_else(now_ms);

        if !guard.provider.active {
            return Err(ValidationError::ProviderInactive(provider_id).into());
        }
        if start < now {
            return Err(ValidationError::StartInPast(start).into());
        }
        let end = start
            .checked_add(guard.provider.service_ms())
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let span = checked_span(start, end)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings on provider"));
        }

        let tz = self.settings.timezone;
        let date = calendar::local_date(span.start, tz)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let limit = guard.provider.max_daily_bookings;
        let booked_that_day = guard
            .bookings
            .iter()
            .filter(|b| b.status.is_committed() && calendar::local_date(b.span.start, tz) == Some(date))
            .count();
        if booked_that_day >= limit as usize {
            return Err(ValidationError::DailyLimitReached { date, limit }.into());
        }

        if let Err(e) = check_no_conflict(&guard, &span) {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!(provider_id = %provider_id, %span, "booking rejected: {e}");
            return Err(e);
        }

        let id = Ulid::new();
        let code = self.issue_code(id)?;
        let event = Event::BookingCreated {
            id,
            provider_id,
            user_id,
            span,
            confirmation_code: code.clone(),
            notes,
            at: now,
        };
        if let Err(e) = self.persist_and_apply(provider_id, &mut guard, &event).await {
            self.store.release_code(&code);
            return Err(e);
        }

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(provider_id = %provider_id, booking_id = %id, %span, "booking created");
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    fn issue_code(&self, booking_id: Ulid) -> Result<String, EngineError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = confirmation_code();
            if self.store.reserve_code(&code, booking_id) {
                return Ok(code);
            }
        }
        Err(EngineError::LimitExceeded("no unused confirmation code found"))
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Move a booking along the lifecycle graph. Notifications go out after the
    /// commit and never affect its outcome.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.transition_booking_at(id, to, reason, now_ms()).await
    }

    pub async fn transition_booking_at(
        &self,
        id: Ulid,
        to: BookingStatus,
        reason: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.apply_transition(id, None, to, reason, now).await
    }

    /// With `expected` set, the transition only applies if the booking is still
    /// in that state; sweeps use this to lose races gracefully.
    pub(crate) async fn apply_transition(
        &self,
        id: Ulid,
        expected: Option<BookingStatus>,
        to: BookingStatus,
        reason: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        check_text(reason.as_deref(), MAX_REASON_LEN, "reason")?;
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let from = guard.booking(id).ok_or(EngineError::NotFound(id))?.status;
        if expected.is_some_and(|e| e != from) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        check_transition(id, from, to)?;

        let event = Event::BookingTransitioned {
            id,
            provider_id,
            from,
            to,
            reason: if to == BookingStatus::Canceled { reason } else { None },
            at: now,
        };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        let booking = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        metrics::counter!(TRANSITIONS_TOTAL, "from" => from.as_str(), "to" => to.as_str())
            .increment(1);
        info!(booking_id = %id, provider_id = %provider_id, %from, %to, "booking transitioned");

        self.after_transition(&booking, now).await;
        Ok(booking)
    }

    async fn after_transition(&self, booking: &Booking, now: Ms) {
        let related = RelatedEntity::Booking(booking.id);
        match booking.status {
            BookingStatus::Confirmed => {
                self.dispatcher.dispatch(Notification::new(
                    booking.user_id,
                    NotificationKind::Confirmation,
                    related,
                    self.booking_context(booking),
                ));
            }
            BookingStatus::Canceled => {
                let mut context = self.booking_context(booking);
                context.insert(
                    "reason".into(),
                    Value::from(booking.cancel_reason.as_deref().unwrap_or("not specified")),
                );
                self.dispatcher.dispatch(Notification::new(
                    booking.user_id,
                    NotificationKind::Cancellation,
                    related,
                    context,
                ));
                match calendar::local_date(booking.span.start, self.settings.timezone) {
                    Some(date) => {
                        self.notify_waiting_list(Some((booking.provider_id, date)), now)
                            .await;
                    }
                    None => warn!(booking_id = %booking.id, "cannot resolve booking date"),
                }
            }
            BookingStatus::Completed => {
                self.dispatcher.dispatch_after(
                    self.review_notification(booking),
                    self.settings.lifecycle.review_delay,
                );
            }
            BookingStatus::Pending | BookingStatus::Archived => {}
        }
    }

    /// Template variables describing a booking.
    pub(crate) fn booking_context(&self, booking: &Booking) -> Map<String, Value> {
        let tz = self.settings.timezone;
        let mut context = Map::new();
        context.insert("booking_id".into(), Value::from(booking.id.to_string()));
        context.insert("provider_id".into(), Value::from(booking.provider_id.to_string()));
        context.insert(
            "confirmation_code".into(),
            Value::from(booking.confirmation_code.clone()),
        );
        context.insert("date".into(), Value::from(calendar::format_date(booking.span.start, tz)));
        context.insert("start_time".into(), Value::from(calendar::format_time(booking.span.start, tz)));
        context.insert("end_time".into(), Value::from(calendar::format_time(booking.span.end, tz)));
        context
    }

    /// Flag a confirmed booking as reminded. False if it no longer qualifies.
    pub(crate) async fn mark_reminder_sent(&self, id: Ulid) -> Result<bool, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if booking.reminder_sent || booking.status != BookingStatus::Confirmed {
            return Ok(false);
        }
        let event = Event::ReminderSent { id, provider_id };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(true)
    }

    /// Flag a completed booking's review request as settled. False if it
    /// already was or the booking moved on.
    pub(crate) async fn mark_review_settled(&self, id: Ulid) -> Result<bool, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if booking.review_settled || booking.status != BookingStatus::Completed {
            return Ok(false);
        }
        let event = Event::ReviewSettled { id, provider_id };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(true)
    }

    /// The review request for a completed booking, due `review_delay` after completion.
    pub(crate) fn review_notification(&self, booking: &Booking) -> Notification {
        Notification::new(
            booking.user_id,
            NotificationKind::Review,
            RelatedEntity::Booking(booking.id),
            self.booking_context(booking),
        )
    }

    // ── Waiting list ─────────────────────────────────────────

    pub async fn join_waiting_list(
        &self,
        id: Ulid,
        provider_id: Ulid,
        user_id: Ulid,
        desired_date: NaiveDate,
        time_preference: Option<String>,
    ) -> Result<WaitingListEntry, EngineError> {
        check_text(time_preference.as_deref(), MAX_NAME_LEN, "time preference")?;
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.provider_write(provider_id).await?;
        if guard.waiting_list.len() >= MAX_WAITING_LIST_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("waiting list full"));
        }
        let event = Event::WaitingListJoined {
            id,
            provider_id,
            user_id,
            desired_date,
            time_preference,
            at: now_ms(),
        };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        guard
            .waiting_list
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Flip an entry to notified. False if it already was.
    pub(crate) async fn mark_waiting_notified(&self, id: Ulid) -> Result<bool, EngineError> {
        let (provider_id, mut guard) = self.resolve_entity_write(&id).await?;
        let entry = guard.waiting_entry_mut(id).ok_or(EngineError::NotFound(id))?;
        if entry.notified {
            return Ok(false);
        }
        let event = Event::WaitingListNotified { id, provider_id };
        self.persist_and_apply(provider_id, &mut guard, &event).await?;
        Ok(true)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for shared in self.store.provider_handles() {
            let guard = shared.read().await;
            events.extend(snapshot_events(&guard));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
