use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::observability::SLOT_GENERATION_DURATION_SECONDS;

use super::conflict::{Conflicts, checked_span, find_conflicts, has_conflict};
use super::slots;
use super::{Engine, EngineError, SharedProviderState, ValidationError};

impl Engine {
    // ── Schedule model ───────────────────────────────────────

    pub async fn get_provider(&self, id: Ulid) -> Option<Provider> {
        let shared = self.store.get_provider(&id)?;
        let guard = shared.read().await;
        Some(guard.provider.clone())
    }

    pub async fn list_providers(&self) -> Vec<Provider> {
        let mut providers = Vec::with_capacity(self.store.provider_count());
        for shared in self.store.provider_handles() {
            providers.push(shared.read().await.provider.clone());
        }
        providers.sort_by_key(|p| p.id);
        providers
    }

    /// The weekly record for `weekday`. No record (or no provider) is `None`, not an error.
    pub async fn availability_for(
        &self,
        provider_id: Ulid,
        weekday: u8,
    ) -> Result<Option<WeeklyAvailability>, EngineError> {
        if weekday > 6 {
            return Err(ValidationError::WeekdayOutOfRange(weekday).into());
        }
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(guard.availability(weekday).copied())
    }

    pub async fn breaks_overlapping(
        &self,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Break>, EngineError> {
        let query = checked_span(start, end)?;
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return Ok(vec![]);
        };
        let guard = shared.read().await;
        Ok(guard.breaks_overlapping(&query).cloned().collect())
    }

    // ── Slots ────────────────────────────────────────────────

    /// Candidate slots of `provider_id` on `date`. Unknown or inactive providers get none.
    pub async fn generate_slots(&self, provider_id: Ulid, date: NaiveDate) -> Vec<Slot> {
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return vec![];
        };
        let guard = shared.read().await;
        let started = std::time::Instant::now();
        let slots = slots::generate_slots(&guard, date, self.settings.timezone);
        metrics::histogram!(SLOT_GENERATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        slots
    }

    pub async fn free_windows(&self, provider_id: Ulid, date: NaiveDate) -> Vec<Span> {
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return vec![];
        };
        let guard = shared.read().await;
        slots::free_windows(&guard, date, self.settings.timezone)
    }

    // ── Conflicts ────────────────────────────────────────────

    pub async fn has_conflict(
        &self,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = checked_span(start, end)?;
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return Ok(false);
        };
        let guard = shared.read().await;
        Ok(has_conflict(&guard, &span, exclude))
    }

    /// Same overlap rule as `has_conflict`, returning what overlaps.
    pub async fn list_conflicts(
        &self,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Conflicts, EngineError> {
        let span = checked_span(start, end)?;
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return Ok(Conflicts::default());
        };
        let guard = shared.read().await;
        Ok(find_conflicts(&guard, &span, exclude))
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let provider_id = self.store.get_provider_for_entity(&id)?;
        let shared = self.store.get_provider(&provider_id)?;
        let guard = shared.read().await;
        guard.booking(id).cloned()
    }

    /// Codes are matched case-insensitively.
    pub async fn find_booking_by_code(&self, code: &str) -> Option<Booking> {
        let id = self.store.booking_for_code(&code.trim().to_ascii_uppercase())?;
        self.get_booking(id).await
    }

    /// All bookings of a provider, any status, ordered by start.
    pub async fn bookings_for_provider(&self, provider_id: Ulid) -> Vec<Booking> {
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return vec![];
        };
        let guard = shared.read().await;
        guard.bookings.clone()
    }

    pub async fn waiting_list(&self, provider_id: Ulid) -> Vec<WaitingListEntry> {
        let Some(shared) = self.store.get_provider(&provider_id) else {
            return vec![];
        };
        let guard = shared.read().await;
        guard.waiting_list.clone()
    }

    // ── Sweep selection ──────────────────────────────────────

    /// Bookings across all providers matching `pred`, as of now.
    pub(crate) async fn collect_bookings(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let mut found = Vec::new();
        for shared in self.store.provider_handles() {
            let guard = shared.read().await;
            found.extend(guard.bookings.iter().filter(|b| pred(b)).cloned());
        }
        found
    }

    /// Unnotified waiting-list entries, optionally only for one provider/date.
    pub(crate) async fn collect_unnotified(
        &self,
        scope: Option<(Ulid, NaiveDate)>,
    ) -> Vec<WaitingListEntry> {
        let handles: Vec<SharedProviderState> = match scope {
            Some((provider_id, _)) => self.store.get_provider(&provider_id).into_iter().collect(),
            None => self.store.provider_handles(),
        };
        let mut found = Vec::new();
        for shared in handles {
            let guard = shared.read().await;
            found.extend(
                guard
                    .waiting_list
                    .iter()
                    .filter(|w| !w.notified)
                    .filter(|w| scope.is_none_or(|(_, date)| w.desired_date == date))
                    .cloned(),
            );
        }
        found
    }
}
