use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::SharedProviderState;

/// In-memory data store: providers plus the indexes that let an entity id or a
/// confirmation code find its owning provider.
pub struct InMemoryStore {
    providers: DashMap<Ulid, SharedProviderState>,
    /// booking / break / waiting-list entry id → provider id
    entity_to_provider: DashMap<Ulid, Ulid>,
    /// Every confirmation code ever issued → booking id
    codes: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            entity_to_provider: DashMap::new(),
            codes: DashMap::new(),
        }
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn contains_provider(&self, id: &Ulid) -> bool {
        self.providers.contains_key(id)
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn insert_provider(&self, id: Ulid, state: SharedProviderState) {
        self.providers.insert(id, state);
    }

    /// Insert unless `id` is taken. False if it was.
    pub fn try_insert_provider(&self, id: Ulid, state: SharedProviderState) -> bool {
        match self.providers.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(state);
                true
            }
        }
    }

    pub fn remove_provider(&self, id: &Ulid) {
        self.providers.remove(id);
    }

    /// Snapshot of all provider handles; no map shard stays locked afterwards.
    pub fn provider_handles(&self) -> Vec<SharedProviderState> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn get_provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    pub fn contains_entity(&self, entity_id: &Ulid) -> bool {
        self.entity_to_provider.contains_key(entity_id)
    }

    fn map_entity(&self, entity_id: Ulid, provider_id: Ulid) {
        self.entity_to_provider.insert(entity_id, provider_id);
    }

    fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_provider.remove(entity_id);
    }

    // ── Confirmation codes ───────────────────────────────────

    /// Claim `code` for `booking_id`. False if the code was ever issued before.
    pub fn reserve_code(&self, code: &str, booking_id: Ulid) -> bool {
        match self.codes.entry(code.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(booking_id);
                true
            }
        }
    }

    /// Give back a code whose booking never got committed.
    pub fn release_code(&self, code: &str) {
        self.codes.remove(code);
    }

    pub fn booking_for_code(&self, code: &str) -> Option<Ulid> {
        self.codes.get(code).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to its provider's state (caller holds the write lock).
    /// `ProviderCreated` is handled at the map level, not here.
    pub fn apply_event(&self, ps: &mut ProviderState, event: &Event) {
        match event {
            Event::ProviderUpdated {
                name,
                service_minutes,
                buffer_minutes,
                max_daily_bookings,
                active,
                at,
                ..
            } => {
                let p = &mut ps.provider;
                p.name = name.clone();
                p.service_minutes = *service_minutes;
                p.buffer_minutes = *buffer_minutes;
                p.max_daily_bookings = *max_daily_bookings;
                p.active = *active;
                p.updated_at = *at;
            }
            Event::AvailabilitySet { availability, .. } => {
                ps.set_availability(*availability);
            }
            Event::AvailabilityCleared { weekday, .. } => {
                ps.clear_availability(*weekday);
            }
            Event::BreakAdded {
                id,
                provider_id,
                span,
                reason,
            } => {
                ps.insert_break(Break {
                    id: *id,
                    span: *span,
                    reason: reason.clone(),
                });
                self.map_entity(*id, *provider_id);
            }
            Event::BreakRemoved { id, .. } => {
                ps.remove_break(*id);
                self.unmap_entity(id);
            }
            Event::BookingCreated {
                id,
                provider_id,
                user_id,
                span,
                confirmation_code,
                notes,
                at,
            } => {
                ps.insert_booking(Booking {
                    id: *id,
                    provider_id: *provider_id,
                    user_id: *user_id,
                    span: *span,
                    status: BookingStatus::Pending,
                    confirmation_code: confirmation_code.clone(),
                    notes: notes.clone(),
                    cancel_reason: None,
                    reminder_sent: false,
                    review_settled: false,
                    created_at: *at,
                    updated_at: *at,
                });
                self.map_entity(*id, *provider_id);
                self.codes.insert(confirmation_code.clone(), *id);
            }
            Event::BookingTransitioned { id, to, reason, at, .. } => {
                if let Some(b) = ps.booking_mut(*id) {
                    b.status = *to;
                    b.updated_at = *at;
                    if reason.is_some() {
                        b.cancel_reason = reason.clone();
                    }
                }
            }
            Event::ReminderSent { id, .. } => {
                if let Some(b) = ps.booking_mut(*id) {
                    b.reminder_sent = true;
                }
            }
            Event::ReviewSettled { id, .. } => {
                if let Some(b) = ps.booking_mut(*id) {
                    b.review_settled = true;
                }
            }
            Event::WaitingListJoined {
                id,
                provider_id,
                user_id,
                desired_date,
                time_preference,
                at,
            } => {
                ps.waiting_list.push(WaitingListEntry {
                    id: *id,
                    provider_id: *provider_id,
                    user_id: *user_id,
                    desired_date: *desired_date,
                    time_preference: time_preference.clone(),
                    notified: false,
                    created_at: *at,
                });
                self.map_entity(*id, *provider_id);
            }
            Event::WaitingListNotified { id, .. } => {
                if let Some(w) = ps.waiting_entry_mut(*id) {
                    w.notified = true;
                }
            }
            Event::ProviderCreated { .. } => {}
        }
    }
}

/// The provider record a `ProviderCreated` event describes.
pub(super) fn provider_from_event(event: &Event) -> Option<Provider> {
    match event {
        Event::ProviderCreated {
            id,
            owner_id,
            name,
            service_minutes,
            buffer_minutes,
            max_daily_bookings,
            active,
            at,
        } => Some(Provider {
            id: *id,
            owner_id: *owner_id,
            name: name.clone(),
            service_minutes: *service_minutes,
            buffer_minutes: *buffer_minutes,
            max_daily_bookings: *max_daily_bookings,
            active: *active,
            created_at: *at,
            updated_at: *at,
        }),
        _ => None,
    }
}

/// Events that rebuild `ps` exactly, for WAL compaction.
pub(super) fn snapshot_events(ps: &ProviderState) -> Vec<Event> {
    let p = &ps.provider;
    let mut events = vec![Event::ProviderCreated {
        id: p.id,
        owner_id: p.owner_id,
        name: p.name.clone(),
        service_minutes: p.service_minutes,
        buffer_minutes: p.buffer_minutes,
        max_daily_bookings: p.max_daily_bookings,
        active: p.active,
        at: p.created_at,
    }];
    if p.updated_at != p.created_at {
        events.push(Event::ProviderUpdated {
            id: p.id,
            name: p.name.clone(),
            service_minutes: p.service_minutes,
            buffer_minutes: p.buffer_minutes,
            max_daily_bookings: p.max_daily_bookings,
            active: p.active,
            at: p.updated_at,
        });
    }

    for availability in ps.week.iter().flatten() {
        events.push(Event::AvailabilitySet {
            provider_id: p.id,
            availability: *availability,
        });
    }

    for brk in &ps.breaks {
        events.push(Event::BreakAdded {
            id: brk.id,
            provider_id: p.id,
            span: brk.span,
            reason: brk.reason.clone(),
        });
    }

    for b in &ps.bookings {
        events.push(Event::BookingCreated {
            id: b.id,
            provider_id: p.id,
            user_id: b.user_id,
            span: b.span,
            confirmation_code: b.confirmation_code.clone(),
            notes: b.notes.clone(),
            at: b.created_at,
        });
        // Collapse the path taken into one edge; replay only sets the final status.
        if b.status != BookingStatus::Pending || b.updated_at != b.created_at {
            events.push(Event::BookingTransitioned {
                id: b.id,
                provider_id: p.id,
                from: BookingStatus::Pending,
                to: b.status,
                reason: b.cancel_reason.clone(),
                at: b.updated_at,
            });
        }
        if b.reminder_sent {
            events.push(Event::ReminderSent {
                id: b.id,
                provider_id: p.id,
            });
        }
        if b.review_settled {
            events.push(Event::ReviewSettled {
                id: b.id,
                provider_id: p.id,
            });
        }
    }

    for w in &ps.waiting_list {
        events.push(Event::WaitingListJoined {
            id: w.id,
            provider_id: p.id,
            user_id: w.user_id,
            desired_date: w.desired_date,
            time_preference: w.time_preference.clone(),
            at: w.created_at,
        });
        if w.notified {
            events.push(Event::WaitingListNotified {
                id: w.id,
                provider_id: p.id,
            });
        }
    }

    events
}
