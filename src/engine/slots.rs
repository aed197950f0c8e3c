use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::calendar;
use crate::model::*;

use super::conflict::has_conflict;

/// Fixed-size tiling of a window: a slot of `service` every `step`, anchored at
/// the window start. A slot is emitted only while its full step (slot plus
/// buffer) still fits inside the window.
#[derive(Debug, Clone)]
pub struct SlotTiling {
    next: Ms,
    window_end: Ms,
    service: Ms,
    step: Ms,
}

impl SlotTiling {
    pub fn new(window: Span, service: Ms, step: Ms) -> Self {
        Self {
            next: window.start,
            window_end: window.end,
            service,
            step,
        }
    }
}

impl Iterator for SlotTiling {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        if self.service <= 0 || self.step < self.service || self.next + self.step > self.window_end {
            return None;
        }
        let span = Span::new(self.next, self.next + self.service);
        self.next += self.step;
        Some(span)
    }
}

/// The provider's bookable window on `date`, if any.
pub(crate) fn day_window(ps: &ProviderState, date: NaiveDate, tz: Tz) -> Option<Span> {
    if !ps.provider.active {
        return None;
    }
    let availability = ps.availability(calendar::weekday_index(date))?;
    if !availability.is_available {
        return None;
    }
    calendar::day_window(date, availability.start, availability.end, tz)
}

/// Candidate slots for `date`, each marked against committed bookings and breaks.
/// Inactive provider, no availability record, or an unavailable weekday: no slots.
pub fn generate_slots(ps: &ProviderState, date: NaiveDate, tz: Tz) -> Vec<Slot> {
    let Some(window) = day_window(ps, date, tz) else {
        return Vec::new();
    };
    SlotTiling::new(window, ps.provider.service_ms(), ps.provider.step_ms())
        .map(|span| Slot {
            start: span.start,
            end: span.end,
            is_available: !has_conflict(ps, &span, None),
        })
        .collect()
}

/// Availability window minus breaks and committed bookings, as maximal disjoint spans.
pub fn free_windows(ps: &ProviderState, date: NaiveDate, tz: Tz) -> Vec<Span> {
    let Some(window) = day_window(ps, date, tz) else {
        return Vec::new();
    };
    let mut taken: Vec<Span> = ps
        .breaks_overlapping(&window)
        .map(|b| b.span)
        .chain(ps.committed_overlapping(&window).map(|b| b.span))
        .collect();
    taken.sort_by_key(|s| s.start);
    subtract_intervals(&[window], &merge_overlapping(&taken))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn at(h: u32, m: u32) -> Ms {
        calendar::to_ms(monday(), NaiveTime::from_hms_opt(h, m, 0).unwrap(), Tz::UTC).unwrap()
    }

    fn provider_state(service: u32, buffer: u32) -> ProviderState {
        let mut ps = ProviderState::new(Provider {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            name: None,
            service_minutes: service,
            buffer_minutes: buffer,
            max_daily_bookings: 20,
            active: true,
            created_at: 0,
            updated_at: 0,
        });
        ps.set_availability(WeeklyAvailability {
            weekday: 0,
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            is_available: true,
        });
        ps
    }

    fn booking(ps: &ProviderState, span: Span, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            provider_id: ps.provider.id,
            user_id: Ulid::new(),
            span,
            status,
            confirmation_code: "ZZZZ9999".into(),
            notes: None,
            cancel_reason: None,
            reminder_sent: false,
            review_settled: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    // ── tiling ───────────────────────────────────────────

    #[test]
    fn tiling_stops_when_step_overflows() {
        let slots: Vec<Span> = SlotTiling::new(Span::new(0, 100), 20, 30).collect();
        assert_eq!(slots, vec![Span::new(0, 20), Span::new(30, 50), Span::new(60, 80)]);
    }

    #[test]
    fn tiling_exact_fit() {
        let slots: Vec<Span> = SlotTiling::new(Span::new(0, 90), 20, 30).collect();
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn tiling_window_too_short() {
        assert_eq!(SlotTiling::new(Span::new(0, 25), 20, 30).count(), 0);
    }

    #[test]
    fn tiling_is_maximal_and_contained() {
        for (service, buffer) in [(10, 0), (30, 5), (45, 15), (240, 60), (25, 7)] {
            let window = Span::new(9 * H, 18 * H);
            let step = (service + buffer) * M;
            let slots: Vec<Span> = SlotTiling::new(window, service * M, step).collect();
            let expected = ((window.duration_ms()) / step) as usize;
            assert_eq!(slots.len(), expected, "service={service} buffer={buffer}");
            for (i, s) in slots.iter().enumerate() {
                assert_eq!(s.start, window.start + i as Ms * step);
                assert_eq!(s.duration_ms(), service * M);
                assert!(window.contains_span(s));
            }
        }
    }

    // ── generate_slots ───────────────────────────────────

    #[test]
    fn nine_slots_for_45_plus_15() {
        let ps = provider_state(45, 15);
        let slots = generate_slots(&ps, monday(), Tz::UTC);
        assert_eq!(slots.len(), 9);
        assert_eq!(slots[0].start, at(9, 0));
        assert_eq!(slots[0].end, at(9, 45));
        assert_eq!(slots[8].start, at(17, 0));
        assert_eq!(slots[8].end, at(17, 45));
        assert!(slots.iter().all(|s| s.is_available));
        assert!(slots.iter().all(|s| s.start < at(17, 15)));
    }

    #[test]
    fn no_record_or_unavailable_is_empty() {
        let mut ps = provider_state(45, 15);
        let tuesday = monday().succ_opt().unwrap();
        assert!(generate_slots(&ps, tuesday, Tz::UTC).is_empty());

        ps.week[0].as_mut().unwrap().is_available = false;
        assert!(generate_slots(&ps, monday(), Tz::UTC).is_empty());
    }

    #[test]
    fn inactive_provider_is_empty() {
        let mut ps = provider_state(45, 15);
        ps.provider.active = false;
        assert!(generate_slots(&ps, monday(), Tz::UTC).is_empty());
        assert!(free_windows(&ps, monday(), Tz::UTC).is_empty());
    }

    #[test]
    fn marks_booked_and_break_slots() {
        let mut ps = provider_state(45, 15);
        let b = booking(&ps, Span::new(at(10, 30), at(11, 15)), BookingStatus::Confirmed);
        ps.insert_booking(b);
        ps.insert_break(Break {
            id: Ulid::new(),
            span: Span::new(at(12, 0), at(13, 0)),
            reason: Some("lunch".into()),
        });
        let canceled = booking(&ps, Span::new(at(15, 0), at(15, 45)), BookingStatus::Canceled);
        ps.insert_booking(canceled);

        let unavailable: Vec<Ms> = generate_slots(&ps, monday(), Tz::UTC)
            .into_iter()
            .filter(|s| !s.is_available)
            .map(|s| s.start)
            .collect();
        assert_eq!(unavailable, vec![at(10, 0), at(11, 0), at(12, 0)]);
    }

    #[test]
    fn slots_follow_timezone() {
        let ps = provider_state(45, 15);
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        let slots = generate_slots(&ps, monday(), tz);
        assert_eq!(slots.len(), 9);
        assert_eq!(slots[0].start, at(12, 0));
    }

    // ── free_windows ─────────────────────────────────────

    #[test]
    fn free_windows_subtracts_taken_time() {
        let mut ps = provider_state(45, 15);
        let b = booking(&ps, Span::new(at(10, 0), at(10, 45)), BookingStatus::Pending);
        ps.insert_booking(b);
        ps.insert_break(Break {
            id: Ulid::new(),
            span: Span::new(at(10, 30), at(12, 0)),
            reason: None,
        });
        assert_eq!(
            free_windows(&ps, monday(), Tz::UTC),
            vec![Span::new(at(9, 0), at(10, 0)), Span::new(at(12, 0), at(18, 0))]
        );
    }

    // ── interval arithmetic ──────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let result = subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 250)]);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_intervals(&[Span::new(100, 300)], &[Span::new(150, 200)]);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&[Span::new(0, 1000)], &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(400, 450),
            Span::new(500, 600),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 450), Span::new(500, 600)]
        );
    }
}
