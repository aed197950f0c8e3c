//! Periodic sweeps that drive the time-based part of the booking lifecycle,
//! plus the background loops that run them.
//!
//! Every sweep selects its candidates first and then transitions each one
//! independently under that booking's provider lock. A record that changed in
//! between (lost race) is skipped; a record that fails is logged and the sweep
//! moves on. Running a sweep twice in a row affects nothing the second time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::calendar;
use crate::dispatch::{DeliveryStatus, Notification, NotificationKind, RelatedEntity};
use crate::engine::{Engine, EngineError, now_ms};
use crate::model::{Booking, BookingStatus, Ms};
use crate::observability::{SWEEP_AFFECTED_TOTAL, SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL};

pub const CONFIRMATION_TIMEOUT_REASON: &str = "confirmation timeout expired";

const SWEEP_TIMEOUT: &str = "confirmation_timeout";
const SWEEP_COMPLETION: &str = "completion";
const SWEEP_ARCHIVAL: &str = "archival";
const SWEEP_WAITING_LIST: &str = "waiting_list";
const SWEEP_REMINDER: &str = "reminder";
const SWEEP_REVIEW: &str = "review";

fn record_sweep(sweep: &'static str, affected: usize, failures: usize, started: Instant) {
    metrics::counter!(SWEEP_AFFECTED_TOTAL, "sweep" => sweep).increment(affected as u64);
    if failures > 0 {
        metrics::counter!(SWEEP_FAILURES_TOTAL, "sweep" => sweep).increment(failures as u64);
    }
    metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => sweep)
        .record(started.elapsed().as_secs_f64());
    if affected > 0 || failures > 0 {
        info!(sweep, count = affected, failures, "sweep finished");
    } else {
        debug!(sweep, "sweep found nothing to do");
    }
}

impl Engine {
    pub async fn run_confirmation_timeout_sweep(&self) -> usize {
        self.run_confirmation_timeout_sweep_at(now_ms()).await
    }

    /// Cancel pending bookings created more than the confirmation timeout before `now`.
    pub async fn run_confirmation_timeout_sweep_at(&self, now: Ms) -> usize {
        let policy = self.settings.lifecycle;
        let due = self
            .collect_bookings(|b| policy.confirmation_expired(b, now))
            .await;
        self.transition_all(
            SWEEP_TIMEOUT,
            due,
            BookingStatus::Pending,
            BookingStatus::Canceled,
            Some(CONFIRMATION_TIMEOUT_REASON),
            now,
        )
        .await
    }

    pub async fn run_completion_sweep(&self) -> usize {
        self.run_completion_sweep_at(now_ms()).await
    }

    /// Complete confirmed bookings whose end has passed; each schedules a review request.
    pub async fn run_completion_sweep_at(&self, now: Ms) -> usize {
        let policy = self.settings.lifecycle;
        let due = self.collect_bookings(|b| policy.completable(b, now)).await;
        self.transition_all(
            SWEEP_COMPLETION,
            due,
            BookingStatus::Confirmed,
            BookingStatus::Completed,
            None,
            now,
        )
        .await
    }

    pub async fn run_archival_sweep(&self) -> usize {
        self.run_archival_sweep_at(now_ms()).await
    }

    /// Archive completed/canceled bookings that ended beyond the retention period.
    pub async fn run_archival_sweep_at(&self, now: Ms) -> usize {
        let started = Instant::now();
        let policy = self.settings.lifecycle;
        let due = self.collect_bookings(|b| policy.archivable(b, now)).await;
        let (mut affected, mut failures) = (0, 0);
        for b in due {
            // Source status differs per booking, so no single expected state.
            match self.apply_transition(b.id, Some(b.status), BookingStatus::Archived, None, now).await {
                Ok(_) => affected += 1,
                Err(e) => failures += self.sweep_failure(SWEEP_ARCHIVAL, &b, e),
            }
        }
        record_sweep(SWEEP_ARCHIVAL, affected, failures, started);
        affected
    }

    async fn transition_all(
        &self,
        sweep: &'static str,
        due: Vec<Booking>,
        from: BookingStatus,
        to: BookingStatus,
        reason: Option<&str>,
        now: Ms,
    ) -> usize {
        let started = Instant::now();
        let (mut affected, mut failures) = (0, 0);
        for b in due {
            match self
                .apply_transition(b.id, Some(from), to, reason.map(str::to_owned), now)
                .await
            {
                Ok(_) => affected += 1,
                Err(e) => failures += self.sweep_failure(sweep, &b, e),
            }
        }
        record_sweep(sweep, affected, failures, started);
        affected
    }

    /// Log a per-record failure. Returns 1 for real failures, 0 for lost races.
    fn sweep_failure(&self, sweep: &'static str, booking: &Booking, e: EngineError) -> usize {
        match e {
            EngineError::InvalidTransition { from, .. } => {
                debug!(sweep, booking_id = %booking.id, %from, "already moved on, skipping");
                0
            }
            e => {
                warn!(sweep, booking_id = %booking.id, provider_id = %booking.provider_id, "sweep failed for booking: {e}");
                1
            }
        }
    }

    pub async fn run_waiting_list_sweep(&self) -> usize {
        self.run_waiting_list_sweep_at(now_ms()).await
    }

    pub async fn run_waiting_list_sweep_at(&self, now: Ms) -> usize {
        self.notify_waiting_list(None, now).await
    }

    /// Notify unnotified waiting-list entries whose provider has a free slot
    /// starting after `now` on the desired date. Entries without one stay
    /// unnotified for the next run.
    pub(crate) async fn notify_waiting_list(&self, scope: Option<(Ulid, NaiveDate)>, now: Ms) -> usize {
        let started = Instant::now();
        let (mut affected, mut failures) = (0, 0);

        for entry in self.collect_unnotified(scope).await {
            let free: Vec<Ms> = self
                .generate_slots(entry.provider_id, entry.desired_date)
                .await
                .into_iter()
                .filter(|s| s.is_available && s.start > now)
                .map(|s| s.start)
                .collect();
            if free.is_empty() {
                continue;
            }
            match self.mark_waiting_notified(entry.id).await {
                Ok(true) => {
                    let tz = self.settings.timezone;
                    let mut context = serde_json::Map::new();
                    context.insert("provider_id".into(), Value::from(entry.provider_id.to_string()));
                    context.insert("date".into(), Value::from(entry.desired_date.to_string()));
                    context.insert("free_slots".into(), Value::from(free.len()));
                    context.insert(
                        "first_free".into(),
                        Value::from(calendar::format_time(free[0], tz)),
                    );
                    if let Some(pref) = &entry.time_preference {
                        context.insert("time_preference".into(), Value::from(pref.clone()));
                    }
                    self.dispatcher.dispatch(Notification::new(
                        entry.user_id,
                        NotificationKind::WaitingList,
                        RelatedEntity::WaitingList(entry.id),
                        context,
                    ));
                    affected += 1;
                }
                Ok(false) => debug!(entry_id = %entry.id, "waiting-list entry already notified"),
                Err(e) => {
                    warn!(entry_id = %entry.id, provider_id = %entry.provider_id, "waiting-list notification failed: {e}");
                    failures += 1;
                }
            }
        }

        record_sweep(SWEEP_WAITING_LIST, affected, failures, started);
        affected
    }

    pub async fn run_reminder_sweep(&self) -> usize {
        self.run_reminder_sweep_at(now_ms()).await
    }

    /// Remind confirmed bookings that start on the local calendar day after `now`. Once each.
    pub async fn run_reminder_sweep_at(&self, now: Ms) -> usize {
        let started = Instant::now();
        let tz = self.settings.timezone;
        let Some(tomorrow) = calendar::local_date(now, tz).and_then(|d| d.checked_add_days(Days::new(1))) else {
            return 0;
        };
        let due = self
            .collect_bookings(|b| {
                b.status == BookingStatus::Confirmed
                    && !b.reminder_sent
                    && calendar::local_date(b.span.start, tz) == Some(tomorrow)
            })
            .await;

        let (mut affected, mut failures) = (0, 0);
        for b in due {
            match self.mark_reminder_sent(b.id).await {
                Ok(true) => {
                    self.dispatcher.dispatch(Notification::new(
                        b.user_id,
                        NotificationKind::Reminder,
                        RelatedEntity::Booking(b.id),
                        self.booking_context(&b),
                    ));
                    affected += 1;
                }
                Ok(false) => debug!(booking_id = %b.id, "reminder no longer due"),
                Err(e) => failures += self.sweep_failure(SWEEP_REMINDER, &b, e),
            }
        }
        record_sweep(SWEEP_REMINDER, affected, failures, started);
        affected
    }

    pub async fn run_review_sweep(&self) -> usize {
        self.run_review_sweep_at(now_ms()).await
    }

    /// Follow up on review requests of completed bookings. A request whose
    /// delivery finished is flagged settled in the WAL; one the dispatcher no
    /// longer holds (lost with a restart) is queued again for its original due
    /// time. Returns the number re-queued.
    pub async fn run_review_sweep_at(&self, now: Ms) -> usize {
        let started = Instant::now();
        let due = self
            .collect_bookings(|b| b.status == BookingStatus::Completed && !b.review_settled)
            .await;
        let delay = self.settings.lifecycle.review_delay;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        let (mut affected, mut failures) = (0, 0);
        for b in due {
            let statuses: Vec<DeliveryStatus> = self
                .dispatcher
                .records_for(RelatedEntity::Booking(b.id))
                .into_iter()
                .filter(|r| r.notification.kind == NotificationKind::Review)
                .map(|r| r.status)
                .collect();

            if statuses.iter().any(|s| matches!(s, DeliveryStatus::Sent | DeliveryStatus::Failed)) {
                match self.mark_review_settled(b.id).await {
                    Ok(_) => debug!(booking_id = %b.id, "review request settled"),
                    Err(e) => failures += self.sweep_failure(SWEEP_REVIEW, &b, e),
                }
                continue;
            }
            if !statuses.is_empty() {
                continue;
            }

            // Completion is the last transition, so `updated_at` is when it happened.
            let due_at = b.updated_at.saturating_add(delay_ms);
            let notification = self.review_notification(&b);
            if due_at > now {
                self.dispatcher
                    .dispatch_after(notification, Duration::from_millis((due_at - now) as u64));
            } else {
                self.dispatcher.dispatch(notification);
            }
            info!(booking_id = %b.id, due_at, "review request re-queued");
            affected += 1;
        }
        record_sweep(SWEEP_REVIEW, affected, failures, started);
        affected
    }
}

/// How often each sweep runs.
#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule {
    pub confirmation_timeout: Duration,
    pub completion: Duration,
    pub archival: Duration,
    pub waiting_list: Duration,
    pub reminder: Duration,
    pub review: Duration,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(3600),
            completion: Duration::from_secs(900),
            archival: Duration::from_secs(86_400),
            waiting_list: Duration::from_secs(300),
            reminder: Duration::from_secs(3600),
            review: Duration::from_secs(300),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// Background task running every sweep on its own cadence. Sweeps run one at
/// a time per engine; each tick fires immediately on start.
pub async fn run_housekeeping(engine: Arc<Engine>, schedule: SweepSchedule) {
    let mut timeout = ticker(schedule.confirmation_timeout);
    let mut completion = ticker(schedule.completion);
    let mut archival = ticker(schedule.archival);
    let mut waiting_list = ticker(schedule.waiting_list);
    let mut reminder = ticker(schedule.reminder);
    let mut review = ticker(schedule.review);

    loop {
        tokio::select! {
            _ = timeout.tick() => { engine.run_confirmation_timeout_sweep().await; }
            _ = completion.tick() => { engine.run_completion_sweep().await; }
            _ = archival.tick() => { engine.run_archival_sweep().await; }
            _ = waiting_list.tick() => { engine.run_waiting_list_sweep().await; }
            _ = reminder.tick() => { engine.run_reminder_sweep().await; }
            _ = review.tick() => { engine.run_review_sweep().await; }
        }
    }
}

/// Background task compacting the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = ticker(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{RecordingNotifier, fast_policy};
    use crate::dispatch::{DeliveryStatus, Dispatcher};
    use crate::engine::EngineSettings;
    use crate::model::{DAY_MS, HOUR_MS, MINUTE_MS};
    use crate::notify::NotifyHub;
    use chrono::NaiveTime;
    use chrono_tz::Tz;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_housekeeping");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> Ms {
        calendar::to_ms(date, NaiveTime::from_hms_opt(h, m, 0).unwrap(), Tz::UTC).unwrap()
    }

    fn open(path: PathBuf) -> (Arc<Engine>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Arc::new(Dispatcher::new(notifier.clone(), fast_policy(1)));
        let engine = Arc::new(
            Engine::new(path, Arc::new(NotifyHub::new()), dispatcher, EngineSettings::default())
                .unwrap(),
        );
        (engine, notifier)
    }

    async fn setup(name: &str) -> (Arc<Engine>, Arc<RecordingNotifier>, Ulid) {
        let (engine, notifier) = open(test_wal_path(name));
        let pid = Ulid::new();
        engine
            .create_provider(pid, Ulid::new(), None, 45, 15, 20)
            .await
            .unwrap();
        for day in 0..7 {
            engine
                .set_availability(
                    pid,
                    day,
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                    true,
                )
                .await
                .unwrap();
        }
        (engine, notifier, pid)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn timeout_sweep_respects_twelve_hours() {
        let (engine, _, pid) = setup("timeout.wal").await;
        let t = at(monday(), 8, 0);
        let b = engine
            .create_booking_at(pid, Ulid::new(), at(monday(), 10, 0) + 2 * DAY_MS, None, t)
            .await
            .unwrap();

        assert_eq!(engine.run_confirmation_timeout_sweep_at(t + 11 * HOUR_MS + 59 * MINUTE_MS).await, 0);
        assert_eq!(engine.get_booking(b.id).await.unwrap().status, BookingStatus::Pending);

        assert_eq!(engine.run_confirmation_timeout_sweep_at(t + 12 * HOUR_MS + MINUTE_MS).await, 1);
        let canceled = engine.get_booking(b.id).await.unwrap();
        assert_eq!(canceled.status, BookingStatus::Canceled);
        assert_eq!(canceled.cancel_reason.as_deref(), Some(CONFIRMATION_TIMEOUT_REASON));

        // Idempotent
        assert_eq!(engine.run_confirmation_timeout_sweep_at(t + 13 * HOUR_MS).await, 0);
    }

    #[tokio::test]
    async fn timeout_sweep_sends_cancellation() {
        let (engine, notifier, pid) = setup("timeout_notify.wal").await;
        let t = at(monday(), 8, 0);
        engine
            .create_booking_at(pid, Ulid::new(), at(monday(), 10, 0) + DAY_MS, None, t)
            .await
            .unwrap();
        engine.run_confirmation_timeout_sweep_at(t + DAY_MS).await;
        settle().await;
        assert_eq!(notifier.kinds(), vec![NotificationKind::Cancellation]);
        let sent = notifier.delivered.lock().unwrap()[0].clone();
        assert_eq!(sent.context["reason"], Value::from(CONFIRMATION_TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn completion_sweep_schedules_review() {
        let (engine, notifier, pid) = setup("completion.wal").await;
        let t = at(monday(), 8, 0);
        let start = at(monday(), 10, 0);
        let b = engine.create_booking_at(pid, Ulid::new(), start, None, t).await.unwrap();
        engine
            .transition_booking_at(b.id, BookingStatus::Confirmed, None, t)
            .await
            .unwrap();

        // Not yet over.
        assert_eq!(engine.run_completion_sweep_at(b.span.end).await, 0);
        assert_eq!(engine.run_completion_sweep_at(b.span.end + 1).await, 1);
        assert_eq!(engine.get_booking(b.id).await.unwrap().status, BookingStatus::Completed);
        assert_eq!(engine.run_completion_sweep_at(b.span.end + HOUR_MS).await, 0);

        settle().await;
        let reviews: Vec<_> = engine
            .dispatcher
            .records_for(RelatedEntity::Booking(b.id))
            .into_iter()
            .filter(|r| r.notification.kind == NotificationKind::Review)
            .collect();
        assert_eq!(reviews.len(), 1);
        assert!(matches!(reviews[0].status, DeliveryStatus::Scheduled { .. }));
        assert!(!notifier.kinds().contains(&NotificationKind::Review));
    }

    fn review_statuses(engine: &Engine, booking: Ulid) -> Vec<DeliveryStatus> {
        engine
            .dispatcher
            .records_for(RelatedEntity::Booking(booking))
            .into_iter()
            .filter(|r| r.notification.kind == NotificationKind::Review)
            .map(|r| r.status)
            .collect()
    }

    #[tokio::test]
    async fn review_sweep_leaves_scheduled_request_alone() {
        let (engine, notifier, pid) = setup("review_in_flight.wal").await;
        let t = at(monday(), 8, 0);
        let b = engine.create_booking_at(pid, Ulid::new(), at(monday(), 10, 0), None, t).await.unwrap();
        engine.transition_booking_at(b.id, BookingStatus::Confirmed, None, t).await.unwrap();
        engine.run_completion_sweep_at(b.span.end + 1).await;

        assert_eq!(engine.run_review_sweep_at(b.span.end + 10 * MINUTE_MS).await, 0);
        settle().await;
        assert_eq!(review_statuses(&engine, b.id).len(), 1);
        assert!(!engine.get_booking(b.id).await.unwrap().review_settled);
        assert!(!notifier.kinds().contains(&NotificationKind::Review));
    }

    #[tokio::test]
    async fn review_request_survives_restart() {
        let path = test_wal_path("review_restart.wal");
        let t = at(monday(), 8, 0);
        let (booking, completed_at) = {
            let (engine, _) = open(path.clone());
            let pid = Ulid::new();
            engine.create_provider(pid, Ulid::new(), None, 45, 15, 20).await.unwrap();
            let b = engine.create_booking_at(pid, Ulid::new(), at(monday(), 10, 0), None, t).await.unwrap();
            engine.transition_booking_at(b.id, BookingStatus::Confirmed, None, t).await.unwrap();
            let completed_at = b.span.end + 1;
            assert_eq!(engine.run_completion_sweep_at(completed_at).await, 1);
            (b, completed_at)
        };

        // Restarted within the hour: the request is queued again for its due time.
        let (engine, notifier) = open(path.clone());
        assert!(review_statuses(&engine, booking.id).is_empty());
        assert_eq!(engine.run_review_sweep_at(completed_at + 10 * MINUTE_MS).await, 1);
        assert!(matches!(
            review_statuses(&engine, booking.id).as_slice(),
            [DeliveryStatus::Scheduled { .. }]
        ));
        assert_eq!(engine.run_review_sweep_at(completed_at + 10 * MINUTE_MS).await, 0);
        settle().await;
        assert!(notifier.kinds().is_empty());
        drop(engine);

        // Restarted after the due time: sent straight away, then flagged settled.
        let (engine, notifier) = open(path.clone());
        assert_eq!(engine.run_review_sweep_at(completed_at + 2 * HOUR_MS).await, 1);
        settle().await;
        assert_eq!(notifier.kinds(), vec![NotificationKind::Review]);
        let sent = notifier.delivered.lock().unwrap()[0].clone();
        assert_eq!(sent.recipient, booking.user_id);
        assert_eq!(sent.context["confirmation_code"], Value::from(booking.confirmation_code.clone()));

        assert_eq!(engine.run_review_sweep_at(completed_at + 2 * HOUR_MS).await, 0);
        assert!(engine.get_booking(booking.id).await.unwrap().review_settled);
        engine.compact_wal().await.unwrap();
        drop(engine);

        // The flag is durable, so nothing goes out twice.
        let (engine, notifier) = open(path);
        assert!(engine.get_booking(booking.id).await.unwrap().review_settled);
        assert_eq!(engine.run_review_sweep_at(completed_at + 3 * HOUR_MS).await, 0);
        settle().await;
        assert!(notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn archival_sweep_after_a_year() {
        let (engine, notifier, pid) = setup("archival.wal").await;
        let t = at(monday(), 8, 0);
        let done = engine.create_booking_at(pid, Ulid::new(), at(monday(), 9, 0), None, t).await.unwrap();
        let gone = engine.create_booking_at(pid, Ulid::new(), at(monday(), 11, 0), None, t).await.unwrap();
        let live = engine.create_booking_at(pid, Ulid::new(), at(monday(), 13, 0), None, t).await.unwrap();
        engine.transition_booking_at(done.id, BookingStatus::Confirmed, None, t).await.unwrap();
        engine.transition_booking_at(live.id, BookingStatus::Confirmed, None, t).await.unwrap();
        engine.run_completion_sweep_at(done.span.end + 1).await;
        engine
            .transition_booking_at(gone.id, BookingStatus::Canceled, None, t)
            .await
            .unwrap();
        settle().await;
        let sent_before = notifier.kinds().len();

        let year_later = at(monday(), 10, 0) + 365 * DAY_MS;
        assert_eq!(engine.run_archival_sweep_at(year_later).await, 1, "only `done` ended > 365 days ago");

        let much_later = at(monday(), 18, 0) + 400 * DAY_MS;
        assert_eq!(engine.run_archival_sweep_at(much_later).await, 1);
        assert_eq!(engine.run_archival_sweep_at(much_later).await, 0);

        assert_eq!(engine.get_booking(done.id).await.unwrap().status, BookingStatus::Archived);
        assert_eq!(engine.get_booking(gone.id).await.unwrap().status, BookingStatus::Archived);
        assert_eq!(engine.get_booking(live.id).await.unwrap().status, BookingStatus::Confirmed);

        settle().await;
        assert_eq!(notifier.kinds().len(), sent_before, "archival sends nothing");
    }

    #[tokio::test]
    async fn waiting_list_gated_on_free_slot() {
        let (engine, notifier, pid) = setup("waiting_gate.wal").await;
        let now = at(monday(), 7, 0);
        let tuesday = monday().succ_opt().unwrap();

        // Fill Tuesday completely.
        let mut booked = Vec::new();
        for slot in engine.generate_slots(pid, tuesday).await {
            booked.push(
                engine
                    .create_booking_at(pid, Ulid::new(), slot.start, None, now)
                    .await
                    .unwrap(),
            );
        }
        let entry = engine
            .join_waiting_list(Ulid::new(), pid, Ulid::new(), tuesday, Some("morning".into()))
            .await
            .unwrap();

        assert_eq!(engine.run_waiting_list_sweep_at(now).await, 0);
        assert!(!engine.waiting_list(pid).await[0].notified);

        // A cancellation frees a slot and re-runs the sweep for that provider/date.
        engine
            .transition_booking_at(booked[3].id, BookingStatus::Canceled, Some("moved".into()), now)
            .await
            .unwrap();
        assert!(engine.waiting_list(pid).await[0].notified);
        assert_eq!(engine.run_waiting_list_sweep_at(now).await, 0);

        settle().await;
        let waiting = engine.dispatcher.records_for(RelatedEntity::WaitingList(entry.id));
        assert_eq!(waiting.len(), 1);
        assert!(notifier.kinds().contains(&NotificationKind::WaitingList));
    }

    #[tokio::test]
    async fn waiting_list_ignores_past_slots() {
        let (engine, _, pid) = setup("waiting_past.wal").await;
        engine
            .join_waiting_list(Ulid::new(), pid, Ulid::new(), monday(), None)
            .await
            .unwrap();
        // Every Monday slot has already started.
        assert_eq!(engine.run_waiting_list_sweep_at(at(monday(), 17, 30)).await, 0);
        assert_eq!(engine.run_waiting_list_sweep_at(at(monday(), 8, 0)).await, 1);
        assert_eq!(engine.run_waiting_list_sweep_at(at(monday(), 8, 0)).await, 0);
    }

    #[tokio::test]
    async fn reminder_sweep_targets_tomorrow_once() {
        let (engine, notifier, pid) = setup("reminder.wal").await;
        let now = at(monday(), 8, 0);
        let tuesday = monday().succ_opt().unwrap();
        let wednesday = tuesday.succ_opt().unwrap();

        let tomorrow = engine.create_booking_at(pid, Ulid::new(), at(tuesday, 10, 0), None, now).await.unwrap();
        let later = engine.create_booking_at(pid, Ulid::new(), at(wednesday, 10, 0), None, now).await.unwrap();
        let unconfirmed = engine.create_booking_at(pid, Ulid::new(), at(tuesday, 12, 0), None, now).await.unwrap();
        for id in [tomorrow.id, later.id] {
            engine.transition_booking_at(id, BookingStatus::Confirmed, None, now).await.unwrap();
        }

        assert_eq!(engine.run_reminder_sweep_at(now).await, 1);
        assert_eq!(engine.run_reminder_sweep_at(now + HOUR_MS).await, 0);
        assert!(engine.get_booking(tomorrow.id).await.unwrap().reminder_sent);
        assert!(!engine.get_booking(later.id).await.unwrap().reminder_sent);
        assert!(!engine.get_booking(unconfirmed.id).await.unwrap().reminder_sent);

        settle().await;
        let reminders = notifier
            .kinds()
            .into_iter()
            .filter(|k| *k == NotificationKind::Reminder)
            .count();
        assert_eq!(reminders, 1);
    }

    #[tokio::test]
    async fn sweep_survives_lost_race() {
        let (engine, _, pid) = setup("lost_race.wal").await;
        let t = at(monday(), 8, 0);
        let a = engine.create_booking_at(pid, Ulid::new(), at(monday(), 10, 0), None, t).await.unwrap();
        let b = engine.create_booking_at(pid, Ulid::new(), at(monday(), 11, 0), None, t).await.unwrap();

        // Selected as pending, confirmed before the sweep reaches it.
        let policy = engine.settings.lifecycle;
        let due = engine
            .collect_bookings(|bk| policy.confirmation_expired(bk, t + DAY_MS))
            .await;
        assert_eq!(due.len(), 2);
        engine.transition_booking_at(a.id, BookingStatus::Confirmed, None, t).await.unwrap();

        let affected = engine
            .transition_all(
                "test",
                due,
                BookingStatus::Pending,
                BookingStatus::Canceled,
                Some(CONFIRMATION_TIMEOUT_REASON),
                t + DAY_MS,
            )
            .await;
        assert_eq!(affected, 1);
        assert_eq!(engine.get_booking(a.id).await.unwrap().status, BookingStatus::Confirmed);
        assert_eq!(engine.get_booking(b.id).await.unwrap().status, BookingStatus::Canceled);
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let (engine, _, _) = setup("compactor.wal").await;
        assert_eq!(engine.wal_appends_since_compact().await, 8);
        let handle = tokio::spawn(run_compactor(engine.clone(), 5));
        settle().await;
        handle.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
