//! Notification boundary: what the engine hands to the outside world when a
//! booking changes state.
//!
//! The engine never waits on delivery. `Dispatcher::dispatch` and
//! `Dispatcher::dispatch_after` enqueue and return; a background worker
//! delivers through a [`Notifier`] with retry and records the outcome per
//! notification. A failed delivery is recorded, never surfaced to the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::Ms;
use crate::observability::NOTIFICATIONS_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Confirmation,
    Reminder,
    Review,
    Cancellation,
    WaitingList,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Confirmation => "confirmation",
            NotificationKind::Reminder => "reminder",
            NotificationKind::Review => "review",
            NotificationKind::Cancellation => "cancellation",
            NotificationKind::WaitingList => "waiting_list",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record a notification is about. `Report` is for report-delivery
/// collaborators; the engine itself only raises booking and waiting-list notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelatedEntity {
    Booking(Ulid),
    WaitingList(Ulid),
    Report(Ulid),
}

impl fmt::Display for RelatedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelatedEntity::Booking(id) => write!(f, "booking:{id}"),
            RelatedEntity::WaitingList(id) => write!(f, "waiting_list:{id}"),
            RelatedEntity::Report(id) => write!(f, "report:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    /// Account that receives the message.
    pub recipient: Ulid,
    pub kind: NotificationKind,
    pub related: RelatedEntity,
    /// Template variables for the delivery side.
    pub context: Map<String, Value>,
}

impl Notification {
    pub fn new(
        recipient: Ulid,
        kind: NotificationKind,
        related: RelatedEntity,
        context: Map<String, Value>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            recipient,
            kind,
            related,
            context,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Worth retrying (transport hiccup, rate limit).
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Retrying will not help (bad recipient, template error).
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Delivery transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let context = serde_json::Value::Object(notification.context.clone());
        info!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            kind = %notification.kind,
            related = %notification.related,
            %context,
            "notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Waiting for its delay to elapse.
    Scheduled { due_at: Ms },
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Scheduled { .. } => "scheduled",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub notification: Notification,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<Ms>,
}

/// Exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

struct Job {
    id: Ulid,
    delay: Option<Duration>,
}

type Outbox = Arc<DashMap<Ulid, DeliveryRecord>>;

/// How long a sent or failed record stays queryable by default.
pub const DEFAULT_RECORD_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Queue in front of a [`Notifier`]. Cheap to share behind an `Arc`.
///
/// Records are dropped from the outbox `retention` after they reach `Sent`
/// or `Failed`.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    outbox: Outbox,
}

impl Dispatcher {
    /// Spawns the delivery worker on the current runtime.
    pub fn new(notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self::with_retention(notifier, policy, DEFAULT_RECORD_RETENTION)
    }

    pub fn with_retention(notifier: Arc<dyn Notifier>, policy: RetryPolicy, retention: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox: Outbox = Arc::new(DashMap::new());
        tokio::spawn(worker_loop(rx, outbox.clone(), notifier, policy, retention));
        Self { tx, outbox }
    }

    /// Enqueue for immediate delivery.
    pub fn dispatch(&self, notification: Notification) -> Ulid {
        self.enqueue(notification, DeliveryStatus::Pending, None)
    }

    /// Enqueue for delivery once `delay` has elapsed.
    pub fn dispatch_after(&self, notification: Notification, delay: Duration) -> Ulid {
        let due_at = chrono::Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        self.enqueue(notification, DeliveryStatus::Scheduled { due_at }, Some(delay))
    }

    fn enqueue(
        &self,
        notification: Notification,
        status: DeliveryStatus,
        delay: Option<Duration>,
    ) -> Ulid {
        let id = notification.id;
        let kind = notification.kind;
        self.outbox.insert(
            id,
            DeliveryRecord {
                notification,
                status,
                attempts: 0,
                last_error: None,
                sent_at: None,
            },
        );
        if self.tx.send(Job { id, delay }).is_err() {
            self.outbox.remove(&id);
            warn!(notification_id = %id, kind = %kind, "dispatcher worker stopped, notification dropped");
            metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.as_str(), "status" => DeliveryStatus::Failed.as_str())
                .increment(1);
        } else {
            debug!(notification_id = %id, kind = %kind, ?delay, "notification queued");
        }
        id
    }

    /// Records currently held, in any state.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn record(&self, id: &Ulid) -> Option<DeliveryRecord> {
        self.outbox.get(id).map(|r| r.value().clone())
    }

    /// Delivery records about one entity.
    pub fn records_for(&self, related: RelatedEntity) -> Vec<DeliveryRecord> {
        let mut records: Vec<DeliveryRecord> = self
            .outbox
            .iter()
            .filter(|r| r.notification.related == related)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.notification.id);
        records
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    outbox: Outbox,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    retention: Duration,
) {
    while let Some(job) = rx.recv().await {
        let outbox = outbox.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            if let Some(delay) = job.delay {
                tokio::time::sleep(delay).await;
                if let Some(mut record) = outbox.get_mut(&job.id) {
                    record.status = DeliveryStatus::Pending;
                }
            }
            deliver_with_retry(&outbox, notifier.as_ref(), policy, job.id).await;
            tokio::time::sleep(retention).await;
            if outbox.remove(&job.id).is_some() {
                debug!(notification_id = %job.id, "delivery record evicted");
            }
        });
    }
}

async fn deliver_with_retry(outbox: &Outbox, notifier: &dyn Notifier, policy: RetryPolicy, id: Ulid) {
    let Some(notification) = outbox.get(&id).map(|r| r.notification.clone()) else {
        return;
    };
    let kind = notification.kind.as_str();

    for attempt in 1..=policy.max_attempts {
        if let Some(mut record) = outbox.get_mut(&id) {
            record.attempts = attempt;
        }
        match notifier.deliver(&notification).await {
            Ok(()) => {
                if let Some(mut record) = outbox.get_mut(&id) {
                    record.status = DeliveryStatus::Sent;
                    record.sent_at = Some(chrono::Utc::now().timestamp_millis());
                    record.last_error = None;
                }
                metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind, "status" => DeliveryStatus::Sent.as_str())
                    .increment(1);
                return;
            }
            Err(e @ DeliveryError::Rejected(_)) => {
                warn!(notification_id = %id, kind, "notification rejected: {e}");
                mark_failed(outbox, id, e.to_string());
                metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind, "status" => DeliveryStatus::Failed.as_str())
                    .increment(1);
                return;
            }
            Err(e @ DeliveryError::Transient(_)) => {
                debug!(notification_id = %id, kind, attempt, "delivery attempt failed: {e}");
                if let Some(mut record) = outbox.get_mut(&id) {
                    record.last_error = Some(e.to_string());
                }
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for_retry(attempt - 1)).await;
                }
            }
        }
    }

    warn!(notification_id = %id, kind, attempts = policy.max_attempts, "notification failed");
    if let Some(mut record) = outbox.get_mut(&id) {
        record.status = DeliveryStatus::Failed;
    }
    metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind, "status" => DeliveryStatus::Failed.as_str()).increment(1);
}

fn mark_failed(outbox: &Outbox, id: Ulid, error: String) {
    if let Some(mut record) = outbox.get_mut(&id) {
        record.status = DeliveryStatus::Failed;
        record.last_error = Some(error);
    }
}
