mod classes;
mod conflict;
mod error;
mod queries;
mod schedule;
mod store;
mod trainers;
mod waitlist;

pub use error::{EngineError, ErrorClass};
pub use schedule::TrainerUpdate;
pub use store::{LedgerGuards, MemberLedger, OccurrenceState, ScheduleStore, TrainerState};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::collab::{
    ActivityKind, ActivityLogger, IdentityProvider, MemoryIdentity, NotificationKind, Notifier,
    PaymentGateway, PaymentKind, SandboxPayments, TracingActivityLog,
};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::retry::{retry_with_predicate, RetryPolicy};
use crate::wal::Wal;

use store::{read_within, write_within, Tx};

// ── Group-commit WAL channel ─────────────────────────────

struct WalAppend {
    events: Vec<Event>,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
        }
        metrics::gauge!(crate::observability::WAL_RECORDS_WRITTEN).set(wal.records_written() as f64);

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for append in batch {
        if let Err(e) = wal.append_buffered(&append.events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

// ── Configuration & collaborators ────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_path: PathBuf,
    /// Interprets local dates/times and calendar months.
    pub timezone: Tz,
    /// Bounded wait on any single record lock.
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new(wal_path: PathBuf) -> Self {
        Self {
            wal_path,
            timezone: Tz::UTC,
            lock_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// The engine's view of the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub activity: Arc<dyn ActivityLogger>,
    pub payments: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            identity: Arc::new(MemoryIdentity::new()),
            notifier: Arc::new(NotifyHub::new()),
            activity: Arc::new(TracingActivityLog),
            payments: Arc::new(SandboxPayments::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Payment a booking has taken, carried across its retry attempts.
#[derive(Default)]
pub(crate) struct HeldCharge(tokio::sync::Mutex<Option<(Cents, String)>>);

pub struct Engine {
    pub(crate) store: ScheduleStore,
    wal_tx: mpsc::Sender<WalAppend>,
    pub(crate) config: EngineConfig,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    activity: Arc<dyn ActivityLogger>,
    pub(crate) payments: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    /// Refunds currently being paid out, keyed by reservation/appointment id.
    refunds_in_flight: DashMap<Ulid, ()>,
    /// Number of upcoming commits to fail with a storage error.
    #[cfg(test)]
    pub(crate) fail_commits: AtomicUsize,
}

impl Engine {
    /// Replay the WAL into a fresh store and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> io::Result<Self> {
        let transactions = Wal::replay(&config.wal_path)?;
        let wal = Wal::open(&config.wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = ScheduleStore::new();
        let mut replayed = 0usize;
        for tx in &transactions {
            for event in tx {
                store.replay(event);
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::info!(
                transactions = transactions.len(),
                events = replayed,
                occurrences = store.occurrence_count(),
                "replayed WAL"
            );
        }

        Ok(Self {
            store,
            wal_tx,
            config,
            identity: collaborators.identity,
            notifier: collaborators.notifier,
            activity: collaborators.activity,
            payments: collaborators.payments,
            clock: collaborators.clock,
            refunds_in_flight: DashMap::new(),
            #[cfg(test)]
            fail_commits: AtomicUsize::new(0),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn timezone(&self) -> Tz {
        self.config.timezone
    }

    /// Write one transaction to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Durably record `events` as one transaction, then apply them to the locked
    /// records in `tx`. Nothing is applied unless the write succeeded.
    pub(crate) async fn commit(&self, events: &[Event], mut tx: Tx<'_>) -> Result<(), EngineError> {
        self.injected_failure()?;
        self.wal_append(events).await?;
        for event in events {
            self.store.apply(event, &mut tx);
        }
        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&self) -> Result<(), EngineError> {
        match self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(EngineError::Storage("injected write failure".into())),
            Err(_) => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Run one attempt of an operation under the configured retry policy.
    /// Transient failures that outlive the policy become `ServiceUnavailable`.
    pub(crate) async fn with_retry<T, F, Fut>(&self, op: &'static str, attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let started = std::time::Instant::now();
        let result = retry_with_predicate(&self.config.retry, attempt, EngineError::is_transient)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    EngineError::ServiceUnavailable {
                        attempts: self.config.retry.attempts(),
                    }
                } else {
                    e
                }
            });
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(crate::observability::OPERATIONS_TOTAL, "op" => op, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Resolve a session token to a member id.
    pub async fn authenticate(&self, token: &str) -> Result<Ulid, EngineError> {
        Ok(self.identity.current_member_id(token).await?)
    }

    /// Active member with a known tier, or the reason they may not book.
    pub(crate) async fn eligible_member(&self, member_id: Ulid) -> Result<MembershipTier, EngineError> {
        if !self.identity.is_active_member(member_id).await {
            return Err(EngineError::InactiveMember(member_id));
        }
        self.identity
            .membership_tier(member_id)
            .await
            .ok_or(EngineError::InactiveMember(member_id))
    }

    /// Take payment for a booking. An earlier attempt's charge for the same
    /// amount is reused, so retries reach the gateway once. Free bookings
    /// never reach it at all.
    pub(crate) async fn charge(
        &self,
        held: &HeldCharge,
        member_id: Ulid,
        amount: Cents,
    ) -> Result<Option<String>, EngineError> {
        let mut held = held.0.lock().await;
        if let Some((paid, receipt)) = held.as_ref()
            && *paid == amount
        {
            return Ok(Some(receipt.clone()));
        }
        if let Some((paid, receipt)) = held.take() {
            self.reverse_charge(member_id, paid, &receipt).await;
        }
        if amount <= 0 {
            return Ok(None);
        }
        let receipt = self
            .payments
            .charge_or_refund(member_id, amount, PaymentKind::Charge)
            .await?;
        *held = Some((amount, receipt.clone()));
        Ok(Some(receipt))
    }

    /// Give back whatever a booking that never committed was charged.
    pub(crate) async fn release_charge(&self, held: HeldCharge, member_id: Ulid) {
        if let Some((amount, receipt)) = held.0.into_inner() {
            self.reverse_charge(member_id, amount, &receipt).await;
        }
    }

    /// Give back a charge whose booking failed to commit.
    async fn reverse_charge(&self, member_id: Ulid, amount: Cents, receipt: &str) {
        match self
            .payments
            .charge_or_refund(member_id, amount, PaymentKind::Refund)
            .await
        {
            Ok(refund) => {
                tracing::warn!(member = %member_id, amount, charge = receipt, %refund, "booking not committed; charge reversed");
            }
            Err(e) => {
                tracing::error!(member = %member_id, amount, charge = receipt, "booking not committed and charge reversal failed: {e}");
            }
        }
    }

    /// Pay out a committed refund. Returns the resulting status: `Issued` once
    /// the gateway has paid, `Pending` if it failed or another task is already
    /// paying this refund. A pending refund is retried by the reaper.
    pub(crate) async fn settle_refund(&self, pending: &PendingRefund) -> RefundStatus {
        let record_id = pending.target.record_id();
        if self.refunds_in_flight.insert(record_id, ()).is_some() {
            return RefundStatus::Pending;
        }

        // Re-check under the claim: someone may have paid it since it was read.
        match self.refund_status(&pending.target).await {
            Ok(RefundStatus::Pending) => {}
            Ok(other) => {
                self.refunds_in_flight.remove(&record_id);
                return other;
            }
            Err(e) => {
                self.refunds_in_flight.remove(&record_id);
                tracing::debug!(record = %record_id, "refund status unavailable: {e}");
                return RefundStatus::Pending;
            }
        }

        let receipt = match self
            .payments
            .charge_or_refund(pending.member_id, pending.amount, PaymentKind::Refund)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.refunds_in_flight.remove(&record_id);
                metrics::counter!(crate::observability::REFUNDS_PENDING_TOTAL).increment(1);
                tracing::warn!(member = %pending.member_id, record = %record_id, amount = pending.amount, "refund left pending: {e}");
                self.record(
                    Some(pending.member_id),
                    ActivityKind::RefundPending,
                    json!({ "record_id": record_id, "amount": pending.amount, "error": e.to_string() }),
                );
                return RefundStatus::Pending;
            }
        };

        let event = Event::RefundIssued {
            target: pending.target,
            receipt: receipt.clone(),
        };
        let event = &event;
        match self.with_retry("record_refund", move || self.record_refund(event)).await {
            Ok(()) => {
                self.refunds_in_flight.remove(&record_id);
            }
            Err(e) => {
                // Paid but not durable. Keep the claim so this process never pays twice.
                tracing::error!(member = %pending.member_id, record = %record_id, %receipt, "refund paid but not recorded: {e}");
            }
        }
        let payload = json!({ "record_id": record_id, "amount": pending.amount, "receipt": receipt });
        self.notify(pending.member_id, NotificationKind::RefundIssued, payload.clone());
        self.record(Some(pending.member_id), ActivityKind::RefundIssued, payload);
        RefundStatus::Issued { receipt }
    }

    async fn refund_status(&self, target: &RefundTarget) -> Result<RefundStatus, EngineError> {
        let timeout = self.config.lock_timeout;
        match *target {
            RefundTarget::Reservation { id, occurrence_id } => {
                let shared = self
                    .store
                    .get_occurrence(&occurrence_id)
                    .ok_or(EngineError::NotFound(occurrence_id))?;
                let occ = read_within(&shared, occurrence_id, timeout).await?;
                occ.reservation(id)
                    .map(|r| r.refund_status.clone())
                    .ok_or(EngineError::NotFound(id))
            }
            RefundTarget::Appointment { id, trainer_id } => {
                let shared = self
                    .store
                    .get_trainer(&trainer_id)
                    .ok_or(EngineError::NotFound(trainer_id))?;
                let trainer = read_within(&shared, trainer_id, timeout).await?;
                trainer
                    .appointments
                    .get(&id)
                    .map(|a| a.refund_status.clone())
                    .ok_or(EngineError::NotFound(id))
            }
        }
    }

    async fn record_refund(&self, event: &Event) -> Result<(), EngineError> {
        let Event::RefundIssued { target, .. } = event else {
            return Ok(());
        };
        let timeout = self.config.lock_timeout;
        match *target {
            RefundTarget::Reservation { occurrence_id, .. } => {
                let shared = self
                    .store
                    .get_occurrence(&occurrence_id)
                    .ok_or(EngineError::NotFound(occurrence_id))?;
                let mut occ = write_within(&shared, occurrence_id, timeout).await?;
                let tx = Tx {
                    occurrence: Some(&mut *occ),
                    ..Tx::default()
                };
                self.commit(std::slice::from_ref(event), tx).await
            }
            RefundTarget::Appointment { trainer_id, .. } => {
                let shared = self
                    .store
                    .get_trainer(&trainer_id)
                    .ok_or(EngineError::NotFound(trainer_id))?;
                let mut trainer = write_within(&shared, trainer_id, timeout).await?;
                let tx = Tx {
                    trainer: Some(&mut *trainer),
                    ..Tx::default()
                };
                self.commit(std::slice::from_ref(event), tx).await
            }
        }
    }

    pub(crate) fn notify(&self, member_id: Ulid, kind: NotificationKind, payload: Value) {
        self.notifier.notify(member_id, kind, payload);
    }

    pub(crate) fn record(&self, member_id: Option<Ulid>, kind: ActivityKind, details: Value) {
        self.activity.record(member_id, kind, details);
    }
}

/// Reject over-long free text; blank becomes `None`.
pub(crate) fn clean_text(
    value: Option<String>,
    max: usize,
    field: &str,
) -> Result<Option<String>, EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::InvalidInput(format!(
            "{field} longer than {max} bytes"
        ))),
        Some(v) if v.trim().is_empty() => Ok(None),
        other => Ok(other),
    }
}
