//! Narrow interfaces to the systems the engine does not own: identity,
//! notification delivery, the activity log and payments. Each comes with an
//! in-process implementation used by the server binary and the tests.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::model::{Cents, MembershipTier};

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unauthenticated")]
pub struct Unauthenticated;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the member behind a session token.
    async fn current_member_id(&self, token: &str) -> Result<Ulid, Unauthenticated>;
    async fn is_active_member(&self, member_id: Ulid) -> bool;
    /// `None` for members the provider does not know.
    async fn membership_tier(&self, member_id: Ulid) -> Option<MembershipTier>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub token: String,
    pub member_id: Ulid,
    pub tier: MembershipTier,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Default)]
pub struct MemoryIdentity {
    tokens: DashMap<String, Ulid>,
    members: DashMap<Ulid, (MembershipTier, bool)>,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of [`MemberEntry`].
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<MemberEntry> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let identity = Self::new();
        for entry in entries {
            identity.insert(entry);
        }
        Ok(identity)
    }

    pub fn insert(&self, entry: MemberEntry) {
        self.tokens.insert(entry.token, entry.member_id);
        self.members.insert(entry.member_id, (entry.tier, entry.active));
    }

    /// Register a member without a token.
    pub fn add_member(&self, member_id: Ulid, tier: MembershipTier) {
        self.members.insert(member_id, (tier, true));
    }

    pub fn set_active(&self, member_id: Ulid, active: bool) {
        if let Some(mut m) = self.members.get_mut(&member_id) {
            m.1 = active;
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn current_member_id(&self, token: &str) -> Result<Ulid, Unauthenticated> {
        self.tokens.get(token).map(|e| *e.value()).ok_or(Unauthenticated)
    }

    async fn is_active_member(&self, member_id: Ulid) -> bool {
        self.members.get(&member_id).is_some_and(|m| m.1)
    }

    async fn membership_tier(&self, member_id: Ulid) -> Option<MembershipTier> {
        self.members.get(&member_id).map(|m| m.0)
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BookingConfirmed,
    Waitlisted,
    WaitlistPromoted,
    /// The class was held without a seat freeing up.
    WaitlistExpired,
    ReservationCancelled,
    OccurrenceCancelled,
    AppointmentBooked,
    AppointmentCancelled,
    RefundIssued,
}

/// Fire-and-forget delivery. Implementations must not block and must swallow
/// their own failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, member_id: Ulid, kind: NotificationKind, payload: Value);
}

// ── Activity log ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ClassBooked,
    ClassCancelled,
    WaitlistPromoted,
    AppointmentBooked,
    AppointmentCancelled,
    OccurrenceScheduled,
    OccurrenceCancelled,
    OccurrenceCompleted,
    TrainerRegistered,
    TrainerUpdated,
    TrainerSlotOpened,
    RefundPending,
    RefundIssued,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::ClassBooked => "class_booked",
            ActivityKind::ClassCancelled => "class_cancelled",
            ActivityKind::WaitlistPromoted => "waitlist_promoted",
            ActivityKind::AppointmentBooked => "appointment_booked",
            ActivityKind::AppointmentCancelled => "appointment_cancelled",
            ActivityKind::OccurrenceScheduled => "occurrence_scheduled",
            ActivityKind::OccurrenceCancelled => "occurrence_cancelled",
            ActivityKind::OccurrenceCompleted => "occurrence_completed",
            ActivityKind::TrainerRegistered => "trainer_registered",
            ActivityKind::TrainerUpdated => "trainer_updated",
            ActivityKind::TrainerSlotOpened => "trainer_slot_opened",
            ActivityKind::RefundPending => "refund_pending",
            ActivityKind::RefundIssued => "refund_issued",
        }
    }
}

/// Best-effort audit trail; never affects the caller's result.
pub trait ActivityLogger: Send + Sync {
    fn record(&self, member_id: Option<Ulid>, kind: ActivityKind, details: Value);
}

/// Writes activity as structured `tracing` events under the `activity` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

impl ActivityLogger for TracingActivityLog {
    fn record(&self, member_id: Option<Ulid>, kind: ActivityKind, details: Value) {
        let member = member_id.map(|m| m.to_string()).unwrap_or_else(|| "-".into());
        tracing::info!(target: "activity", kind = kind.as_str(), member = %member, %details);
    }
}

pub type ActivityEntry = (Option<Ulid>, ActivityKind, Value);

/// Keeps everything in memory. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl RecordingActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: ActivityKind) -> usize {
        self.entries().iter().filter(|(_, k, _)| *k == kind).count()
    }
}

impl ActivityLogger for RecordingActivityLog {
    fn record(&self, member_id: Option<Ulid>, kind: ActivityKind, details: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((member_id, kind, details));
        }
    }
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Charge,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Move `amount` in the direction of `kind`; returns a receipt id.
    async fn charge_or_refund(
        &self,
        member_id: Ulid,
        amount: Cents,
        kind: PaymentKind,
    ) -> Result<String, PaymentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub member_id: Ulid,
    pub amount: Cents,
    pub kind: PaymentKind,
    pub receipt: String,
}

/// Approves everything unless told otherwise, and remembers what it did.
#[derive(Debug, Default)]
pub struct SandboxPayments {
    fail_charges: AtomicBool,
    fail_refunds: AtomicBool,
    ledger: Mutex<Vec<PaymentRecord>>,
}

impl SandboxPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_charges(&self, fail: bool) {
        self.fail_charges.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<PaymentRecord> {
        self.ledger.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn total(&self, member_id: Ulid, kind: PaymentKind) -> Cents {
        self.records()
            .iter()
            .filter(|r| r.member_id == member_id && r.kind == kind)
            .map(|r| r.amount)
            .sum()
    }
}

#[async_trait]
impl PaymentGateway for SandboxPayments {
    async fn charge_or_refund(
        &self,
        member_id: Ulid,
        amount: Cents,
        kind: PaymentKind,
    ) -> Result<String, PaymentError> {
        let failing = match kind {
            PaymentKind::Charge => &self.fail_charges,
            PaymentKind::Refund => &self.fail_refunds,
        };
        if failing.load(Ordering::SeqCst) {
            return Err(PaymentError::Unavailable("sandbox configured to fail".into()));
        }
        let receipt = format!("rcpt_{}", Ulid::new());
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.push(PaymentRecord {
                member_id,
                amount,
                kind,
                receipt: receipt.clone(),
            });
        }
        Ok(receipt)
    }
}
