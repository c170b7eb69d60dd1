use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Cents = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

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

    pub fn minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Classification enums ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipTier {
    A,
    B,
    C,
}

impl MembershipTier {
    /// Standard-category reservations allowed per calendar month. `None` is unlimited.
    pub fn monthly_quota(self) -> Option<u32> {
        match self {
            MembershipTier::A => Some(8),
            MembershipTier::B => Some(20),
            MembershipTier::C => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassCategory {
    Standard,
    DropIn,
    GuestPass,
}

/// Per-class-type price adjustment carried by each occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerCategory {
    Individual,
    SmallGroup,
    Assessment,
    Consultation,
}

// ── Tagged states ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl OccurrenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OccurrenceStatus::Scheduled => "scheduled",
            OccurrenceStatus::Completed => "completed",
            OccurrenceStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_become(self, next: OccurrenceStatus) -> bool {
        matches!(
            (self, next),
            (OccurrenceStatus::Scheduled, OccurrenceStatus::Completed)
                | (OccurrenceStatus::Scheduled, OccurrenceStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Confirmed,
    Waitlisted,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Waitlisted => "waitlisted",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Cancellation from either live state; promotion only from the waitlist.
    pub fn can_become(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Confirmed, ReservationStatus::Cancelled)
                | (ReservationStatus::Waitlisted, ReservationStatus::Cancelled)
                | (ReservationStatus::Waitlisted, ReservationStatus::Confirmed)
        )
    }

    pub fn is_active(self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_become(self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (AppointmentStatus::Scheduled, AppointmentStatus::Cancelled)
                | (AppointmentStatus::Scheduled, AppointmentStatus::Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Booked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundTier {
    Full,
    ThreeQuarters,
    Half,
    Quarter,
    Nothing,
}

impl RefundTier {
    pub fn percent(self) -> i64 {
        match self {
            RefundTier::Full => 100,
            RefundTier::ThreeQuarters => 75,
            RefundTier::Half => 50,
            RefundTier::Quarter => 25,
            RefundTier::Nothing => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Nothing was paid, or the tier yields zero.
    NotApplicable,
    /// Committed but not yet confirmed by the payment collaborator.
    Pending,
    Issued { receipt: String },
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOccurrence {
    pub id: Ulid,
    pub template_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub room: String,
    pub capacity: u32,
    pub intensity: Intensity,
    pub confirmed_count: u32,
    pub waitlist_count: u32,
    pub status: OccurrenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassReservation {
    pub id: Ulid,
    pub member_id: Ulid,
    pub occurrence_id: Ulid,
    pub status: ReservationStatus,
    pub category: ClassCategory,
    pub price: Cents,
    /// Receipt of the booking charge, if one was taken.
    pub receipt: Option<String>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancel_reason: Option<String>,
    pub refund_amount: Cents,
    pub refund_status: RefundStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trainer {
    pub id: Ulid,
    pub name: String,
    pub hourly_rate: Cents,
    pub active: bool,
    pub accepting_new_clients: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerSlot {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerAppointment {
    pub id: Ulid,
    pub member_id: Ulid,
    pub trainer_id: Ulid,
    pub slot_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub category: TrainerCategory,
    pub location: String,
    pub focus: Option<String>,
    pub price: Cents,
    pub receipt: Option<String>,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancel_reason: Option<String>,
    pub refund_amount: Cents,
    pub refund_tier: Option<RefundTier>,
    pub refund_status: RefundStatus,
}

/// Which record a refund settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundTarget {
    Reservation { id: Ulid, occurrence_id: Ulid },
    Appointment { id: Ulid, trainer_id: Ulid },
}

impl RefundTarget {
    /// Id of the reservation or appointment being refunded.
    pub fn record_id(&self) -> Ulid {
        match self {
            RefundTarget::Reservation { id, .. } | RefundTarget::Appointment { id, .. } => *id,
        }
    }
}

/// A committed refund that the payment collaborator has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRefund {
    pub member_id: Ulid,
    pub target: RefundTarget,
    pub amount: Cents,
}

/// The event types — flat, no nesting. A committed transaction is a `Vec<Event>`
/// written as one WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OccurrenceScheduled {
        occurrence: ClassOccurrence,
    },
    OccurrenceStatusChanged {
        id: Ulid,
        status: OccurrenceStatus,
    },
    ClassReserved {
        reservation: ClassReservation,
        span: Span,
    },
    ClassReservationCancelled {
        id: Ulid,
        occurrence_id: Ulid,
        member_id: Ulid,
        cancelled_at: Ms,
        reason: Option<String>,
        refund_amount: Cents,
        refund_status: RefundStatus,
    },
    WaitlistPromoted {
        id: Ulid,
        occurrence_id: Ulid,
        member_id: Ulid,
    },
    TrainerRegistered {
        trainer: Trainer,
    },
    TrainerUpdated {
        id: Ulid,
        hourly_rate: Cents,
        active: bool,
        accepting_new_clients: bool,
    },
    TrainerSlotOpened {
        slot: TrainerSlot,
    },
    AppointmentBooked {
        appointment: TrainerAppointment,
    },
    AppointmentCancelled {
        id: Ulid,
        trainer_id: Ulid,
        member_id: Ulid,
        cancelled_at: Ms,
        reason: Option<String>,
        refund_amount: Cents,
        refund_tier: RefundTier,
        refund_status: RefundStatus,
    },
    RefundIssued {
        target: RefundTarget,
        receipt: String,
    },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookClass {
    pub member_id: Ulid,
    pub occurrence_id: Ulid,
    pub category: ClassCategory,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookAppointment {
    pub member_id: Ulid,
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub category: TrainerCategory,
    pub location: String,
    pub focus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOccurrence {
    pub template_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub room: String,
    pub capacity: u32,
    pub intensity: Intensity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrainer {
    pub name: String,
    pub hourly_rate: Cents,
    pub active: bool,
    pub accepting_new_clients: bool,
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassBooking {
    pub reservation_id: Ulid,
    pub status: ReservationStatus,
    pub price: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassCancellation {
    pub reservation_id: Ulid,
    pub refund_amount: Cents,
    pub refund_status: RefundStatus,
    pub promoted_member_id: Option<Ulid>,
    pub promoted_reservation_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppointmentBooking {
    pub appointment_id: Ulid,
    pub slot_id: Ulid,
    pub price: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppointmentCancellation {
    pub appointment_id: Ulid,
    pub refund_amount: Cents,
    pub refund_tier: RefundTier,
    pub refund_status: RefundStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(Span::new(0, 90 * MINUTE_MS).minutes(), 90);
    }

    #[test]
    fn reservation_transitions() {
        use ReservationStatus::*;
        assert!(Waitlisted.can_become(Confirmed));
        assert!(Confirmed.can_become(Cancelled));
        assert!(Waitlisted.can_become(Cancelled));
        assert!(!Confirmed.can_become(Waitlisted));
        assert!(!Cancelled.can_become(Confirmed));
        assert!(!Cancelled.can_become(Cancelled));
    }

    #[test]
    fn appointment_and_occurrence_transitions() {
        assert!(AppointmentStatus::Scheduled.can_become(AppointmentStatus::Cancelled));
        assert!(!AppointmentStatus::Completed.can_become(AppointmentStatus::Cancelled));
        assert!(!AppointmentStatus::Cancelled.can_become(AppointmentStatus::Scheduled));
        assert!(OccurrenceStatus::Scheduled.can_become(OccurrenceStatus::Completed));
        assert!(!OccurrenceStatus::Cancelled.can_become(OccurrenceStatus::Scheduled));
    }

    #[test]
    fn quotas_by_tier() {
        assert_eq!(MembershipTier::A.monthly_quota(), Some(8));
        assert_eq!(MembershipTier::B.monthly_quota(), Some(20));
        assert_eq!(MembershipTier::C.monthly_quota(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::WaitlistPromoted {
            id: Ulid::new(),
            occurrence_id: Ulid::new(),
            member_id: Ulid::new(),
        };
        let bytes = bincode::serialize(&vec![event.clone()]).unwrap();
        let decoded: Vec<Event> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, vec![event]);
    }
}
