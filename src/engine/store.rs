use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::calendar::{month_of, MonthKey};
use crate::model::*;

use super::EngineError;

pub type Shared<T> = Arc<RwLock<T>>;
pub type SharedOccurrence = Shared<OccurrenceState>;
pub type SharedTrainer = Shared<TrainerState>;
pub type SharedLedger = Shared<MemberLedger>;

// ── Per-resource state ───────────────────────────────────────────

/// An occurrence together with every reservation ever made against it.
/// Counts and rows only change together, under this record's write lock.
#[derive(Debug, Clone)]
pub struct OccurrenceState {
    pub occurrence: ClassOccurrence,
    /// Commit order.
    pub reservations: Vec<ClassReservation>,
}

impl OccurrenceState {
    pub fn new(mut occurrence: ClassOccurrence) -> Self {
        // Counts are derived from the reservations applied afterwards.
        occurrence.confirmed_count = 0;
        occurrence.waitlist_count = 0;
        Self {
            occurrence,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.occurrence.id
    }

    pub fn reservation(&self, id: Ulid) -> Option<&ClassReservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    fn reservation_mut(&mut self, id: Ulid) -> Option<&mut ClassReservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// The member's confirmed or waitlisted reservation, if any.
    pub fn active_for_member(&self, member_id: Ulid) -> Option<&ClassReservation> {
        self.reservations
            .iter()
            .find(|r| r.member_id == member_id && r.status.is_active())
    }

    pub fn has_free_seat(&self) -> bool {
        self.occurrence.confirmed_count < self.occurrence.capacity
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::OccurrenceStatusChanged { id, status } if *id == self.id() => {
                self.occurrence.status = *status;
            }
            Event::ClassReserved { reservation, .. }
                if reservation.occurrence_id == self.id() =>
            {
                match reservation.status {
                    ReservationStatus::Confirmed => self.occurrence.confirmed_count += 1,
                    ReservationStatus::Waitlisted => self.occurrence.waitlist_count += 1,
                    ReservationStatus::Cancelled => {}
                }
                self.reservations.push(reservation.clone());
            }
            Event::ClassReservationCancelled {
                id,
                occurrence_id,
                cancelled_at,
                reason,
                refund_amount,
                refund_status,
                ..
            } if *occurrence_id == self.id() => {
                let Some(r) = self.reservation_mut(*id) else { return };
                let previous = r.status;
                r.status = ReservationStatus::Cancelled;
                r.cancelled_at = Some(*cancelled_at);
                r.cancel_reason = reason.clone();
                r.refund_amount = *refund_amount;
                r.refund_status = refund_status.clone();
                match previous {
                    ReservationStatus::Confirmed => {
                        self.occurrence.confirmed_count =
                            self.occurrence.confirmed_count.saturating_sub(1);
                    }
                    ReservationStatus::Waitlisted => {
                        self.occurrence.waitlist_count =
                            self.occurrence.waitlist_count.saturating_sub(1);
                    }
                    ReservationStatus::Cancelled => {}
                }
            }
            Event::WaitlistPromoted {
                id, occurrence_id, ..
            } if *occurrence_id == self.id() => {
                let Some(r) = self.reservation_mut(*id) else { return };
                if r.status != ReservationStatus::Waitlisted {
                    return;
                }
                r.status = ReservationStatus::Confirmed;
                self.occurrence.confirmed_count += 1;
                self.occurrence.waitlist_count = self.occurrence.waitlist_count.saturating_sub(1);
            }
            Event::RefundIssued {
                target: RefundTarget::Reservation { id, occurrence_id },
                receipt,
            } if *occurrence_id == self.id() => {
                if let Some(r) = self.reservation_mut(*id) {
                    r.refund_status = RefundStatus::Issued {
                        receipt: receipt.clone(),
                    };
                }
            }
            _ => {}
        }
    }
}

/// A trainer, their calendar slots (sorted by start) and appointments.
#[derive(Debug, Clone)]
pub struct TrainerState {
    pub trainer: Trainer,
    pub slots: Vec<TrainerSlot>,
    pub appointments: HashMap<Ulid, TrainerAppointment>,
    /// Members with at least one appointment, ever.
    pub clients: HashSet<Ulid>,
}

impl TrainerState {
    pub fn new(trainer: Trainer) -> Self {
        Self {
            trainer,
            slots: Vec::new(),
            appointments: HashMap::new(),
            clients: HashSet::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.trainer.id
    }

    /// Insert slot maintaining sort order by span.start.
    fn insert_slot(&mut self, slot: TrainerSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    fn set_slot_status(&mut self, slot_id: Ulid, status: SlotStatus) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.status = status;
        }
    }

    /// Slots whose span overlaps the query window.
    pub fn overlapping_slots(&self, query: &Span) -> impl Iterator<Item = &TrainerSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::TrainerUpdated {
                id,
                hourly_rate,
                active,
                accepting_new_clients,
            } if *id == self.id() => {
                self.trainer.hourly_rate = *hourly_rate;
                self.trainer.active = *active;
                self.trainer.accepting_new_clients = *accepting_new_clients;
            }
            Event::TrainerSlotOpened { slot } if slot.trainer_id == self.id() => {
                self.insert_slot(slot.clone());
            }
            Event::AppointmentBooked { appointment } if appointment.trainer_id == self.id() => {
                if appointment.status == AppointmentStatus::Scheduled {
                    self.set_slot_status(appointment.slot_id, SlotStatus::Booked);
                }
                self.clients.insert(appointment.member_id);
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentCancelled {
                id,
                trainer_id,
                cancelled_at,
                reason,
                refund_amount,
                refund_tier,
                refund_status,
                ..
            } if *trainer_id == self.id() => {
                let Some(a) = self.appointments.get_mut(id) else { return };
                a.status = AppointmentStatus::Cancelled;
                a.cancelled_at = Some(*cancelled_at);
                a.cancel_reason = reason.clone();
                a.refund_amount = *refund_amount;
                a.refund_tier = Some(*refund_tier);
                a.refund_status = refund_status.clone();
                let slot_id = a.slot_id;
                self.set_slot_status(slot_id, SlotStatus::Available);
            }
            Event::RefundIssued {
                target: RefundTarget::Appointment { id, trainer_id },
                receipt,
            } if *trainer_id == self.id() => {
                if let Some(a) = self.appointments.get_mut(id) {
                    a.refund_status = RefundStatus::Issued {
                        receipt: receipt.clone(),
                    };
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerClass {
    pub occurrence_id: Ulid,
    pub span: Span,
    pub category: ClassCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerAppointment {
    pub trainer_id: Ulid,
    pub span: Span,
}

/// A member's live (non-cancelled) commitments across all resources.
#[derive(Debug, Clone)]
pub struct MemberLedger {
    pub member_id: Ulid,
    pub classes: HashMap<Ulid, LedgerClass>,
    pub appointments: HashMap<Ulid, LedgerAppointment>,
}

impl MemberLedger {
    pub fn new(member_id: Ulid) -> Self {
        Self {
            member_id,
            classes: HashMap::new(),
            appointments: HashMap::new(),
        }
    }

    /// Live standard-category reservations for classes starting in `month`.
    pub fn standard_in_month(&self, tz: Tz, month: MonthKey) -> u32 {
        self.classes
            .values()
            .filter(|c| c.category == ClassCategory::Standard)
            .filter(|c| month_of(tz, c.span.start) == month)
            .count() as u32
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ClassReserved { reservation, span }
                if reservation.member_id == self.member_id && reservation.status.is_active() =>
            {
                self.classes.insert(
                    reservation.id,
                    LedgerClass {
                        occurrence_id: reservation.occurrence_id,
                        span: *span,
                        category: reservation.category,
                    },
                );
            }
            Event::ClassReservationCancelled { id, member_id, .. } if *member_id == self.member_id => {
                self.classes.remove(id);
            }
            Event::AppointmentBooked { appointment }
                if appointment.member_id == self.member_id
                    && appointment.status == AppointmentStatus::Scheduled =>
            {
                self.appointments.insert(
                    appointment.id,
                    LedgerAppointment {
                        trainer_id: appointment.trainer_id,
                        span: appointment.span,
                    },
                );
            }
            Event::AppointmentCancelled { id, member_id, .. } if *member_id == self.member_id => {
                self.appointments.remove(id);
            }
            _ => {}
        }
    }
}

// ── Lock helpers ─────────────────────────────────────────────────

/// Acquire a write lock, waiting at most `timeout`.
pub async fn write_within<T>(
    lock: &Shared<T>,
    id: Ulid,
    timeout: Duration,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    match tokio::time::timeout(timeout, lock.clone().write_owned()).await {
        Ok(guard) => Ok(guard),
        Err(_) => {
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            Err(EngineError::LockTimeout(id))
        }
    }
}

pub async fn read_within<T>(
    lock: &Shared<T>,
    id: Ulid,
    timeout: Duration,
) -> Result<OwnedRwLockReadGuard<T>, EngineError> {
    match tokio::time::timeout(timeout, lock.clone().read_owned()).await {
        Ok(guard) => Ok(guard),
        Err(_) => {
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            Err(EngineError::LockTimeout(id))
        }
    }
}

/// Write guards over several member ledgers, always taken in ascending id order.
#[derive(Default)]
pub struct LedgerGuards {
    guards: Vec<OwnedRwLockWriteGuard<MemberLedger>>,
}

impl LedgerGuards {
    pub fn get(&self, member_id: Ulid) -> Option<&MemberLedger> {
        self.guards
            .iter()
            .find(|g| g.member_id == member_id)
            .map(|g| &**g)
    }

    fn apply(&mut self, event: &Event) {
        for guard in &mut self.guards {
            guard.apply(event);
        }
    }
}

/// Everything a transaction may touch. Each target ignores events that are
/// not addressed to it.
#[derive(Default)]
pub struct Tx<'a> {
    pub occurrence: Option<&'a mut OccurrenceState>,
    pub trainer: Option<&'a mut TrainerState>,
    pub ledgers: Option<&'a mut LedgerGuards>,
}

// ── The store ────────────────────────────────────────────────────

/// Arena of independently lockable records keyed by id.
pub struct ScheduleStore {
    occurrences: DashMap<Ulid, SharedOccurrence>,
    trainers: DashMap<Ulid, SharedTrainer>,
    ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: reservation id → occurrence id
    reservation_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: appointment id → trainer id
    appointment_index: DashMap<Ulid, Ulid>,
}

impl Default for ScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self {
            occurrences: DashMap::new(),
            trainers: DashMap::new(),
            ledgers: DashMap::new(),
            reservation_index: DashMap::new(),
            appointment_index: DashMap::new(),
        }
    }

    pub fn get_occurrence(&self, id: &Ulid) -> Option<SharedOccurrence> {
        self.occurrences.get(id).map(|e| e.value().clone())
    }

    pub fn occurrence_ids(&self) -> Vec<Ulid> {
        self.occurrences.iter().map(|e| *e.key()).collect()
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn get_trainer(&self, id: &Ulid) -> Option<SharedTrainer> {
        self.trainers.get(id).map(|e| e.value().clone())
    }

    pub fn trainer_ids(&self) -> Vec<Ulid> {
        self.trainers.iter().map(|e| *e.key()).collect()
    }

    /// The member's ledger, created empty on first use.
    pub fn ledger(&self, member_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(member_id)
            .or_insert_with(|| Arc::new(RwLock::new(MemberLedger::new(member_id))))
            .clone()
    }

    pub fn occurrence_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub fn trainer_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index.get(appointment_id).map(|e| *e.value())
    }

    /// Lock the ledgers of `members` for writing, in ascending id order.
    pub async fn lock_ledgers(
        &self,
        members: &[Ulid],
        timeout: Duration,
    ) -> Result<LedgerGuards, EngineError> {
        let mut ids = members.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let ledger = self.ledger(id);
            guards.push(write_within(&ledger, id, timeout).await?);
        }
        Ok(LedgerGuards { guards })
    }

    /// Apply a committed event. The caller holds every lock `tx` refers to.
    pub fn apply(&self, event: &Event, tx: &mut Tx<'_>) {
        match event {
            Event::OccurrenceScheduled { occurrence } => {
                let state = OccurrenceState::new(occurrence.clone());
                self.occurrences
                    .insert(occurrence.id, Arc::new(RwLock::new(state)));
            }
            Event::TrainerRegistered { trainer } => {
                self.trainers
                    .insert(trainer.id, Arc::new(RwLock::new(TrainerState::new(trainer.clone()))));
            }
            Event::ClassReserved { reservation, .. } => {
                self.reservation_index
                    .insert(reservation.id, reservation.occurrence_id);
            }
            Event::AppointmentBooked { appointment } => {
                self.appointment_index
                    .insert(appointment.id, appointment.trainer_id);
            }
            _ => {}
        }
        if let Some(occ) = tx.occurrence.as_deref_mut() {
            occ.apply(event);
        }
        if let Some(trainer) = tx.trainer.as_deref_mut() {
            trainer.apply(event);
        }
        if let Some(ledgers) = tx.ledgers.as_deref_mut() {
            ledgers.apply(event);
        }
    }

    /// Apply an event during WAL replay. The store is not shared yet, so every
    /// `try_write` is uncontended.
    pub fn replay(&self, event: &Event) {
        let occurrence = event_occurrence_id(event).and_then(|id| self.get_occurrence(&id));
        let trainer = event_trainer_id(event).and_then(|id| self.get_trainer(&id));
        let ledger = event_member_id(event).map(|id| self.ledger(id));

        let mut occ_guard = occurrence.as_ref().and_then(|o| o.try_write().ok());
        let mut trainer_guard = trainer.as_ref().and_then(|t| t.try_write().ok());
        let mut ledgers = LedgerGuards {
            guards: ledger.and_then(|l| l.try_write_owned().ok()).into_iter().collect(),
        };

        let mut tx = Tx {
            occurrence: occ_guard.as_deref_mut(),
            trainer: trainer_guard.as_deref_mut(),
            ledgers: Some(&mut ledgers),
        };
        self.apply(event, &mut tx);
    }
}

fn event_occurrence_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::OccurrenceStatusChanged { id, .. } => Some(*id),
        Event::ClassReserved { reservation, .. } => Some(reservation.occurrence_id),
        Event::ClassReservationCancelled { occurrence_id, .. }
        | Event::WaitlistPromoted { occurrence_id, .. } => Some(*occurrence_id),
        Event::RefundIssued {
            target: RefundTarget::Reservation { occurrence_id, .. },
            ..
        } => Some(*occurrence_id),
        _ => None,
    }
}

fn event_trainer_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::TrainerUpdated { id, .. } => Some(*id),
        Event::TrainerSlotOpened { slot } => Some(slot.trainer_id),
        Event::AppointmentBooked { appointment } => Some(appointment.trainer_id),
        Event::AppointmentCancelled { trainer_id, .. } => Some(*trainer_id),
        Event::RefundIssued {
            target: RefundTarget::Appointment { trainer_id, .. },
            ..
        } => Some(*trainer_id),
        _ => None,
    }
}

fn event_member_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ClassReserved { reservation, .. } => Some(reservation.member_id),
        Event::ClassReservationCancelled { member_id, .. }
        | Event::AppointmentCancelled { member_id, .. } => Some(*member_id),
        Event::AppointmentBooked { appointment } => Some(appointment.member_id),
        _ => None,
    }
}
