use chrono::{NaiveDate, NaiveTime};
use serde_json::json;
use ulid::Ulid;

use crate::calendar::local_span;
use crate::collab::{ActivityKind, NotificationKind};
use crate::limits::*;
use crate::model::*;

use super::conflict::check_slot_disjoint;
use super::store::{read_within, write_within, Tx};
use super::{clean_text, Engine, EngineError};

/// `(reservation id, member id, refund owed)` for a reservation the gym released.
type ClosedReservation = (Ulid, Ulid, Cents);

const WAITLIST_EXPIRED_REASON: &str = "class held without a free seat";

/// Partial update for a trainer; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct TrainerUpdate {
    pub hourly_rate: Option<Cents>,
    pub active: Option<bool>,
    pub accepting_new_clients: Option<bool>,
}

fn required_text(value: &str, max: usize, field: &str) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} is required")));
    }
    if value.len() > max {
        return Err(EngineError::InvalidInput(format!(
            "{field} longer than {max} bytes"
        )));
    }
    Ok(value.to_string())
}

fn check_rate(rate: Cents) -> Result<(), EngineError> {
    if !(0..=MAX_HOURLY_RATE).contains(&rate) {
        return Err(EngineError::InvalidInput(format!(
            "hourly rate must be between 0 and {MAX_HOURLY_RATE}"
        )));
    }
    Ok(())
}

impl Engine {
    // ── Class schedule ───────────────────────────────────────

    pub async fn schedule_occurrence(
        &self,
        request: ScheduleOccurrence,
    ) -> Result<ClassOccurrence, EngineError> {
        let room = required_text(&request.room, MAX_NAME_LEN, "room")?;
        if request.capacity == 0 || request.capacity > MAX_CAPACITY {
            return Err(EngineError::InvalidInput(format!(
                "capacity must be between 1 and {MAX_CAPACITY}"
            )));
        }
        let span = local_span(self.config.timezone, request.date, request.start, request.end)?;
        let occurrence = ClassOccurrence {
            id: Ulid::new(),
            template_id: request.template_id,
            date: request.date,
            span,
            room,
            capacity: request.capacity,
            intensity: request.intensity,
            confirmed_count: 0,
            waitlist_count: 0,
            status: OccurrenceStatus::Scheduled,
        };
        let events = [Event::OccurrenceScheduled {
            occurrence: occurrence.clone(),
        }];
        let events = &events;
        self.with_retry("schedule_occurrence", move || self.commit(events, Tx::default()))
            .await?;

        tracing::info!(occurrence = %occurrence.id, date = %occurrence.date, capacity = occurrence.capacity, "occurrence scheduled");
        self.record(
            None,
            ActivityKind::OccurrenceScheduled,
            json!({ "occurrence_id": occurrence.id, "date": occurrence.date, "room": occurrence.room }),
        );
        Ok(occurrence)
    }

    /// Gym-initiated cancellation: every live reservation is cancelled with a
    /// full refund, regardless of cutoffs. Returns the cancelled reservation ids.
    pub async fn cancel_occurrence(
        &self,
        occurrence_id: Ulid,
        reason: Option<String>,
    ) -> Result<Vec<Ulid>, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "reason")?;
        let reason = &reason;
        let closed = self
            .with_retry("cancel_occurrence", move || {
                self.close_occurrence_once(occurrence_id, OccurrenceStatus::Cancelled, reason.clone())
            })
            .await?;

        tracing::info!(occurrence = %occurrence_id, reservations = closed.len(), "occurrence cancelled");
        self.record(
            None,
            ActivityKind::OccurrenceCancelled,
            json!({ "occurrence_id": occurrence_id, "reservations": closed.len() }),
        );
        self.settle_closed(occurrence_id, &closed, NotificationKind::OccurrenceCancelled)
            .await;
        Ok(closed.into_iter().map(|(id, _, _)| id).collect())
    }

    /// Mark a scheduled occurrence as held. Members still on the waitlist never
    /// got a seat: their reservations are cancelled with a full refund in the
    /// same transaction.
    pub async fn complete_occurrence(&self, occurrence_id: Ulid) -> Result<(), EngineError> {
        let closed = self
            .with_retry("complete_occurrence", move || {
                self.close_occurrence_once(
                    occurrence_id,
                    OccurrenceStatus::Completed,
                    Some(WAITLIST_EXPIRED_REASON.to_string()),
                )
            })
            .await?;

        if !closed.is_empty() {
            tracing::info!(occurrence = %occurrence_id, waitlisted = closed.len(), "waitlist closed with the class");
        }
        self.record(
            None,
            ActivityKind::OccurrenceCompleted,
            json!({ "occurrence_id": occurrence_id, "waitlist_refunded": closed.len() }),
        );
        self.settle_closed(occurrence_id, &closed, NotificationKind::WaitlistExpired)
            .await;
        Ok(())
    }

    /// Move an occurrence to `to` and cancel the reservations that status
    /// releases, each with a full refund. Cancelling releases every live
    /// reservation; completing releases only the waitlist.
    async fn close_occurrence_once(
        &self,
        occurrence_id: Ulid,
        to: OccurrenceStatus,
        reason: Option<String>,
    ) -> Result<Vec<ClosedReservation>, EngineError> {
        let timeout = self.config.lock_timeout;
        let shared = self
            .store
            .get_occurrence(&occurrence_id)
            .ok_or(EngineError::NotFound(occurrence_id))?;
        let mut occ = write_within(&shared, occurrence_id, timeout).await?;

        let from = occ.occurrence.status;
        if !from.can_become(to) {
            return Err(EngineError::IllegalTransition {
                from: from.as_str(),
                to: to.as_str(),
            });
        }

        let now = self.now();
        let closed: Vec<ClosedReservation> = occ
            .reservations
            .iter()
            .filter(|r| match to {
                OccurrenceStatus::Completed => r.status == ReservationStatus::Waitlisted,
                _ => r.status.is_active(),
            })
            .map(|r| (r.id, r.member_id, r.price.max(0)))
            .collect();
        let mut events: Vec<Event> = closed
            .iter()
            .map(|&(id, member_id, amount)| Event::ClassReservationCancelled {
                id,
                occurrence_id,
                member_id,
                cancelled_at: now,
                reason: reason.clone(),
                refund_amount: amount,
                refund_status: if amount > 0 {
                    RefundStatus::Pending
                } else {
                    RefundStatus::NotApplicable
                },
            })
            .collect();
        events.push(Event::OccurrenceStatusChanged {
            id: occurrence_id,
            status: to,
        });

        let members: Vec<Ulid> = closed.iter().map(|(_, m, _)| *m).collect();
        let mut ledgers = self.store.lock_ledgers(&members, timeout).await?;
        let tx = Tx {
            occurrence: Some(&mut *occ),
            trainer: None,
            ledgers: Some(&mut ledgers),
        };
        self.commit(&events, tx).await?;
        Ok(closed)
    }

    /// Tell each released member and pay back what they are owed.
    async fn settle_closed(
        &self,
        occurrence_id: Ulid,
        closed: &[ClosedReservation],
        kind: NotificationKind,
    ) {
        for &(reservation_id, member_id, amount) in closed {
            self.notify(
                member_id,
                kind,
                json!({ "occurrence_id": occurrence_id, "reservation_id": reservation_id, "refund_amount": amount }),
            );
            if amount > 0 {
                let pending = PendingRefund {
                    member_id,
                    target: RefundTarget::Reservation {
                        id: reservation_id,
                        occurrence_id,
                    },
                    amount,
                };
                self.settle_refund(&pending).await;
            }
        }
    }

    /// Complete every scheduled occurrence that has ended. Returns how many
    /// were completed.
    pub async fn complete_elapsed(&self) -> usize {
        let now = self.now();
        let timeout = self.config.lock_timeout;
        let mut completed = 0;
        for id in self.store.occurrence_ids() {
            let Some(shared) = self.store.get_occurrence(&id) else { continue };
            let due = match read_within(&shared, id, timeout).await {
                Ok(occ) => {
                    occ.occurrence.status == OccurrenceStatus::Scheduled
                        && occ.occurrence.span.end <= now
                }
                Err(_) => false,
            };
            if !due {
                continue;
            }
            match self.complete_occurrence(id).await {
                Ok(()) => completed += 1,
                Err(e) => tracing::debug!(occurrence = %id, "skipping completion: {e}"),
            }
        }
        completed
    }

    // ── Trainers ─────────────────────────────────────────────

    pub async fn register_trainer(&self, request: NewTrainer) -> Result<Trainer, EngineError> {
        let name = required_text(&request.name, MAX_NAME_LEN, "name")?;
        check_rate(request.hourly_rate)?;
        let trainer = Trainer {
            id: Ulid::new(),
            name,
            hourly_rate: request.hourly_rate,
            active: request.active,
            accepting_new_clients: request.accepting_new_clients,
        };
        let events = [Event::TrainerRegistered {
            trainer: trainer.clone(),
        }];
        let events = &events;
        self.with_retry("register_trainer", move || self.commit(events, Tx::default()))
            .await?;

        tracing::info!(trainer = %trainer.id, name = %trainer.name, "trainer registered");
        self.record(
            None,
            ActivityKind::TrainerRegistered,
            json!({ "trainer_id": trainer.id, "name": trainer.name }),
        );
        Ok(trainer)
    }

    pub async fn update_trainer(
        &self,
        trainer_id: Ulid,
        update: TrainerUpdate,
    ) -> Result<Trainer, EngineError> {
        if let Some(rate) = update.hourly_rate {
            check_rate(rate)?;
        }
        let update = &update;
        let trainer = self
            .with_retry("update_trainer", move || async move {
                let shared = self
                    .store
                    .get_trainer(&trainer_id)
                    .ok_or(EngineError::NotFound(trainer_id))?;
                let mut state =
                    write_within(&shared, trainer_id, self.config.lock_timeout).await?;
                let current = &state.trainer;
                let events = [Event::TrainerUpdated {
                    id: trainer_id,
                    hourly_rate: update.hourly_rate.unwrap_or(current.hourly_rate),
                    active: update.active.unwrap_or(current.active),
                    accepting_new_clients: update
                        .accepting_new_clients
                        .unwrap_or(current.accepting_new_clients),
                }];
                let tx = Tx {
                    trainer: Some(&mut *state),
                    ..Tx::default()
                };
                self.commit(&events, tx).await?;
                Ok(state.trainer.clone())
            })
            .await?;

        tracing::info!(trainer = %trainer_id, active = trainer.active, accepting = trainer.accepting_new_clients, "trainer updated");
        self.record(
            None,
            ActivityKind::TrainerUpdated,
            json!({
                "trainer_id": trainer_id,
                "hourly_rate": trainer.hourly_rate,
                "active": trainer.active,
                "accepting_new_clients": trainer.accepting_new_clients,
            }),
        );
        Ok(trainer)
    }

    /// Publish a bookable window on a trainer's calendar.
    pub async fn open_trainer_slot(
        &self,
        trainer_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<TrainerSlot, EngineError> {
        let span = local_span(self.config.timezone, date, start, end)?;
        let slot = self
            .with_retry("open_trainer_slot", move || async move {
                let shared = self
                    .store
                    .get_trainer(&trainer_id)
                    .ok_or(EngineError::NotFound(trainer_id))?;
                let mut state =
                    write_within(&shared, trainer_id, self.config.lock_timeout).await?;
                check_slot_disjoint(&state, &span)?;
                if state.slots.len() >= MAX_SLOTS_PER_TRAINER {
                    return Err(EngineError::InvalidInput("trainer calendar is full".into()));
                }
                let slot = TrainerSlot {
                    id: Ulid::new(),
                    trainer_id,
                    date,
                    span,
                    status: SlotStatus::Available,
                };
                let events = [Event::TrainerSlotOpened { slot: slot.clone() }];
                let tx = Tx {
                    trainer: Some(&mut *state),
                    ..Tx::default()
                };
                self.commit(&events, tx).await?;
                Ok(slot)
            })
            .await?;

        self.record(
            None,
            ActivityKind::TrainerSlotOpened,
            json!({ "trainer_id": trainer_id, "slot_id": slot.id, "start": span.start, "end": span.end }),
        );
        Ok(slot)
    }

    // ── Refunds ──────────────────────────────────────────────

    /// Try every pending refund once. Returns how many were paid out.
    pub async fn retry_pending_refunds(&self) -> usize {
        let mut issued = 0;
        for pending in self.pending_refunds().await {
            if let RefundStatus::Issued { .. } = self.settle_refund(&pending).await {
                issued += 1;
            }
        }
        issued
    }
}
