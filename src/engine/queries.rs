use ulid::Ulid;

use crate::model::*;

use super::store::read_within;
use super::{waitlist, Engine, EngineError};

impl Engine {
    pub async fn occurrence(&self, id: Ulid) -> Result<ClassOccurrence, EngineError> {
        self.with_retry("occurrence", move || async move {
            let shared = self
                .store
                .get_occurrence(&id)
                .ok_or(EngineError::NotFound(id))?;
            let occ = read_within(&shared, id, self.config.lock_timeout).await?;
            Ok(occ.occurrence.clone())
        })
        .await
    }

    /// Scheduled occurrences starting in `[from, to)`, by start time.
    pub async fn upcoming_occurrences(&self, from: Ms, to: Ms) -> Result<Vec<ClassOccurrence>, EngineError> {
        self.with_retry("upcoming_occurrences", move || async move {
            let mut found = Vec::new();
            for id in self.store.occurrence_ids() {
                let Some(shared) = self.store.get_occurrence(&id) else { continue };
                let occ = read_within(&shared, id, self.config.lock_timeout).await?;
                let o = &occ.occurrence;
                if o.status == OccurrenceStatus::Scheduled && o.span.start >= from && o.span.start < to {
                    found.push(o.clone());
                }
            }
            found.sort_by_key(|o| (o.span.start, o.id));
            Ok(found)
        })
        .await
    }

    pub async fn reservation(&self, id: Ulid) -> Result<ClassReservation, EngineError> {
        self.with_retry("reservation", move || async move {
            let occurrence_id = self
                .store
                .occurrence_for_reservation(&id)
                .ok_or(EngineError::NotFound(id))?;
            let shared = self
                .store
                .get_occurrence(&occurrence_id)
                .ok_or(EngineError::NotFound(id))?;
            let occ = read_within(&shared, occurrence_id, self.config.lock_timeout).await?;
            occ.reservation(id).cloned().ok_or(EngineError::NotFound(id))
        })
        .await
    }

    /// Waitlisted reservations in the order they will be promoted.
    pub async fn waitlist(&self, occurrence_id: Ulid) -> Result<Vec<ClassReservation>, EngineError> {
        self.with_retry("waitlist", move || async move {
            let shared = self
                .store
                .get_occurrence(&occurrence_id)
                .ok_or(EngineError::NotFound(occurrence_id))?;
            let occ = read_within(&shared, occurrence_id, self.config.lock_timeout).await?;
            Ok(waitlist::queue(&occ).into_iter().cloned().collect())
        })
        .await
    }

    /// The member's live (confirmed or waitlisted) reservations, by class start.
    pub async fn member_reservations(&self, member_id: Ulid) -> Result<Vec<ClassReservation>, EngineError> {
        self.with_retry("member_reservations", move || async move {
            let timeout = self.config.lock_timeout;
            // Copy the ids out first: never hold a ledger while waiting on an occurrence.
            let mut held: Vec<(Ms, Ulid, Ulid)> = {
                let ledger = self.store.ledger(member_id);
                let guard = read_within(&ledger, member_id, timeout).await?;
                guard
                    .classes
                    .iter()
                    .map(|(id, c)| (c.span.start, *id, c.occurrence_id))
                    .collect()
            };
            held.sort();

            let mut found = Vec::with_capacity(held.len());
            for (_, reservation_id, occurrence_id) in held {
                let Some(shared) = self.store.get_occurrence(&occurrence_id) else { continue };
                let occ = read_within(&shared, occurrence_id, timeout).await?;
                if let Some(r) = occ.reservation(reservation_id).filter(|r| r.status.is_active()) {
                    found.push(r.clone());
                }
            }
            Ok(found)
        })
        .await
    }

    pub async fn trainer(&self, id: Ulid) -> Result<Trainer, EngineError> {
        self.with_retry("trainer", move || async move {
            let shared = self.store.get_trainer(&id).ok_or(EngineError::NotFound(id))?;
            let state = read_within(&shared, id, self.config.lock_timeout).await?;
            Ok(state.trainer.clone())
        })
        .await
    }

    pub async fn appointment(&self, id: Ulid) -> Result<TrainerAppointment, EngineError> {
        self.with_retry("appointment", move || async move {
            let trainer_id = self
                .store
                .trainer_for_appointment(&id)
                .ok_or(EngineError::NotFound(id))?;
            let shared = self
                .store
                .get_trainer(&trainer_id)
                .ok_or(EngineError::NotFound(id))?;
            let state = read_within(&shared, trainer_id, self.config.lock_timeout).await?;
            state.appointments.get(&id).cloned().ok_or(EngineError::NotFound(id))
        })
        .await
    }

    /// Every slot on the trainer's calendar, by start time.
    pub async fn trainer_slots(&self, trainer_id: Ulid) -> Result<Vec<TrainerSlot>, EngineError> {
        self.with_retry("trainer_slots", move || async move {
            let shared = self
                .store
                .get_trainer(&trainer_id)
                .ok_or(EngineError::NotFound(trainer_id))?;
            let state = read_within(&shared, trainer_id, self.config.lock_timeout).await?;
            Ok(state.slots.clone())
        })
        .await
    }

    /// Refunds committed as pending and not yet paid out. Records that cannot
    /// be read within the lock timeout are skipped this time round.
    pub async fn pending_refunds(&self) -> Vec<PendingRefund> {
        let timeout = self.config.lock_timeout;
        let mut pending = Vec::new();

        for id in self.store.occurrence_ids() {
            let Some(shared) = self.store.get_occurrence(&id) else { continue };
            let Ok(occ) = read_within(&shared, id, timeout).await else {
                tracing::debug!(occurrence = %id, "busy; refunds checked next time");
                continue;
            };
            pending.extend(
                occ.reservations
                    .iter()
                    .filter(|r| r.refund_status == RefundStatus::Pending && r.refund_amount > 0)
                    .map(|r| PendingRefund {
                        member_id: r.member_id,
                        target: RefundTarget::Reservation {
                            id: r.id,
                            occurrence_id: id,
                        },
                        amount: r.refund_amount,
                    }),
            );
        }

        for id in self.store.trainer_ids() {
            let Some(shared) = self.store.get_trainer(&id) else { continue };
            let Ok(state) = read_within(&shared, id, timeout).await else {
                tracing::debug!(trainer = %id, "busy; refunds checked next time");
                continue;
            };
            pending.extend(
                state
                    .appointments
                    .values()
                    .filter(|a| a.refund_status == RefundStatus::Pending && a.refund_amount > 0)
                    .map(|a| PendingRefund {
                        member_id: a.member_id,
                        target: RefundTarget::Appointment {
                            id: a.id,
                            trainer_id: id,
                        },
                        amount: a.refund_amount,
                    }),
            );
        }
        pending
    }
}
