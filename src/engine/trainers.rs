use serde_json::json;
use ulid::Ulid;

use crate::calendar::local_span;
use crate::collab::{ActivityKind, NotificationKind};
use crate::limits::*;
use crate::model::*;
use crate::pricing::{self, PriceRequest};
use crate::refund::{self, ResourceKind};

use super::conflict::{check_member_free, check_trainer_free, validate_appointment_span};
use super::store::{write_within, Tx};
use super::{clean_text, Engine, EngineError, HeldCharge};

/// Validated, owned form of a booking request.
struct AppointmentRequest {
    member_id: Ulid,
    trainer_id: Ulid,
    date: chrono::NaiveDate,
    span: Span,
    category: TrainerCategory,
    location: String,
    focus: Option<String>,
}

impl Engine {
    pub async fn book_trainer_appointment(
        &self,
        request: BookAppointment,
    ) -> Result<AppointmentBooking, EngineError> {
        let location = request.location.trim().to_string();
        if location.is_empty() {
            return Err(EngineError::InvalidInput("location is required".into()));
        }
        if location.len() > MAX_LOCATION_LEN {
            return Err(EngineError::InvalidInput(format!(
                "location longer than {MAX_LOCATION_LEN} bytes"
            )));
        }
        let focus = clean_text(request.focus, MAX_FOCUS_LEN, "focus")?;
        let span = local_span(self.config.timezone, request.date, request.start, request.end)?;
        validate_appointment_span(&span, self.now())?;

        let request = AppointmentRequest {
            member_id: request.member_id,
            trainer_id: request.trainer_id,
            date: request.date,
            span,
            category: request.category,
            location,
            focus,
        };
        let request = &request;
        let held = HeldCharge::default();
        let held_ref = &held;
        let result = self
            .with_retry("book_trainer_appointment", move || {
                self.book_appointment_once(request, held_ref)
            })
            .await;
        if result.is_err() {
            self.release_charge(held, request.member_id).await;
        }
        result
    }

    async fn book_appointment_once(
        &self,
        request: &AppointmentRequest,
        held: &HeldCharge,
    ) -> Result<AppointmentBooking, EngineError> {
        let member_id = request.member_id;
        let trainer_id = request.trainer_id;
        let span = request.span;
        let tier = self.eligible_member(member_id).await?;
        let timeout = self.config.lock_timeout;

        let shared = self
            .store
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(trainer_id))?;
        let mut trainer = write_within(&shared, trainer_id, timeout).await?;

        if !trainer.trainer.active {
            return Err(EngineError::NotFound(trainer_id));
        }
        if !trainer.trainer.accepting_new_clients && !trainer.clients.contains(&member_id) {
            return Err(EngineError::Unavailable(trainer_id));
        }
        let now = self.now();
        validate_appointment_span(&span, now)?;
        check_trainer_free(&trainer, &span)?;

        // Trainer before member: the fixed lock order for this pair.
        let mut ledgers = self.store.lock_ledgers(&[member_id], timeout).await?;
        if let Some(ledger) = ledgers.get(member_id) {
            check_member_free(ledger, &span)?;
        }

        let mut events = Vec::with_capacity(2);
        let slot_id = match trainer
            .overlapping_slots(&span)
            .find(|s| s.span == span && s.status == SlotStatus::Available)
        {
            Some(slot) => slot.id,
            None => {
                if trainer.slots.len() >= MAX_SLOTS_PER_TRAINER {
                    return Err(EngineError::InvalidInput(
                        "trainer calendar is full".into(),
                    ));
                }
                let slot = TrainerSlot {
                    id: Ulid::new(),
                    trainer_id,
                    date: request.date,
                    span,
                    status: SlotStatus::Available,
                };
                let id = slot.id;
                events.push(Event::TrainerSlotOpened { slot });
                id
            }
        };

        let price = pricing::price(PriceRequest::Trainer {
            tier,
            category: request.category,
            hourly_rate: trainer.trainer.hourly_rate,
            minutes: span.minutes(),
        });
        let receipt = self.charge(held, member_id, price).await?;

        let appointment = TrainerAppointment {
            id: Ulid::new(),
            member_id,
            trainer_id,
            slot_id,
            date: request.date,
            span,
            category: request.category,
            location: request.location.clone(),
            focus: request.focus.clone(),
            price,
            receipt,
            status: AppointmentStatus::Scheduled,
            created_at: now,
            cancelled_at: None,
            cancel_reason: None,
            refund_amount: 0,
            refund_tier: None,
            refund_status: RefundStatus::NotApplicable,
        };
        let appointment_id = appointment.id;
        events.push(Event::AppointmentBooked { appointment });

        let tx = Tx {
            occurrence: None,
            trainer: Some(&mut *trainer),
            ledgers: Some(&mut ledgers),
        };
        self.commit(&events, tx).await?;
        drop(ledgers);
        drop(trainer);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "status" => AppointmentStatus::Scheduled.as_str())
            .increment(1);
        tracing::info!(
            member = %member_id,
            trainer = %trainer_id,
            appointment = %appointment_id,
            minutes = span.minutes(),
            price,
            "trainer appointment booked"
        );
        let payload = json!({
            "appointment_id": appointment_id,
            "trainer_id": trainer_id,
            "slot_id": slot_id,
            "start": span.start,
            "end": span.end,
            "price": price,
        });
        self.notify(member_id, NotificationKind::AppointmentBooked, payload.clone());
        self.record(Some(member_id), ActivityKind::AppointmentBooked, payload);

        Ok(AppointmentBooking {
            appointment_id,
            slot_id,
            price,
        })
    }

    /// Cancel an appointment before it starts and return its slot to the
    /// trainer's calendar.
    pub async fn cancel_trainer_appointment(
        &self,
        member_id: Ulid,
        appointment_id: Ulid,
        reason: Option<String>,
    ) -> Result<AppointmentCancellation, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "reason")?;
        let reason = &reason;
        let (mut result, trainer_id) = self
            .with_retry("cancel_trainer_appointment", move || {
                self.cancel_appointment_once(member_id, appointment_id, reason.clone())
            })
            .await?;

        if result.refund_status == RefundStatus::Pending {
            let pending = PendingRefund {
                member_id,
                target: RefundTarget::Appointment {
                    id: appointment_id,
                    trainer_id,
                },
                amount: result.refund_amount,
            };
            result.refund_status = self.settle_refund(&pending).await;
        }
        Ok(result)
    }

    async fn cancel_appointment_once(
        &self,
        member_id: Ulid,
        appointment_id: Ulid,
        reason: Option<String>,
    ) -> Result<(AppointmentCancellation, Ulid), EngineError> {
        let timeout = self.config.lock_timeout;
        let trainer_id = self
            .store
            .trainer_for_appointment(&appointment_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let shared = self
            .store
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        let mut trainer = write_within(&shared, trainer_id, timeout).await?;

        let appointment = trainer
            .appointments
            .get(&appointment_id)
            .filter(|a| a.member_id == member_id)
            .ok_or(EngineError::NotFound(appointment_id))?;
        match appointment.status {
            AppointmentStatus::Cancelled => {
                return Err(EngineError::AlreadyCancelled(appointment_id));
            }
            AppointmentStatus::Completed => {
                return Err(EngineError::AlreadyCompleted(appointment_id));
            }
            AppointmentStatus::Scheduled => {}
        }
        let (start, price) = (appointment.span.start, appointment.price);

        let now = self.now();
        let until_start = start - now;
        if until_start <= 0 {
            return Err(EngineError::TooLateToCancel);
        }

        let refund = refund::refund(price, until_start, ResourceKind::Trainer);
        let refund_status = if refund.amount > 0 {
            RefundStatus::Pending
        } else {
            RefundStatus::NotApplicable
        };
        let events = [Event::AppointmentCancelled {
            id: appointment_id,
            trainer_id,
            member_id,
            cancelled_at: now,
            reason,
            refund_amount: refund.amount,
            refund_tier: refund.tier,
            refund_status: refund_status.clone(),
        }];

        let mut ledgers = self.store.lock_ledgers(&[member_id], timeout).await?;
        let tx = Tx {
            occurrence: None,
            trainer: Some(&mut *trainer),
            ledgers: Some(&mut ledgers),
        };
        self.commit(&events, tx).await?;
        drop(ledgers);
        drop(trainer);

        tracing::info!(
            member = %member_id,
            trainer = %trainer_id,
            appointment = %appointment_id,
            refund = refund.amount,
            tier = refund.tier.percent(),
            "trainer appointment cancelled"
        );
        let payload = json!({
            "appointment_id": appointment_id,
            "trainer_id": trainer_id,
            "refund_amount": refund.amount,
            "refund_tier": refund.tier,
        });
        self.notify(member_id, NotificationKind::AppointmentCancelled, payload.clone());
        self.record(Some(member_id), ActivityKind::AppointmentCancelled, payload);

        Ok((
            AppointmentCancellation {
                appointment_id,
                refund_amount: refund.amount,
                refund_tier: refund.tier,
                refund_status,
            },
            trainer_id,
        ))
    }
}
