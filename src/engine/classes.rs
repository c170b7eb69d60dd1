use serde_json::json;
use ulid::Ulid;

use crate::calendar::month_of;
use crate::collab::{ActivityKind, NotificationKind};
use crate::limits::*;
use crate::model::*;
use crate::pricing::{self, PriceRequest};
use crate::refund::{self, Refund, ResourceKind};

use super::store::{write_within, Tx};
use super::{clean_text, waitlist, Engine, EngineError, HeldCharge};

impl Engine {
    /// Reserve a seat, or a waitlist place when the class is full.
    pub async fn book_class(&self, request: BookClass) -> Result<ClassBooking, EngineError> {
        let notes = clean_text(request.notes.clone(), MAX_NOTES_LEN, "notes")?;
        let request = BookClass { notes, ..request };
        let request = &request;
        let held = HeldCharge::default();
        let held_ref = &held;
        let result = self
            .with_retry("book_class", move || self.book_class_once(request, held_ref))
            .await;
        if result.is_err() {
            self.release_charge(held, request.member_id).await;
        }
        result
    }

    async fn book_class_once(
        &self,
        request: &BookClass,
        held: &HeldCharge,
    ) -> Result<ClassBooking, EngineError> {
        let member_id = request.member_id;
        let occurrence_id = request.occurrence_id;
        let tier = self.eligible_member(member_id).await?;
        let timeout = self.config.lock_timeout;

        let shared = self
            .store
            .get_occurrence(&occurrence_id)
            .ok_or(EngineError::NotFound(occurrence_id))?;
        let mut occ = write_within(&shared, occurrence_id, timeout).await?;

        if occ.occurrence.status != OccurrenceStatus::Scheduled {
            return Err(EngineError::NotFound(occurrence_id));
        }
        let now = self.now();
        if occ.occurrence.span.start < now + BOOKING_CUTOFF_MS {
            return Err(EngineError::TooLateToBook);
        }
        if let Some(existing) = occ.active_for_member(member_id) {
            return Err(EngineError::AlreadyReserved(existing.id));
        }
        if occ.reservations.len() >= MAX_RESERVATIONS_PER_OCCURRENCE {
            return Err(EngineError::InvalidInput(
                "occurrence has too many reservations".into(),
            ));
        }

        let mut ledgers = self.store.lock_ledgers(&[member_id], timeout).await?;
        if request.category == ClassCategory::Standard
            && let Some(quota) = tier.monthly_quota()
        {
            let tz = self.config.timezone;
            let month = month_of(tz, occ.occurrence.span.start);
            let used = ledgers
                .get(member_id)
                .map(|l| l.standard_in_month(tz, month))
                .unwrap_or(0);
            if used >= quota {
                return Err(EngineError::LimitExceeded { quota, used });
            }
        }

        let status = if occ.has_free_seat() {
            ReservationStatus::Confirmed
        } else {
            ReservationStatus::Waitlisted
        };
        let price = pricing::price(PriceRequest::Class {
            tier,
            category: request.category,
            intensity: occ.occurrence.intensity,
        });
        let receipt = self.charge(held, member_id, price).await?;

        let reservation = ClassReservation {
            id: Ulid::new(),
            member_id,
            occurrence_id,
            status,
            category: request.category,
            price,
            receipt,
            notes: request.notes.clone(),
            created_at: now,
            cancelled_at: None,
            cancel_reason: None,
            refund_amount: 0,
            refund_status: RefundStatus::NotApplicable,
        };
        let reservation_id = reservation.id;
        let events = [Event::ClassReserved {
            reservation,
            span: occ.occurrence.span,
        }];
        let tx = Tx {
            occurrence: Some(&mut *occ),
            trainer: None,
            ledgers: Some(&mut ledgers),
        };
        self.commit(&events, tx).await?;
        let (confirmed, waiting) = (occ.occurrence.confirmed_count, occ.occurrence.waitlist_count);
        drop(ledgers);
        drop(occ);

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "status" => status.as_str())
            .increment(1);
        tracing::info!(
            member = %member_id,
            occurrence = %occurrence_id,
            reservation = %reservation_id,
            status = status.as_str(),
            confirmed,
            waiting,
            "class booked"
        );
        let payload = json!({
            "reservation_id": reservation_id,
            "occurrence_id": occurrence_id,
            "status": status,
            "price": price,
        });
        let kind = match status {
            ReservationStatus::Waitlisted => NotificationKind::Waitlisted,
            _ => NotificationKind::BookingConfirmed,
        };
        self.notify(member_id, kind, payload.clone());
        self.record(Some(member_id), ActivityKind::ClassBooked, payload);

        Ok(ClassBooking {
            reservation_id,
            status,
            price,
        })
    }

    /// Cancel a reservation and, when it held a seat, promote the head of the
    /// waitlist in the same transaction. The refund is paid after the locks
    /// are released; a failed payout leaves it pending.
    pub async fn cancel_class_reservation(
        &self,
        member_id: Ulid,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<ClassCancellation, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "reason")?;
        let reason = &reason;
        let (mut result, occurrence_id) = self
            .with_retry("cancel_class_reservation", move || {
                self.cancel_class_once(member_id, reservation_id, reason.clone())
            })
            .await?;

        if result.refund_status == RefundStatus::Pending {
            let pending = PendingRefund {
                member_id,
                target: RefundTarget::Reservation {
                    id: reservation_id,
                    occurrence_id,
                },
                amount: result.refund_amount,
            };
            result.refund_status = self.settle_refund(&pending).await;
        }
        Ok(result)
    }

    async fn cancel_class_once(
        &self,
        member_id: Ulid,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<(ClassCancellation, Ulid), EngineError> {
        let timeout = self.config.lock_timeout;
        let occurrence_id = self
            .store
            .occurrence_for_reservation(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let shared = self
            .store
            .get_occurrence(&occurrence_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let mut occ = write_within(&shared, occurrence_id, timeout).await?;

        // Someone else's reservation is indistinguishable from a missing one.
        let reservation = occ
            .reservation(reservation_id)
            .filter(|r| r.member_id == member_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let previous = reservation.status;
        let price = reservation.price;
        if previous == ReservationStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(reservation_id));
        }
        if !previous.can_become(ReservationStatus::Cancelled) {
            return Err(EngineError::IllegalTransition {
                from: previous.as_str(),
                to: ReservationStatus::Cancelled.as_str(),
            });
        }

        let now = self.now();
        let until_start = occ.occurrence.span.start - now;
        if until_start < CANCELLATION_CUTOFF_MS {
            return Err(EngineError::CancellationWindowClosed {
                minutes_to_start: until_start.max(0) / MINUTE_MS,
            });
        }

        // A waitlist place never held a seat, so leaving it costs nothing.
        let refund = match previous {
            ReservationStatus::Waitlisted => Refund {
                tier: RefundTier::Full,
                amount: price.max(0),
            },
            _ => refund::refund(price, until_start, ResourceKind::Class),
        };
        let refund_status = if refund.amount > 0 {
            RefundStatus::Pending
        } else {
            RefundStatus::NotApplicable
        };
        let mut events = vec![Event::ClassReservationCancelled {
            id: reservation_id,
            occurrence_id,
            member_id,
            cancelled_at: now,
            reason,
            refund_amount: refund.amount,
            refund_status: refund_status.clone(),
        }];
        let promotion = match previous {
            ReservationStatus::Confirmed => waitlist::promote_next(&occ),
            _ => None,
        };
        let promoted = match &promotion {
            Some(Event::WaitlistPromoted { id, member_id, .. }) => Some((*id, *member_id)),
            _ => None,
        };
        events.extend(promotion);

        let mut ledgers = self.store.lock_ledgers(&[member_id], timeout).await?;
        let tx = Tx {
            occurrence: Some(&mut *occ),
            trainer: None,
            ledgers: Some(&mut ledgers),
        };
        self.commit(&events, tx).await?;
        drop(ledgers);
        drop(occ);

        tracing::info!(
            member = %member_id,
            reservation = %reservation_id,
            occurrence = %occurrence_id,
            refund = refund.amount,
            promoted = promoted.is_some(),
            "class reservation cancelled"
        );
        let payload = json!({
            "reservation_id": reservation_id,
            "occurrence_id": occurrence_id,
            "refund_amount": refund.amount,
        });
        self.notify(member_id, NotificationKind::ReservationCancelled, payload.clone());
        self.record(Some(member_id), ActivityKind::ClassCancelled, payload);

        if let Some((promoted_id, promoted_member)) = promoted {
            metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
            let payload = json!({
                "reservation_id": promoted_id,
                "occurrence_id": occurrence_id,
            });
            self.notify(promoted_member, NotificationKind::WaitlistPromoted, payload.clone());
            self.record(Some(promoted_member), ActivityKind::WaitlistPromoted, payload);
        }

        Ok((
            ClassCancellation {
                reservation_id,
                refund_amount: refund.amount,
                refund_status,
                promoted_member_id: promoted.map(|(_, m)| m),
                promoted_reservation_id: promoted.map(|(r, _)| r),
            },
            occurrence_id,
        ))
    }
}
