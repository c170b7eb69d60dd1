use crate::limits::*;
use crate::model::*;

use super::store::{MemberLedger, TrainerState};
use super::EngineError;

/// Duration bounds and "strictly in the future" for a trainer appointment.
pub(crate) fn validate_appointment_span(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("start must be before end".into()));
    }
    let duration = span.duration_ms();
    if duration < MIN_APPOINTMENT_MS {
        return Err(EngineError::InvalidInput(format!(
            "appointment of {} minutes is shorter than {} minutes",
            duration / MINUTE_MS,
            MIN_APPOINTMENT_MS / MINUTE_MS
        )));
    }
    if duration > MAX_APPOINTMENT_MS {
        return Err(EngineError::InvalidInput(format!(
            "appointment of {} minutes is longer than {} minutes",
            duration / MINUTE_MS,
            MAX_APPOINTMENT_MS / MINUTE_MS
        )));
    }
    if span.start <= now {
        return Err(EngineError::InvalidInput(
            "appointment must start in the future".into(),
        ));
    }
    Ok(())
}

/// The member has nothing else live during `span`: no confirmed or waitlisted
/// class, no scheduled appointment.
pub(crate) fn check_member_free(ledger: &MemberLedger, span: &Span) -> Result<(), EngineError> {
    if let Some((id, _)) = ledger.classes.iter().find(|(_, c)| c.span.overlaps(span)) {
        return Err(EngineError::SchedulingConflict(*id));
    }
    if let Some((id, _)) = ledger
        .appointments
        .iter()
        .find(|(_, a)| a.span.overlaps(span))
    {
        return Err(EngineError::SchedulingConflict(*id));
    }
    Ok(())
}

/// No booked slot on the trainer's calendar overlaps `span`.
pub(crate) fn check_trainer_free(trainer: &TrainerState, span: &Span) -> Result<(), EngineError> {
    match trainer
        .overlapping_slots(span)
        .find(|s| s.status == SlotStatus::Booked)
    {
        Some(slot) => Err(EngineError::SchedulingConflict(slot.id)),
        None => Ok(()),
    }
}

/// A new calendar window must not overlap any existing one, booked or not.
pub(crate) fn check_slot_disjoint(trainer: &TrainerState, span: &Span) -> Result<(), EngineError> {
    match trainer.overlapping_slots(span).next() {
        Some(slot) => Err(EngineError::SchedulingConflict(slot.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::{LedgerAppointment, LedgerClass};
    use chrono::NaiveDate;
    use ulid::Ulid;

    const NOW: Ms = 1_000 * HOUR_MS;

    #[test]
    fn appointment_bounds() {
        let at = |start_min: i64, len_min: i64| {
            let start = NOW + start_min * MINUTE_MS;
            Span {
                start,
                end: start + len_min * MINUTE_MS,
            }
        };
        assert!(validate_appointment_span(&at(60, 30), NOW).is_ok());
        assert!(validate_appointment_span(&at(60, 120), NOW).is_ok());
        assert!(matches!(
            validate_appointment_span(&at(60, 15), NOW),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_appointment_span(&at(60, 121), NOW),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_appointment_span(&at(0, 60), NOW),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_appointment_span(&Span { start: NOW + HOUR_MS, end: NOW }, NOW),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn member_conflicts_with_classes_and_appointments() {
        let mut ledger = MemberLedger::new(Ulid::new());
        let class_id = Ulid::new();
        ledger.classes.insert(
            class_id,
            LedgerClass {
                occurrence_id: Ulid::new(),
                span: Span::new(10 * HOUR_MS, 11 * HOUR_MS),
                category: ClassCategory::Standard,
            },
        );
        let appt_id = Ulid::new();
        ledger.appointments.insert(
            appt_id,
            LedgerAppointment {
                trainer_id: Ulid::new(),
                span: Span::new(14 * HOUR_MS, 15 * HOUR_MS),
            },
        );

        assert_eq!(
            check_member_free(&ledger, &Span::new(10 * HOUR_MS + 30 * MINUTE_MS, 12 * HOUR_MS)),
            Err(EngineError::SchedulingConflict(class_id))
        );
        assert_eq!(
            check_member_free(&ledger, &Span::new(13 * HOUR_MS, 14 * HOUR_MS + 1)),
            Err(EngineError::SchedulingConflict(appt_id))
        );
        // Back-to-back is fine.
        assert!(check_member_free(&ledger, &Span::new(11 * HOUR_MS, 12 * HOUR_MS)).is_ok());
    }

    #[test]
    fn only_booked_slots_block_the_trainer() {
        let trainer_id = Ulid::new();
        let mut trainer = TrainerState::new(Trainer {
            id: trainer_id,
            name: "Marek".into(),
            hourly_rate: 7_000,
            active: true,
            accepting_new_clients: true,
        });
        let date = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        let open = Ulid::new();
        let booked = Ulid::new();
        for (id, s, e, status) in [
            (open, 9, 10, SlotStatus::Available),
            (booked, 11, 12, SlotStatus::Booked),
        ] {
            trainer.apply(&Event::TrainerSlotOpened {
                slot: TrainerSlot {
                    id,
                    trainer_id,
                    date,
                    span: Span::new(s * HOUR_MS, e * HOUR_MS),
                    status,
                },
            });
        }

        assert!(check_trainer_free(&trainer, &Span::new(9 * HOUR_MS, 10 * HOUR_MS)).is_ok());
        assert_eq!(
            check_trainer_free(&trainer, &Span::new(10 * HOUR_MS, 11 * HOUR_MS + 1)),
            Err(EngineError::SchedulingConflict(booked))
        );
        assert_eq!(
            check_slot_disjoint(&trainer, &Span::new(9 * HOUR_MS, 9 * HOUR_MS + 1)),
            Err(EngineError::SchedulingConflict(open))
        );
    }
}
