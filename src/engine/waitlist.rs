use crate::model::*;

use super::store::OccurrenceState;

/// Waitlisted reservations in promotion order: earliest `created_at` first,
/// ties broken by commit order.
pub(crate) fn queue(state: &OccurrenceState) -> Vec<&ClassReservation> {
    let mut waiting: Vec<(usize, &ClassReservation)> = state
        .reservations
        .iter()
        .enumerate()
        .filter(|(_, r)| r.status == ReservationStatus::Waitlisted)
        .collect();
    waiting.sort_by_key(|(pos, r)| (r.created_at, *pos));
    waiting.into_iter().map(|(_, r)| r).collect()
}

pub(crate) fn head(state: &OccurrenceState) -> Option<&ClassReservation> {
    state
        .reservations
        .iter()
        .enumerate()
        .filter(|(_, r)| r.status == ReservationStatus::Waitlisted)
        .min_by_key(|(pos, r)| (r.created_at, *pos))
        .map(|(_, r)| r)
}

/// Promotion for the seat a confirmed cancellation is about to free. Must be
/// built under the same occurrence lock and committed in the same transaction
/// as that cancellation. `None` when nobody is waiting.
pub(crate) fn promote_next(state: &OccurrenceState) -> Option<Event> {
    head(state).map(|r| Event::WaitlistPromoted {
        id: r.id,
        occurrence_id: r.occurrence_id,
        member_id: r.member_id,
    })
}
