//! Refund policy: tiered by lead time at the moment of cancellation.

use crate::model::{Cents, HOUR_MS, Ms, RefundTier};
use crate::pricing::div_round_half_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Class,
    Trainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refund {
    pub tier: RefundTier,
    pub amount: Cents,
}

/// `(minimum lead time, tier)`, longest lead first.
const CLASS_TIERS: &[(Ms, RefundTier)] = &[
    (48 * HOUR_MS, RefundTier::Full),
    (24 * HOUR_MS, RefundTier::ThreeQuarters),
    (12 * HOUR_MS, RefundTier::Half),
    (4 * HOUR_MS, RefundTier::Quarter),
];

const TRAINER_TIERS: &[(Ms, RefundTier)] = &[
    (24 * HOUR_MS, RefundTier::Full),
    (4 * HOUR_MS, RefundTier::Half),
];

pub fn tier_for(until_start: Ms, kind: ResourceKind) -> RefundTier {
    let table = match kind {
        ResourceKind::Class => CLASS_TIERS,
        ResourceKind::Trainer => TRAINER_TIERS,
    };
    table
        .iter()
        .find(|(min, _)| until_start >= *min)
        .map(|(_, tier)| *tier)
        .unwrap_or(RefundTier::Nothing)
}

pub fn refund(amount_paid: Cents, until_start: Ms, kind: ResourceKind) -> Refund {
    let tier = tier_for(until_start, kind);
    let amount = if amount_paid <= 0 {
        0
    } else {
        div_round_half_up(amount_paid as i128 * tier.percent() as i128, 100)
    };
    Refund { tier, amount }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MINUTE_MS;

    #[test]
    fn class_tiers() {
        let r = |h: Ms| refund(2_000, h, ResourceKind::Class).amount;
        assert_eq!(r(50 * HOUR_MS), 2_000);
        assert_eq!(r(48 * HOUR_MS), 2_000);
        assert_eq!(r(48 * HOUR_MS - 1), 1_500);
        assert_eq!(r(24 * HOUR_MS), 1_500);
        assert_eq!(r(12 * HOUR_MS), 1_000);
        assert_eq!(r(4 * HOUR_MS), 500);
        assert_eq!(r(4 * HOUR_MS - MINUTE_MS), 0);
    }

    #[test]
    fn trainer_tiers() {
        let t = |h: Ms| tier_for(h, ResourceKind::Trainer);
        assert_eq!(t(30 * HOUR_MS), RefundTier::Full);
        assert_eq!(t(20 * HOUR_MS), RefundTier::Half);
        assert_eq!(t(4 * HOUR_MS), RefundTier::Half);
        assert_eq!(t(3 * HOUR_MS), RefundTier::Nothing);
        assert_eq!(refund(9_000, 20 * HOUR_MS, ResourceKind::Trainer).amount, 4_500);
    }

    #[test]
    fn nothing_back_when_nothing_paid() {
        let r = refund(0, 100 * HOUR_MS, ResourceKind::Class);
        assert_eq!(r.amount, 0);
        assert_eq!(r.tier, RefundTier::Full);
        assert_eq!(refund(-10, 100 * HOUR_MS, ResourceKind::Trainer).amount, 0);
    }

    #[test]
    fn rounding_is_half_up() {
        // 75% of 1_001 = 750.75
        assert_eq!(refund(1_001, 30 * HOUR_MS, ResourceKind::Class).amount, 751);
        // 25% of 1_002 = 250.5
        assert_eq!(refund(1_002, 5 * HOUR_MS, ResourceKind::Class).amount, 251);
    }

    #[test]
    fn monotonic_in_lead_time() {
        for kind in [ResourceKind::Class, ResourceKind::Trainer] {
            for amount in [0, 1, 999, 1_001, 12_345] {
                let mut previous = 0;
                for minutes in (-120..=(72 * 60)).step_by(7) {
                    let current = refund(amount, minutes * MINUTE_MS, kind).amount;
                    assert!(current >= previous, "{kind:?} {amount} at {minutes}min");
                    previous = current;
                }
            }
        }
    }
}
