//! Pricing policy.
//!
//! Table-driven and pure. Every multiplier is an integer per-mille value so the
//! whole computation stays in integers; the result is rounded half-up to whole
//! cents exactly once.

use crate::model::{Cents, ClassCategory, Intensity, MembershipTier, TrainerCategory};

const PER_MILLE: i128 = 1_000;
const MINUTES_PER_HOUR: i128 = 60;

/// What is being priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceRequest {
    Class {
        tier: MembershipTier,
        category: ClassCategory,
        intensity: Intensity,
    },
    Trainer {
        tier: MembershipTier,
        category: TrainerCategory,
        hourly_rate: Cents,
        minutes: i64,
    },
}

/// Base class price before the intensity adjustment.
pub fn class_base(tier: MembershipTier, category: ClassCategory) -> Cents {
    use ClassCategory::*;
    use MembershipTier::*;
    match (category, tier) {
        (Standard, _) => 0,
        (DropIn, A) => 1_500,
        (DropIn, B) => 1_200,
        (DropIn, C) => 1_000,
        (GuestPass, A) => 2_000,
        (GuestPass, B) => 1_800,
        (GuestPass, C) => 1_500,
    }
}

pub fn intensity_per_mille(intensity: Intensity) -> i128 {
    match intensity {
        Intensity::Low => 900,
        Intensity::Moderate => 1_000,
        Intensity::High => 1_200,
    }
}

pub fn trainer_category_per_mille(category: TrainerCategory) -> i128 {
    match category {
        TrainerCategory::Individual => 1_000,
        TrainerCategory::SmallGroup => 600,
        TrainerCategory::Assessment => 800,
        TrainerCategory::Consultation => 500,
    }
}

pub fn trainer_tier_per_mille(tier: MembershipTier) -> i128 {
    match tier {
        MembershipTier::A => 1_000,
        MembershipTier::B => 950,
        MembershipTier::C => 900,
    }
}

pub fn price(request: PriceRequest) -> Cents {
    match request {
        PriceRequest::Class {
            tier,
            category,
            intensity,
        } => {
            let base = class_base(tier, category) as i128;
            div_round_half_up(base * intensity_per_mille(intensity), PER_MILLE)
        }
        PriceRequest::Trainer {
            tier,
            category,
            hourly_rate,
            minutes,
        } => {
            let numerator = hourly_rate.max(0) as i128
                * minutes.max(0) as i128
                * trainer_category_per_mille(category)
                * trainer_tier_per_mille(tier);
            div_round_half_up(numerator, MINUTES_PER_HOUR * PER_MILLE * PER_MILLE)
        }
    }
}

/// `numerator / denominator` rounded half-up, clamped at zero.
pub(crate) fn div_round_half_up(numerator: i128, denominator: i128) -> Cents {
    if numerator <= 0 || denominator <= 0 {
        return 0;
    }
    let q = (numerator + denominator / 2) / denominator;
    q.min(i64::MAX as i128) as Cents
}
