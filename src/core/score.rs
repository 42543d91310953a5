//! Score arithmetic
//!
//! Every score, percentage and weight is a `Decimal`. Rounding is half away
//! from zero ("half-up" for the non-negative values used here) and results
//! are rescaled so they always carry exactly `precision` decimal places.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round `value` to `precision` places, padding the scale to `precision`
pub fn round_score(value: Decimal, precision: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(precision);
    rounded
}

/// Clamp a checker-reported percentage into [0, 100]
pub fn clamp_percentage(percentage: Decimal) -> Decimal {
    percentage.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
}

/// Score of a weighted item that earned `percentage` percent
pub fn weighted(weight: Decimal, percentage: Decimal) -> Decimal {
    weight * percentage / Decimal::ONE_HUNDRED
}

/// Aggregated score of one subtask
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskScore {
    /// Minimum member percentage; `None` when the subtask has no graded members
    pub final_percentage: Option<Decimal>,
    pub score: Decimal,
}

/// Worst-case rule: a subtask earns its weight times its worst member percentage
pub fn subtask_score(weight: Decimal, percentages: &[Decimal], precision: u32) -> SubtaskScore {
    let final_percentage = percentages.iter().copied().min();
    let score = final_percentage
        .map(|p| weighted(weight, p))
        .unwrap_or(Decimal::ZERO);

    SubtaskScore {
        final_percentage,
        score: round_score(score, precision),
    }
}

/// Total submission score from its parts plus the problem's default points
pub fn submission_score(
    parts: impl IntoIterator<Item = Decimal>,
    default_points: Decimal,
    precision: u32,
) -> Decimal {
    let total = parts.into_iter().fold(default_points, |acc, part| acc + part);
    round_score(total, precision)
}
