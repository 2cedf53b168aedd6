//! Pairwise Elo-style rating deltas.
//!
//! Everything here is a pure function of scores, outcomes and [`EloConfig`].
//! The session decides which teams are compared and when.

use crate::config::EloConfig;
use chrono::TimeDelta;
use std::cmp::Ordering;

/// A team's standing for rating purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finished with this elapsed time
    Finished(TimeDelta),
    /// Gave up
    Forfeited,
    /// Still on course
    Racing,
}

/// Expected share of `max_gain` for a competitor rated `score` against `opponent`
#[must_use]
pub fn expected(score: f64, opponent: f64, elo: &EloConfig) -> f64 {
    elo.max_gain / (1.0 + elo.base.powf((opponent - score) / elo.dividend))
}

/// Rating change of competitor 1 from its result against competitor 2
///
/// Double forfeits and pairs involving a competitor still racing (as the
/// subject, or against a forfeit) are not rated yet and give zero.
#[must_use]
pub fn delta(score1: f64, outcome1: Outcome, score2: f64, outcome2: Outcome, elo: &EloConfig) -> f64 {
    let actual = match (outcome1, outcome2) {
        (Outcome::Finished(t1), Outcome::Finished(t2)) => match t2.cmp(&t1) {
            Ordering::Greater => elo.max_gain,
            Ordering::Equal => elo.max_gain / 2.0,
            Ordering::Less => 0.0,
        },
        (Outcome::Finished(_), Outcome::Forfeited | Outcome::Racing) => elo.max_gain,
        (Outcome::Forfeited, Outcome::Finished(_)) => 0.0,
        (Outcome::Forfeited, Outcome::Forfeited | Outcome::Racing) | (Outcome::Racing, _) => {
            return 0.0;
        },
    };

    actual - expected(score1, score2, elo)
}

/// Pre-race score of a team from its members' ratings
///
/// A solo team uses its member's rating directly; an empty slice scores as a
/// newcomer.
#[must_use]
pub fn team_score(members: &[f64], elo: &EloConfig) -> f64 {
    match members {
        [solo] => *solo,
        _ => elo
            .aggregation
            .aggregate(members)
            .unwrap_or(elo.starting_score),
    }
}

/// Per-member weight of a pair delta for a team of `own` members facing `opponent` members
///
/// Equal sizes give weight 1. Across the two sides, total points exchanged
/// sum to zero for any sizes.
#[must_use]
pub fn size_weight(own: usize, opponent: usize) -> f64 {
    if own + opponent == 0 {
        return 0.0;
    }
    // Team sizes are tiny; precision loss is irrelevant
    #[allow(clippy::cast_precision_loss)]
    let (own, opponent) = (own as f64, opponent as f64);
    2.0 * opponent / (own + opponent)
}

/// One side of a pairwise comparison
#[derive(Debug, Clone, Copy)]
pub struct Competitor {
    /// Team pre-race score
    pub score: f64,
    /// Current outcome
    pub outcome: Outcome,
    /// Number of members
    pub size: usize,
}

/// Per-member rating change of `subject` against every competitor in `field`
///
/// `field` must not contain the subject itself.
#[must_use]
pub fn member_delta(subject: &Competitor, field: &[Competitor], elo: &EloConfig) -> f64 {
    field
        .iter()
        .map(|opp| {
            delta(subject.score, subject.outcome, opp.score, opp.outcome, elo)
                * size_weight(subject.size, opp.size)
        })
        .sum()
}
