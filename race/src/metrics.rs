//! Race metrics.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `race_started_total` - Races whose countdown elapsed
//! - `race_completed_total{outcome}` - Races that reached done (`finished`, `abandoned`)
//! - `race_recorded_total` - Races committed to the result store
//! - `race_recording_failed_total` - Commits that failed after retries
//! - `race_stale_timer_total{timer}` - Timer or persistence actions ignored as stale
//! - `race_session_fault_total` - Sessions halted by an invariant violation
//!
//! ## Histograms
//! - `race_teams` - Teams per completed race

use metrics::{describe_counter, describe_histogram};

/// Register descriptions of every race metric.
///
/// Call once at startup, after the recorder is installed.
pub fn register_race_metrics() {
    describe_counter!("race_started_total", "Races whose countdown elapsed");
    describe_counter!(
        "race_completed_total",
        "Races in which every team finished or forfeited, by outcome"
    );
    describe_counter!("race_recorded_total", "Races committed to the result store");
    describe_counter!(
        "race_recording_failed_total",
        "Result commits that failed after exhausting retries"
    );
    describe_counter!(
        "race_stale_timer_total",
        "Timer and persistence actions ignored because their token was stale"
    );
    describe_counter!(
        "race_session_fault_total",
        "Sessions halted by an invariant violation"
    );
    describe_histogram!("race_teams", "Number of teams in a completed race");

    tracing::info!("Race metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a race start
pub fn record_race_started() {
    metrics::counter!("race_started_total").increment(1);
}

/// Record a race reaching done
///
/// # Arguments
///
/// * `teams` - Number of teams in the race
/// * `abandoned` - Whether every team forfeited
pub fn record_race_completed(teams: usize, abandoned: bool) {
    let outcome = if abandoned { "abandoned" } else { "finished" };
    metrics::counter!("race_completed_total", "outcome" => outcome).increment(1);
    // Team counts are tiny
    #[allow(clippy::cast_precision_loss)]
    metrics::histogram!("race_teams").record(teams as f64);
}

/// Record a successful commit
pub fn record_race_recorded() {
    metrics::counter!("race_recorded_total").increment(1);
}

/// Record a failed commit
pub fn record_recording_failed() {
    metrics::counter!("race_recording_failed_total").increment(1);
}

/// Record an ignored timer or persistence action
pub fn record_stale_timer(timer: &'static str) {
    metrics::counter!("race_stale_timer_total", "timer" => timer).increment(1);
}

/// Record a session halted by an invariant violation
pub fn record_session_fault() {
    metrics::counter!("race_session_fault_total").increment(1);
}
