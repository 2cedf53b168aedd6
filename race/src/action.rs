//! Actions reduced by a race session.

use crate::results::CommitReceipt;
use crate::types::{EntrantId, LevelId};
use chrono::{DateTime, Utc};

/// Everything a session reacts to
///
/// Commands come from the command layer through the registry. Timer and
/// persistence actions are produced by the session's own effects and carry
/// the token they were armed with; a token that no longer matches the
/// session makes the action a no-op.
#[derive(Clone, Debug, PartialEq)]
pub enum RaceAction {
    // ========== Commands ==========
    /// Enter the race as a new solo team
    Join {
        /// Entrant
        entrant: EntrantId,
        /// Display name
        name: String,
        /// Stored rating in the session's category, `None` for newcomers
        rating: Option<f64>,
    },

    /// Leave before the race starts
    Leave {
        /// Entrant
        entrant: EntrantId,
    },

    /// Mark ready or not ready
    SetReady {
        /// Entrant
        entrant: EntrantId,
        /// New readiness
        ready: bool,
    },

    /// Report that the entrant's team finished
    ReportFinish {
        /// Reporting entrant
        entrant: EntrantId,
        /// Wall-clock time the report was stamped
        at: DateTime<Utc>,
    },

    /// Report that the entrant's team gives up
    ReportForfeit {
        /// Reporting entrant
        entrant: EntrantId,
    },

    /// Withdraw the team's finish
    UndoFinish {
        /// Reporting entrant
        entrant: EntrantId,
    },

    /// Withdraw the team's forfeit
    UndoForfeit {
        /// Reporting entrant
        entrant: EntrantId,
    },

    /// Merge the partner's team into the entrant's team
    TeamWith {
        /// Entrant whose team absorbs the other
        entrant: EntrantId,
        /// Entrant whose team is absorbed
        partner: EntrantId,
    },

    /// Leave the current co-op team for a new solo team
    Unteam {
        /// Entrant
        entrant: EntrantId,
    },

    /// Shuffle everyone into teams of `group_size`
    RandomizeTeams {
        /// Members per team; the last team may be smaller
        group_size: usize,
    },

    /// Name the entrant's co-op team
    RenameTeam {
        /// Any member of the team
        entrant: EntrantId,
        /// New name
        name: String,
    },

    /// Choose the level of the next series race
    SetLevel {
        /// Choosing entrant
        entrant: EntrantId,
        /// Level
        level: LevelId,
    },

    /// Record a done race now instead of waiting for the banking period
    Finalize,

    /// Administrative reset to an empty session
    AdminClear {
        /// Record a done race before clearing
        persist_first: bool,
    },

    // ========== Timer and persistence feedback ==========
    /// A countdown mark was reached
    CountdownTick {
        /// Countdown token
        epoch: u64,
        /// Seconds left
        remaining: u64,
    },

    /// The countdown finished
    CountdownElapsed {
        /// Countdown token
        epoch: u64,
    },

    /// The banking period finished
    CompletionElapsed {
        /// Completion token
        epoch: u64,
    },

    /// Results were committed
    RaceRecorded {
        /// Recording token
        epoch: u64,
        /// Persisted ids
        receipt: CommitReceipt,
    },

    /// Results could not be committed
    RecordingFailed {
        /// Recording token
        epoch: u64,
        /// Error text
        error: String,
    },
}
