//! Durable race results.
//!
//! A finished race is handed to a [`ResultStore`] as one [`RaceRecord`] and
//! written by a single [`ResultStore::commit`] call: the race row, new teams
//! and their members, one result per team and updated stats for every
//! entrant land together or not at all.

use crate::types::{CategoryId, EntrantId, LevelId, RaceMode, TeamId, TeamKey, VenueId};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryResultStore;
pub use postgres::PgResultStore;

/// Errors from a result store
#[derive(Error, Debug)]
pub enum ResultStoreError {
    /// The database rejected or lost a query
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The store cannot be reached right now
    #[error("Result store unavailable: {0}")]
    Unavailable(String),

    /// The race number was already recorded for the venue
    #[error("Race {race} at {venue} is already recorded")]
    Duplicate {
        /// Venue
        venue: VenueId,
        /// Race number
        race: u64,
    },

    /// A value does not fit the storage type
    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

impl ResultStoreError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            ),
            Self::Unavailable(_) => true,
            Self::Migration(_) | Self::Duplicate { .. } | Self::OutOfRange(_) => false,
        }
    }
}

/// One entrant's rating before and after a race
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    /// Entrant
    pub entrant: EntrantId,
    /// Rating going into the race
    pub rating_before: f64,
    /// Rating after applying the team delta
    pub rating_after: f64,
}

/// One team's result
#[derive(Debug, Clone, PartialEq)]
pub struct TeamRecord {
    /// Arena handle, echoed back in the receipt
    pub key: TeamKey,
    /// Persisted id from an earlier race with identical membership
    pub team_id: Option<TeamId>,
    /// Custom name
    pub name: Option<String>,
    /// Members in team order
    pub members: Vec<MemberRecord>,
    /// Place, `None` if forfeited
    pub place: Option<u32>,
    /// Elapsed time, `None` if forfeited
    pub time: Option<TimeDelta>,
    /// Whether the team forfeited
    pub forfeited: bool,
    /// Per-member rating change
    pub rating_delta: f64,
}

impl TeamRecord {
    /// Co-op results are stored against a team id; solo results against the entrant
    #[must_use]
    pub fn is_coop(&self) -> bool {
        self.members.len() > 1
    }
}

/// Everything written when a race completes
#[derive(Debug, Clone, PartialEq)]
pub struct RaceRecord {
    /// Hosting venue
    pub venue: VenueId,
    /// Race number within the venue
    pub race_number: u64,
    /// Category
    pub category: CategoryId,
    /// Level, for series races
    pub level: Option<LevelId>,
    /// Full game or series
    pub mode: RaceMode,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Every team, finished or forfeited
    pub teams: Vec<TeamRecord>,
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitReceipt {
    /// Race number that was written
    pub race_number: u64,
    /// Persisted id of every co-op team
    pub team_ids: BTreeMap<TeamKey, TeamId>,
}

/// Cumulative stats of an entrant in a category
#[derive(Debug, Clone, PartialEq)]
pub struct EntrantStats {
    /// Entrant
    pub entrant: EntrantId,
    /// Category
    pub category: CategoryId,
    /// Current rating
    pub rating: f64,
    /// Races recorded
    pub races: u32,
    /// First places
    pub firsts: u32,
    /// Second places
    pub seconds: u32,
    /// Third places
    pub thirds: u32,
    /// Forfeits
    pub forfeits: u32,
    /// Fastest full-game finish
    pub personal_best: Option<TimeDelta>,
}

impl EntrantStats {
    /// Stats before any race
    #[must_use]
    pub fn empty(entrant: EntrantId, category: CategoryId, rating: f64) -> Self {
        Self {
            entrant,
            category,
            rating,
            races: 0,
            firsts: 0,
            seconds: 0,
            thirds: 0,
            forfeits: 0,
            personal_best: None,
        }
    }

    /// Fold one race into the totals
    pub fn apply(&mut self, update: &StatsUpdate) {
        self.rating = update.rating;
        self.races += 1;
        match update.place {
            Some(1) => self.firsts += 1,
            Some(2) => self.seconds += 1,
            Some(3) => self.thirds += 1,
            _ => {},
        }
        if update.forfeited {
            self.forfeits += 1;
        }
        if let Some(time) = update.personal_best_candidate {
            self.personal_best = Some(self.personal_best.map_or(time, |pb| pb.min(time)));
        }
    }
}

/// Per-entrant change derived from a [`RaceRecord`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatsUpdate {
    /// Entrant
    pub entrant: EntrantId,
    /// New rating
    pub rating: f64,
    /// Team place
    pub place: Option<u32>,
    /// Whether the team forfeited
    pub forfeited: bool,
    /// Finish time that counts toward the personal best
    pub personal_best_candidate: Option<TimeDelta>,
}

impl RaceRecord {
    /// One update per entrant, in team order
    ///
    /// Series races do not count toward the full-game personal best.
    #[must_use]
    pub fn stats_updates(&self) -> Vec<StatsUpdate> {
        self.teams
            .iter()
            .flat_map(|team| {
                team.members.iter().map(move |member| StatsUpdate {
                    entrant: member.entrant,
                    rating: member.rating_after,
                    place: team.place,
                    forfeited: team.forfeited,
                    personal_best_candidate: match self.mode {
                        RaceMode::FullGame => team.time,
                        RaceMode::Series => None,
                    },
                })
            })
            .collect()
    }
}

/// Durable storage for races, teams, stats and ratings
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Number the venue's next race should use
    async fn next_race_number(&self, venue: VenueId) -> Result<u64, ResultStoreError>;

    /// Current rating, `None` for an entrant new to the category
    async fn rating(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<f64>, ResultStoreError>;

    /// Cumulative stats, `None` for an entrant new to the category
    async fn stats(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<EntrantStats>, ResultStoreError>;

    /// Highest-rated entrants of a category, best first
    async fn leaderboard(
        &self,
        category: &CategoryId,
        limit: usize,
    ) -> Result<Vec<EntrantStats>, ResultStoreError>;

    /// Write a complete race atomically
    async fn commit(&self, record: &RaceRecord) -> Result<CommitReceipt, ResultStoreError>;
}
