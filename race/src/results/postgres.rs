//! `PostgreSQL`-backed [`ResultStore`].
//!
//! Schema lives in `race/migrations`; run [`PgResultStore::migrate`] once at
//! startup. Times are stored as whole milliseconds.

use super::{
    CommitReceipt, EntrantStats, RaceRecord, ResultStore, ResultStoreError, TeamRecord,
};
use crate::types::{CategoryId, EntrantId, RaceMode, TeamId, VenueId};
use async_trait::async_trait;
use chrono::TimeDelta;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;

fn to_i64(value: u64, what: &str) -> Result<i64, ResultStoreError> {
    i64::try_from(value).map_err(|_| ResultStoreError::OutOfRange(format!("{what} {value}")))
}

fn to_u64(value: i64, what: &str) -> Result<u64, ResultStoreError> {
    u64::try_from(value).map_err(|_| ResultStoreError::OutOfRange(format!("{what} {value}")))
}

fn to_u32(value: i32, what: &str) -> Result<u32, ResultStoreError> {
    u32::try_from(value).map_err(|_| ResultStoreError::OutOfRange(format!("{what} {value}")))
}

const fn mode_str(mode: RaceMode) -> &'static str {
    match mode {
        RaceMode::FullGame => "full_game",
        RaceMode::Series => "series",
    }
}

/// Result store on a `PostgreSQL` pool
///
/// # Example
///
/// ```no_run
/// use racetrack::results::PgResultStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PgResultStore::connect("postgres://localhost/races").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    /// Wrap an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `url`
    ///
    /// # Errors
    ///
    /// Returns [`ResultStoreError::Database`] if no connection can be made.
    pub async fn connect(url: &str) -> Result<Self, ResultStoreError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations
    ///
    /// # Errors
    ///
    /// Returns [`ResultStoreError::Migration`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), ResultStoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_team(
        tx: &mut Transaction<'_, Postgres>,
        team: &TeamRecord,
    ) -> Result<TeamId, ResultStoreError> {
        if let Some(id) = team.team_id {
            sqlx::query("UPDATE teams SET name = $2 WHERE team_id = $1")
                .bind(id.0)
                .bind(team.name.as_deref())
                .execute(&mut **tx)
                .await?;
            return Ok(id);
        }

        let (id,): (i64,) = sqlx::query_as("INSERT INTO teams (name) VALUES ($1) RETURNING team_id")
            .bind(team.name.as_deref())
            .fetch_one(&mut **tx)
            .await?;
        for (position, member) in (0_i32..).zip(&team.members) {
            sqlx::query(
                "INSERT INTO team_members (team_id, entrant_id, position) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(to_i64(member.entrant.0, "entrant")?)
            .bind(position)
            .execute(&mut **tx)
            .await?;
        }
        Ok(TeamId(id))
    }

    fn stats_from_row(row: &PgRow, category: &CategoryId) -> Result<EntrantStats, ResultStoreError> {
        let best: Option<i64> = row.try_get("personal_best_ms")?;
        Ok(EntrantStats {
            entrant: EntrantId(to_u64(row.try_get("entrant_id")?, "entrant")?),
            category: category.clone(),
            rating: row.try_get("rating")?,
            races: to_u32(row.try_get("races")?, "races")?,
            firsts: to_u32(row.try_get("firsts")?, "firsts")?,
            seconds: to_u32(row.try_get("seconds")?, "seconds")?,
            thirds: to_u32(row.try_get("thirds")?, "thirds")?,
            forfeits: to_u32(row.try_get("forfeits")?, "forfeits")?,
            personal_best: best.map(TimeDelta::milliseconds),
        })
    }
}

const STATS_COLUMNS: &str = "entrant_id, rating, races, firsts, seconds, thirds, forfeits, personal_best_ms";

#[async_trait]
impl ResultStore for PgResultStore {
    async fn next_race_number(&self, venue: VenueId) -> Result<u64, ResultStoreError> {
        let (last,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(race_number) FROM races WHERE venue_id = $1")
                .bind(to_i64(venue.0, "venue")?)
                .fetch_one(&self.pool)
                .await?;
        Ok(to_u64(last.unwrap_or(0), "race number")? + 1)
    }

    async fn rating(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<f64>, ResultStoreError> {
        let row: Option<(f64,)> = sqlx::query_as(
            "SELECT rating FROM entrant_stats WHERE entrant_id = $1 AND category_id = $2",
        )
        .bind(to_i64(entrant.0, "entrant")?)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(rating,)| rating))
    }

    async fn stats(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<EntrantStats>, ResultStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATS_COLUMNS} FROM entrant_stats WHERE entrant_id = $1 AND category_id = $2"
        ))
        .bind(to_i64(entrant.0, "entrant")?)
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::stats_from_row(&r, category)).transpose()
    }

    async fn leaderboard(
        &self,
        category: &CategoryId,
        limit: usize,
    ) -> Result<Vec<EntrantStats>, ResultStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {STATS_COLUMNS} FROM entrant_stats
             WHERE category_id = $1
             ORDER BY rating DESC, entrant_id ASC
             LIMIT $2"
        ))
        .bind(category.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Self::stats_from_row(r, category))
            .collect()
    }

    async fn commit(&self, record: &RaceRecord) -> Result<CommitReceipt, ResultStoreError> {
        let venue = to_i64(record.venue.0, "venue")?;
        let race_number = to_i64(record.race_number, "race number")?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO races (venue_id, race_number, category_id, level_id, mode, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (venue_id, race_number) DO NOTHING
            ",
        )
        .bind(venue)
        .bind(race_number)
        .bind(record.category.as_str())
        .bind(record.level.as_ref().map(ToString::to_string))
        .bind(mode_str(record.mode))
        .bind(record.started_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(ResultStoreError::Duplicate {
                venue: record.venue,
                race: record.race_number,
            });
        }

        let mut team_ids = BTreeMap::new();
        for team in &record.teams {
            let (team_id, entrant_id) = if team.is_coop() {
                let id = Self::write_team(&mut tx, team).await?;
                team_ids.insert(team.key, id);
                (Some(id.0), None)
            } else {
                let solo = team
                    .members
                    .first()
                    .map(|m| to_i64(m.entrant.0, "entrant"))
                    .transpose()?;
                (None, solo)
            };

            sqlx::query(
                r"
                INSERT INTO results
                    (venue_id, race_number, team_id, entrant_id, place, time_ms, forfeited, rating_delta)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(venue)
            .bind(race_number)
            .bind(team_id)
            .bind(entrant_id)
            .bind(team.place.map(i64::from))
            .bind(team.time.map(|t| t.num_milliseconds()))
            .bind(team.forfeited)
            .bind(team.rating_delta)
            .execute(&mut *tx)
            .await?;
        }

        for update in record.stats_updates() {
            let place = update.place.unwrap_or(0);
            sqlx::query(
                r"
                INSERT INTO entrant_stats
                    (entrant_id, category_id, rating, races, firsts, seconds, thirds, forfeits, personal_best_ms)
                VALUES ($1, $2, $3, 1, $4, $5, $6, $7, $8)
                ON CONFLICT (entrant_id, category_id) DO UPDATE SET
                    rating = EXCLUDED.rating,
                    races = entrant_stats.races + 1,
                    firsts = entrant_stats.firsts + EXCLUDED.firsts,
                    seconds = entrant_stats.seconds + EXCLUDED.seconds,
                    thirds = entrant_stats.thirds + EXCLUDED.thirds,
                    forfeits = entrant_stats.forfeits + EXCLUDED.forfeits,
                    personal_best_ms = LEAST(entrant_stats.personal_best_ms, EXCLUDED.personal_best_ms)
                ",
            )
            .bind(to_i64(update.entrant.0, "entrant")?)
            .bind(record.category.as_str())
            .bind(update.rating)
            .bind(i32::from(place == 1))
            .bind(i32::from(place == 2))
            .bind(i32::from(place == 3))
            .bind(i32::from(update.forfeited))
            .bind(update.personal_best_candidate.map(|t| t.num_milliseconds()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            venue = %record.venue,
            race = record.race_number,
            teams = record.teams.len(),
            "Race committed"
        );
        metrics::counter!("results.commits.total").increment(1);

        Ok(CommitReceipt {
            race_number: record.race_number,
            team_ids,
        })
    }
}
