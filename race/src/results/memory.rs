//! In-memory [`ResultStore`] for tests, demos and single-process deployments.

use super::{
    CommitReceipt, EntrantStats, RaceRecord, ResultStore, ResultStoreError,
};
use crate::types::{CategoryId, EntrantId, TeamId, VenueId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    races: BTreeMap<(VenueId, u64), RaceRecord>,
    teams: BTreeMap<TeamId, (Option<String>, Vec<EntrantId>)>,
    last_team_id: i64,
    stats: HashMap<(EntrantId, CategoryId), EntrantStats>,
}

/// Result store held entirely in process memory
///
/// A commit takes one lock for its whole duration, so readers never observe
/// half of a race.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    inner: Mutex<Inner>,
    failures: AtomicUsize,
}

impl MemoryResultStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`ResultStoreError::Unavailable`]
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Every recorded race, oldest first per venue
    #[must_use]
    pub fn races(&self) -> Vec<RaceRecord> {
        self.lock().races.values().cloned().collect()
    }

    /// Members of a persisted team
    #[must_use]
    pub fn team_members(&self, team: TeamId) -> Option<Vec<EntrantId>> {
        self.lock().teams.get(&team).map(|(_, members)| members.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn next_race_number(&self, venue: VenueId) -> Result<u64, ResultStoreError> {
        let inner = self.lock();
        let last = inner
            .races
            .range((venue, 0)..=(venue, u64::MAX))
            .next_back()
            .map_or(0, |((_, n), _)| *n);
        Ok(last + 1)
    }

    async fn rating(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<f64>, ResultStoreError> {
        Ok(self
            .lock()
            .stats
            .get(&(entrant, category.clone()))
            .map(|s| s.rating))
    }

    async fn stats(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<EntrantStats>, ResultStoreError> {
        Ok(self.lock().stats.get(&(entrant, category.clone())).cloned())
    }

    async fn leaderboard(
        &self,
        category: &CategoryId,
        limit: usize,
    ) -> Result<Vec<EntrantStats>, ResultStoreError> {
        let mut rows: Vec<EntrantStats> = self
            .lock()
            .stats
            .values()
            .filter(|s| &s.category == category)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then_with(|| a.entrant.cmp(&b.entrant))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn commit(&self, record: &RaceRecord) -> Result<CommitReceipt, ResultStoreError> {
        if self.take_failure() {
            return Err(ResultStoreError::Unavailable("injected failure".into()));
        }

        let mut inner = self.lock();
        let race_key = (record.venue, record.race_number);
        if inner.races.contains_key(&race_key) {
            return Err(ResultStoreError::Duplicate {
                venue: record.venue,
                race: record.race_number,
            });
        }

        let mut receipt = CommitReceipt {
            race_number: record.race_number,
            team_ids: BTreeMap::new(),
        };
        for team in record.teams.iter().filter(|t| t.is_coop()) {
            let id = if let Some(id) = team.team_id {
                if let Some(entry) = inner.teams.get_mut(&id) {
                    entry.0.clone_from(&team.name);
                }
                id
            } else {
                inner.last_team_id += 1;
                let id = TeamId(inner.last_team_id);
                let members = team.members.iter().map(|m| m.entrant).collect();
                inner.teams.insert(id, (team.name.clone(), members));
                id
            };
            receipt.team_ids.insert(team.key, id);
        }

        for update in record.stats_updates() {
            let key = (update.entrant, record.category.clone());
            inner
                .stats
                .entry(key)
                .or_insert_with(|| {
                    EntrantStats::empty(update.entrant, record.category.clone(), update.rating)
                })
                .apply(&update);
        }

        inner.races.insert(race_key, record.clone());
        drop(inner);

        tracing::debug!(
            venue = %record.venue,
            race = record.race_number,
            teams = record.teams.len(),
            "Race committed to memory store"
        );
        Ok(receipt)
    }
}
