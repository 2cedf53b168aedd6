//! State of one venue's race session.
//!
//! Entrants and teams refer to each other through handles: an [`Entrant`]
//! stores the [`TeamKey`] of its team, a team stores the [`EntrantId`]s of its
//! members. [`SessionState::check_invariants`] verifies that both directions
//! agree after every reduce.

use crate::config::CategoryConfig;
use crate::notice::StandingsRow;
use crate::rating::{member_delta, team_score, Competitor, Outcome};
use crate::results::{CommitReceipt, MemberRecord, RaceRecord, TeamRecord};
use crate::team::Teams;
use crate::types::{CategoryId, EntrantId, LevelId, SessionStatus, TeamKey, TeamState, VenueId};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A participant of the session
#[derive(Debug, Clone, PartialEq)]
pub struct Entrant {
    /// Display name
    pub name: String,
    /// Readiness for the countdown
    pub ready: bool,
    /// Team handle
    pub team: TeamKey,
    /// Rating going into the current race
    pub rating: f64,
    /// Series levels picked so far
    pub picks: u32,
}

/// Place and delta of every team, for detecting which notices to revise
pub type PlacementSnapshot = BTreeMap<TeamKey, (Option<u32>, Option<f64>)>;

/// One venue's session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Hosting venue
    pub venue: VenueId,
    /// Category raced
    pub category: CategoryId,
    /// Level of the current series race
    pub level: Option<LevelId>,
    /// Resolved settings of the category
    pub config: Arc<CategoryConfig>,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Number of the current race within the venue
    pub race_number: u64,
    /// Team arena
    pub teams: Teams,
    /// Participants by id
    pub entrants: BTreeMap<EntrantId, Entrant>,
    /// Wall-clock start, set when the countdown elapses
    pub start_time: Option<DateTime<Utc>>,
    /// Token of the armed countdown
    pub countdown: Option<u64>,
    /// Token of the armed banking timer
    pub completion: Option<u64>,
    /// Token of the in-flight commit
    pub recording: Option<u64>,
    /// Clear the session once the in-flight commit lands
    pub pending_clear: bool,
    /// Series mode: entrant choosing the next level
    pub next_picker: Option<EntrantId>,
    /// Invariant violation that halted the session
    pub fault: Option<String>,
    /// Reply to the last command
    pub last_reply: Option<String>,
    timer_epoch: u64,
}

impl SessionState {
    /// An empty session
    #[must_use]
    pub fn new(
        venue: VenueId,
        category: CategoryId,
        config: Arc<CategoryConfig>,
        race_number: u64,
    ) -> Self {
        Self {
            venue,
            category,
            level: None,
            config,
            status: SessionStatus::NoRace,
            race_number,
            teams: Teams::new(),
            entrants: BTreeMap::new(),
            start_time: None,
            countdown: None,
            completion: None,
            recording: None,
            pending_clear: false,
            next_picker: None,
            fault: None,
            last_reply: None,
            timer_epoch: 0,
        }
    }

    /// An empty session for the same venue that keeps the timer token sequence
    ///
    /// Carrying the sequence over keeps a timer armed by this session from
    /// matching a token of its replacement.
    #[must_use]
    pub fn fresh(&self, race_number: u64) -> Self {
        let mut next = Self::new(
            self.venue,
            self.category.clone(),
            Arc::clone(&self.config),
            race_number,
        );
        next.timer_epoch = self.timer_epoch;
        next
    }

    /// Allocate a new timer token
    pub fn next_epoch(&mut self) -> u64 {
        self.timer_epoch += 1;
        self.timer_epoch
    }

    /// Team of `entrant`
    #[must_use]
    pub fn team_of(&self, entrant: EntrantId) -> Option<TeamKey> {
        self.entrants.get(&entrant).map(|e| e.team)
    }

    /// Display names of a team's members
    #[must_use]
    pub fn member_names(&self, key: TeamKey) -> Vec<String> {
        self.teams.get(key).map_or_else(Vec::new, |team| {
            team.members()
                .iter()
                .filter_map(|m| self.entrants.get(m).map(|e| e.name.clone()))
                .collect()
        })
    }

    /// Member names of every team
    #[must_use]
    pub fn team_listing(&self) -> Vec<Vec<String>> {
        self.teams.keys().into_iter().map(|k| self.member_names(k)).collect()
    }

    /// Whether every entrant is ready
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.entrants.values().all(|e| e.ready)
    }

    /// Set readiness of every member of `key`
    pub fn set_team_ready(&mut self, key: TeamKey, ready: bool) {
        let members: Vec<EntrantId> = self
            .teams
            .get(key)
            .map(|t| t.members().to_vec())
            .unwrap_or_default();
        for member in members {
            if let Some(entrant) = self.entrants.get_mut(&member) {
                entrant.ready = ready;
                entrant.team = key;
            }
        }
    }

    fn competitor(&self, key: TeamKey) -> Option<Competitor> {
        let team = self.teams.get(key)?;
        let ratings: Vec<f64> = team
            .members()
            .iter()
            .filter_map(|m| self.entrants.get(m).map(|e| e.rating))
            .collect();
        let outcome = match (team.state, team.done_time) {
            (TeamState::Done, Some(time)) => Outcome::Finished(time),
            (TeamState::Forfeited, _) => Outcome::Forfeited,
            _ => Outcome::Racing,
        };
        Some(Competitor {
            score: team_score(&ratings, &self.config.elo),
            outcome,
            size: team.members().len(),
        })
    }

    /// Recompute every team's delta against the current field
    ///
    /// Finished teams are always rated. Forfeited teams are rated only once
    /// the race is final; until then their delta is cleared.
    pub fn recompute_deltas(&mut self, is_final: bool) {
        let field: Vec<(TeamKey, Competitor)> = self
            .teams
            .keys()
            .into_iter()
            .filter_map(|k| self.competitor(k).map(|c| (k, c)))
            .collect();

        let mut deltas = BTreeMap::new();
        for (key, subject) in &field {
            let rated = match subject.outcome {
                Outcome::Finished(_) => true,
                Outcome::Forfeited => is_final,
                Outcome::Racing => false,
            };
            let delta = rated.then(|| {
                let others: Vec<Competitor> = field
                    .iter()
                    .filter(|(other, _)| other != key)
                    .map(|(_, c)| *c)
                    .collect();
                member_delta(subject, &others, &self.config.elo)
            });
            deltas.insert(*key, delta);
        }

        for (key, team) in self.teams.iter_mut() {
            team.rating_delta = deltas.get(&key).copied().flatten();
        }
    }

    /// Place and delta of every team
    #[must_use]
    pub fn placement_snapshot(&self) -> PlacementSnapshot {
        self.teams
            .iter()
            .map(|(k, t)| (k, (t.place, t.rating_delta)))
            .collect()
    }

    /// Finished teams other than `skip` whose place or delta differs from `before`
    #[must_use]
    pub fn changed_placements(&self, before: &PlacementSnapshot, skip: Option<TeamKey>) -> Vec<TeamKey> {
        self.teams
            .iter()
            .filter(|(k, t)| {
                Some(*k) != skip
                    && t.state == TeamState::Done
                    && before.get(k) != Some(&(t.place, t.rating_delta))
            })
            .map(|(k, _)| k)
            .collect()
    }

    /// Standings line of one team
    #[must_use]
    pub fn standings_row(&self, key: TeamKey) -> Option<StandingsRow> {
        let team = self.teams.get(key)?;
        Some(StandingsRow {
            members: self.member_names(key),
            team_name: team.name.clone(),
            place: team.place,
            time: team.done_time,
            rating_delta: team.rating_delta,
        })
    }

    /// Every team's standings line, by place with forfeits last
    #[must_use]
    pub fn standings(&self) -> Vec<StandingsRow> {
        let mut rows: Vec<StandingsRow> = self
            .teams
            .keys()
            .into_iter()
            .filter_map(|k| self.standings_row(k))
            .collect();
        rows.sort_by_key(|r| (r.place.is_none(), r.place, r.time));
        rows
    }

    /// Everything to persist for the current race
    #[must_use]
    pub fn race_record(&self, fallback_start: DateTime<Utc>) -> RaceRecord {
        let teams = self
            .teams
            .iter()
            .map(|(key, team)| {
                let delta = team.rating_delta.unwrap_or(0.0);
                let members = team
                    .members()
                    .iter()
                    .map(|m| {
                        let before = self
                            .entrants
                            .get(m)
                            .map_or(self.config.elo.starting_score, |e| e.rating);
                        MemberRecord {
                            entrant: *m,
                            rating_before: before,
                            rating_after: before + delta,
                        }
                    })
                    .collect();
                TeamRecord {
                    key,
                    team_id: team.previous_team_id,
                    name: team.name.clone(),
                    members,
                    place: team.place,
                    time: team.done_time,
                    forfeited: team.state == TeamState::Forfeited,
                    rating_delta: delta,
                }
            })
            .collect();

        RaceRecord {
            venue: self.venue,
            race_number: self.race_number,
            category: self.category.clone(),
            level: self.level.clone(),
            mode: self.config.mode,
            started_at: self.start_time.unwrap_or(fallback_start),
            teams,
        }
    }

    /// Carry persisted ids and new ratings into the session
    pub fn apply_receipt(&mut self, receipt: &CommitReceipt) {
        let mut gains = Vec::new();
        for (key, team) in self.teams.iter_mut() {
            if let Some(id) = receipt.team_ids.get(&key) {
                team.previous_team_id = Some(*id);
            }
            let delta = team.rating_delta.unwrap_or(0.0);
            gains.extend(team.members().iter().map(|m| (*m, delta)));
        }
        for (member, delta) in gains {
            if let Some(entrant) = self.entrants.get_mut(&member) {
                entrant.rating += delta;
            }
        }
    }

    /// Series mode: same teams, next race
    pub fn reset_for_next_race(&mut self) {
        self.race_number += 1;
        self.status = SessionStatus::Joining;
        self.level = None;
        self.start_time = None;
        for (_, team) in self.teams.iter_mut() {
            team.reset_outcome();
        }
        for entrant in self.entrants.values_mut() {
            entrant.ready = false;
        }
    }

    /// Check the structural invariants of the session
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        if (self.status == SessionStatus::NoRace) != self.teams.is_empty() {
            return Err(format!(
                "status {} with {} teams",
                self.status,
                self.teams.len()
            ));
        }

        let mut members = 0;
        for (key, team) in self.teams.iter() {
            if team.members().is_empty() {
                return Err(format!("{key} has no members"));
            }
            if team.members().len() > self.config.max_team_size {
                return Err(format!("{key} exceeds the team size limit"));
            }
            let done = team.state == TeamState::Done;
            if done != team.place.is_some() || done != team.done_time.is_some() {
                return Err(format!("{key} has place/time out of step with its state"));
            }
            for member in team.members() {
                match self.entrants.get(member) {
                    Some(entrant) if entrant.team == key => {},
                    _ => return Err(format!("{member} in {key} does not point back to it")),
                }
            }
            members += team.members().len();
        }
        if members != self.entrants.len() {
            return Err(format!(
                "{} entrants but {members} team members",
                self.entrants.len()
            ));
        }

        if self.countdown.is_some() != (self.status == SessionStatus::Countdown) {
            return Err(format!("countdown token out of step with status {}", self.status));
        }
        if (self.completion.is_some() || self.recording.is_some())
            && self.status != SessionStatus::Done
        {
            return Err(format!("completion pending while {}", self.status));
        }
        let started = matches!(self.status, SessionStatus::Active | SessionStatus::Done);
        if started != self.start_time.is_some() {
            return Err(format!("start time out of step with status {}", self.status));
        }
        Ok(())
    }
}
