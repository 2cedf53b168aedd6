//! Teams and the per-session team arena.
//!
//! A [`Team`] is an ordered, non-empty list of entrants with per-race outcome
//! fields. [`Teams`] owns every team of a session under a [`TeamKey`] handle
//! and maintains placement when finishes arrive out of order.

use crate::types::{EntrantId, TeamId, TeamKey, TeamState};
use chrono::TimeDelta;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Rejected team mutations; the message is the reply to the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TeamError {
    /// The merged team would be too large
    #[error("Teams are limited to {max} members")]
    TooLarge {
        /// Configured maximum
        max: usize,
    },

    /// Another team already uses the name
    #[error("The team name \"{0}\" is already taken")]
    DuplicateName(String),

    /// Names are for co-op teams only
    #[error("Only teams with more than one member can be named")]
    SoloName,

    /// Both entrants are already together
    #[error("You are already on the same team")]
    SameTeam,

    /// The entrant is racing alone
    #[error("You are not on a team")]
    NotTeamed,

    /// Randomized groups must hold at least one entrant
    #[error("Team size must be between 1 and {max}")]
    BadGroupSize {
        /// Configured maximum
        max: usize,
    },
}

/// A group of entrants racing as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    members: Vec<EntrantId>,
    /// Outcome of the current race
    pub state: TeamState,
    /// Elapsed time, set iff `state == Done`
    pub done_time: Option<TimeDelta>,
    /// 1-based place, set iff `state == Done`
    pub place: Option<u32>,
    /// Per-member rating change against the current field
    pub rating_delta: Option<f64>,
    /// Persisted identity, cleared whenever membership changes
    pub previous_team_id: Option<TeamId>,
    /// Custom name
    pub name: Option<String>,
}

impl Team {
    /// A fresh solo team
    #[must_use]
    pub fn solo(entrant: EntrantId) -> Self {
        Self::with_members(vec![entrant])
    }

    fn with_members(members: Vec<EntrantId>) -> Self {
        Self {
            members,
            state: TeamState::NotDone,
            done_time: None,
            place: None,
            rating_delta: None,
            previous_team_id: None,
            name: None,
        }
    }

    /// Members in join order
    #[must_use]
    pub fn members(&self) -> &[EntrantId] {
        &self.members
    }

    /// Whether the team has more than one member
    #[must_use]
    pub fn is_coop(&self) -> bool {
        self.members.len() > 1
    }

    /// Mark finished at `time` in `place`
    pub fn finish(&mut self, time: TimeDelta, place: u32) {
        self.state = TeamState::Done;
        self.done_time = Some(time);
        self.place = Some(place);
    }

    /// Mark forfeited
    pub fn forfeit(&mut self) {
        self.state = TeamState::Forfeited;
        self.done_time = None;
        self.place = None;
        self.rating_delta = None;
    }

    /// Back to racing with every per-race field cleared
    pub fn reset_outcome(&mut self) {
        self.state = TeamState::NotDone;
        self.done_time = None;
        self.place = None;
        self.rating_delta = None;
    }

    fn membership_changed(&mut self) {
        self.previous_team_id = None;
        if self.members.len() <= 1 {
            self.name = None;
        }
    }
}

/// Arena of a session's teams, in creation order
#[derive(Debug, Clone, Default)]
pub struct Teams {
    teams: BTreeMap<TeamKey, Team>,
    next_key: u32,
}

impl Teams {
    /// Empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of teams
    #[must_use]
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    /// Whether there are no teams
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    /// Team by key
    #[must_use]
    pub fn get(&self, key: TeamKey) -> Option<&Team> {
        self.teams.get(&key)
    }

    /// Mutable team by key
    pub fn get_mut(&mut self, key: TeamKey) -> Option<&mut Team> {
        self.teams.get_mut(&key)
    }

    /// All teams in creation order
    pub fn iter(&self) -> impl Iterator<Item = (TeamKey, &Team)> {
        self.teams.iter().map(|(k, t)| (*k, t))
    }

    /// All teams, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TeamKey, &mut Team)> {
        self.teams.iter_mut().map(|(k, t)| (*k, t))
    }

    /// Keys in creation order
    #[must_use]
    pub fn keys(&self) -> Vec<TeamKey> {
        self.teams.keys().copied().collect()
    }

    /// Add a solo team for `entrant`
    pub fn add_solo(&mut self, entrant: EntrantId) -> TeamKey {
        self.insert(Team::solo(entrant))
    }

    fn insert(&mut self, team: Team) -> TeamKey {
        let key = TeamKey(self.next_key);
        self.next_key += 1;
        self.teams.insert(key, team);
        key
    }

    /// Remove `entrant` from `key`, deleting the team if it empties
    ///
    /// Returns `true` if the team was deleted.
    pub fn remove_member(&mut self, key: TeamKey, entrant: EntrantId) -> bool {
        let Some(team) = self.teams.get_mut(&key) else {
            return false;
        };
        team.members.retain(|m| *m != entrant);
        if team.members.is_empty() {
            self.teams.remove(&key);
            return true;
        }
        team.membership_changed();
        false
    }

    /// Move every member of `from` into `into`
    ///
    /// # Errors
    ///
    /// [`TeamError::SameTeam`] or [`TeamError::TooLarge`]; nothing changes.
    pub fn merge(
        &mut self,
        into: TeamKey,
        from: TeamKey,
        max_size: usize,
    ) -> Result<Vec<EntrantId>, TeamError> {
        if into == from {
            return Err(TeamError::SameTeam);
        }
        let incoming = self.teams.get(&from).map_or(0, |t| t.members.len());
        let existing = self.teams.get(&into).map_or(0, |t| t.members.len());
        if incoming + existing > max_size {
            return Err(TeamError::TooLarge { max: max_size });
        }

        let moved = self.teams.remove(&from).map(|t| t.members).unwrap_or_default();
        if let Some(team) = self.teams.get_mut(&into) {
            team.members.extend(moved.iter().copied());
            team.membership_changed();
        }
        Ok(moved)
    }

    /// Move `entrant` out of `key` into a new solo team
    ///
    /// # Errors
    ///
    /// [`TeamError::NotTeamed`] if `key` is a solo team.
    pub fn split(&mut self, key: TeamKey, entrant: EntrantId) -> Result<TeamKey, TeamError> {
        match self.teams.get(&key) {
            Some(team) if team.is_coop() && team.members.contains(&entrant) => {},
            _ => return Err(TeamError::NotTeamed),
        }
        self.remove_member(key, entrant);
        Ok(self.add_solo(entrant))
    }

    /// Replace every team with random groups of `group_size`
    ///
    /// The last group may be smaller. Returns the new key of every entrant.
    ///
    /// # Errors
    ///
    /// [`TeamError::BadGroupSize`] if `group_size` is 0 or above `max_size`.
    pub fn randomize<R: Rng + ?Sized>(
        &mut self,
        group_size: usize,
        max_size: usize,
        rng: &mut R,
    ) -> Result<Vec<(EntrantId, TeamKey)>, TeamError> {
        if group_size == 0 || group_size > max_size {
            return Err(TeamError::BadGroupSize { max: max_size });
        }

        let mut everyone: Vec<EntrantId> = self
            .teams
            .values()
            .flat_map(|t| t.members.iter().copied())
            .collect();
        everyone.shuffle(rng);

        self.teams.clear();
        let mut assignments = Vec::with_capacity(everyone.len());
        for group in everyone.chunks(group_size) {
            let key = self.insert(Team::with_members(group.to_vec()));
            assignments.extend(group.iter().map(|e| (*e, key)));
        }
        Ok(assignments)
    }

    /// Set a custom name, case-insensitively unique
    ///
    /// # Errors
    ///
    /// [`TeamError::SoloName`] or [`TeamError::DuplicateName`].
    pub fn rename(&mut self, key: TeamKey, name: &str) -> Result<(), TeamError> {
        let taken = self.teams.iter().any(|(k, t)| {
            *k != key && t.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name))
        });
        if taken {
            return Err(TeamError::DuplicateName(name.to_string()));
        }
        match self.teams.get_mut(&key) {
            Some(team) if team.is_coop() => {
                team.name = Some(name.to_string());
                Ok(())
            },
            _ => Err(TeamError::SoloName),
        }
    }

    /// Record a finish for `key` and correct the places of slower teams
    ///
    /// The team's place is one more than the number of finished teams that
    /// were strictly faster. Every finished team strictly slower moves down
    /// one place; equal times tie. Returns the keys whose place moved.
    pub fn place_finish(&mut self, key: TeamKey, time: TimeDelta) -> Vec<TeamKey> {
        let mut place = 1;
        let mut shifted = Vec::new();

        for (other_key, other) in &mut self.teams {
            if *other_key == key || other.state != TeamState::Done {
                continue;
            }
            let (Some(other_time), Some(other_place)) = (other.done_time, other.place.as_mut())
            else {
                continue;
            };
            match other_time.cmp(&time) {
                Ordering::Less => place += 1,
                Ordering::Greater => {
                    *other_place += 1;
                    shifted.push(*other_key);
                },
                Ordering::Equal => {},
            }
        }

        if let Some(team) = self.teams.get_mut(&key) {
            team.finish(time, place);
        }
        shifted
    }

    /// Undo the finish of `key` and move slower teams back up
    ///
    /// Returns the keys whose place moved.
    pub fn withdraw_finish(&mut self, key: TeamKey) -> Vec<TeamKey> {
        let Some(time) = self.teams.get(&key).and_then(|t| t.done_time) else {
            return Vec::new();
        };
        if let Some(team) = self.teams.get_mut(&key) {
            team.reset_outcome();
        }

        let mut shifted = Vec::new();
        for (other_key, other) in &mut self.teams {
            if other.state != TeamState::Done || other.done_time <= Some(time) {
                continue;
            }
            if let Some(place) = other.place.as_mut() {
                *place = place.saturating_sub(1).max(1);
                shifted.push(*other_key);
            }
        }
        shifted
    }

    /// Teams that are still racing
    pub fn not_done(&self) -> impl Iterator<Item = TeamKey> + '_ {
        self.iter()
            .filter(|(_, t)| t.state == TeamState::NotDone)
            .map(|(k, _)| k)
    }

    /// Whether every team forfeited
    #[must_use]
    pub fn all_forfeited(&self) -> bool {
        self.teams.values().all(|t| t.state == TeamState::Forfeited)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn e(id: u64) -> EntrantId {
        EntrantId(id)
    }

    fn arena(n: u64) -> (Teams, Vec<TeamKey>) {
        let mut teams = Teams::new();
        let keys = (1..=n).map(|i| teams.add_solo(e(i))).collect();
        (teams, keys)
    }

    fn places(teams: &Teams) -> Vec<Option<u32>> {
        teams.iter().map(|(_, t)| t.place).collect()
    }

    #[test]
    fn late_report_of_faster_finish_corrects_places() {
        let (mut teams, k) = arena(3);

        assert!(teams.place_finish(k[0], TimeDelta::seconds(30)).is_empty());
        assert_eq!(teams.place_finish(k[1], TimeDelta::seconds(25)), vec![k[0]]);
        assert!(teams.place_finish(k[2], TimeDelta::seconds(40)).is_empty());

        assert_eq!(places(&teams), vec![Some(2), Some(1), Some(3)]);
    }

    #[test]
    fn ties_share_a_place_and_leave_a_gap() {
        let (mut teams, k) = arena(3);
        teams.place_finish(k[0], TimeDelta::seconds(30));
        teams.place_finish(k[1], TimeDelta::seconds(30));
        teams.place_finish(k[2], TimeDelta::seconds(31));

        assert_eq!(places(&teams), vec![Some(1), Some(1), Some(3)]);
    }

    #[test]
    fn withdraw_restores_previous_places() {
        let (mut teams, k) = arena(3);
        teams.place_finish(k[0], TimeDelta::seconds(30));
        teams.place_finish(k[2], TimeDelta::seconds(40));
        let before = places(&teams);

        teams.place_finish(k[1], TimeDelta::seconds(10));
        assert_eq!(teams.withdraw_finish(k[1]), vec![k[0], k[2]]);

        assert_eq!(places(&teams), before);
        assert_eq!(teams.get(k[1]).unwrap().state, TeamState::NotDone);
    }

    #[test]
    fn merge_respects_max_size_and_clears_ids() {
        let (mut teams, k) = arena(3);
        teams.get_mut(k[0]).unwrap().previous_team_id = Some(TeamId(9));

        assert_eq!(teams.merge(k[0], k[1], 2).unwrap(), vec![e(2)]);
        assert_eq!(teams.len(), 2);
        assert_eq!(teams.get(k[0]).unwrap().members(), &[e(1), e(2)]);
        assert_eq!(teams.get(k[0]).unwrap().previous_team_id, None);

        assert_eq!(teams.merge(k[0], k[2], 2), Err(TeamError::TooLarge { max: 2 }));
        assert_eq!(teams.merge(k[0], k[0], 4), Err(TeamError::SameTeam));
    }

    #[test]
    fn split_clears_name_of_remaining_solo() {
        let (mut teams, k) = arena(2);
        teams.merge(k[0], k[1], 4).unwrap();
        teams.rename(k[0], "Duo").unwrap();

        let solo = teams.split(k[0], e(2)).unwrap();
        assert_eq!(teams.get(solo).unwrap().members(), &[e(2)]);
        assert_eq!(teams.get(k[0]).unwrap().name, None);
        assert_eq!(teams.split(k[0], e(1)), Err(TeamError::NotTeamed));
    }

    #[test]
    fn rename_rejects_duplicates_and_solos() {
        let (mut teams, k) = arena(4);
        teams.merge(k[0], k[1], 4).unwrap();
        teams.merge(k[2], k[3], 4).unwrap();

        teams.rename(k[0], "Blue").unwrap();
        assert_eq!(
            teams.rename(k[2], "blue"),
            Err(TeamError::DuplicateName("blue".into()))
        );
        teams.rename(k[0], "BLUE").unwrap();

        let (mut solos, s) = arena(1);
        assert_eq!(solos.rename(s[0], "Solo"), Err(TeamError::SoloName));
    }

    #[test]
    fn randomize_partitions_everyone() {
        let (mut teams, _) = arena(5);
        let mut rng = StdRng::seed_from_u64(7);

        let assignments = teams.randomize(2, 4, &mut rng).unwrap();
        assert_eq!(assignments.len(), 5);
        assert_eq!(teams.len(), 3);
        let sizes: Vec<usize> = teams.iter().map(|(_, t)| t.members().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        assert_eq!(
            teams.randomize(0, 4, &mut rng),
            Err(TeamError::BadGroupSize { max: 4 })
        );
    }

    #[test]
    fn emptied_team_is_deleted() {
        let (mut teams, k) = arena(1);
        assert!(teams.remove_member(k[0], e(1)));
        assert!(teams.is_empty());
    }

    proptest! {
        #[test]
        fn places_match_rank_in_any_arrival_order(
            times in proptest::collection::vec(0_i64..50, 1..8),
            seed in any::<u64>(),
        ) {
            let n = times.len();
            let (mut teams, keys) = arena(n as u64);
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut StdRng::seed_from_u64(seed));

            for i in order {
                teams.place_finish(keys[i], TimeDelta::seconds(times[i]));
            }

            for (i, key) in keys.iter().enumerate() {
                let faster = times.iter().filter(|t| **t < times[i]).count();
                prop_assert_eq!(teams.get(*key).unwrap().place, Some(faster as u32 + 1));
            }
        }
    }
}
