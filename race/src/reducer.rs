//! Race session reducer.
//!
//! Every command and every timer or persistence outcome is reduced here under
//! the venue Store's write lock. Timers are cancellable effect groups and
//! their actions carry the token they were armed with, so a timer that fires
//! after its group was cancelled finds a different token and does nothing.

use crate::action::RaceAction;
use crate::directory::EntrantDirectory;
use crate::metrics as race_metrics;
use crate::notice::{Announcer, Notice, NoticeOutbox, Outgoing};
use crate::results::{CommitReceipt, ResultStore, ResultStoreError};
use crate::session::{Entrant, PlacementSnapshot, SessionState};
use crate::types::{EntrantId, LevelId, RaceMode, SessionStatus, TeamKey, TeamState};
use chrono::{DateTime, TimeDelta, Utc};
use racetrack_core::{
    effect::{Effect, EffectId},
    environment::Clock,
    reducer::Reducer,
    SmallVec,
};
use racetrack_runtime::retry::{retry_with_predicate, RetryPolicy};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Countdown ticks and the start signal
pub const COUNTDOWN: EffectId = EffectId::from_static("countdown");

/// Banking period after every team is done
pub const COMPLETION: EffectId = EffectId::from_static("completion");

/// In-flight commit of race results
pub const RECORDING: EffectId = EffectId::from_static("recording");

const NOT_IN_RACE: &str = "You are not in this race";

// ============================================================================
// Environment
// ============================================================================

/// Dependencies of the race reducer
#[derive(Clone)]
pub struct RaceEnvironment {
    /// Stamps race starts and recording times
    pub clock: Arc<dyn Clock>,
    /// Delivers notices to each venue in reduce order
    pub notices: NoticeOutbox,
    /// Durable results
    pub results: Arc<dyn ResultStore>,
    /// Cross-venue entrant claims
    pub directory: Arc<dyn EntrantDirectory>,
    /// Shuffles randomized teams
    pub rng: Arc<Mutex<StdRng>>,
    /// Backoff for result commits
    pub retry: RetryPolicy,
}

impl RaceEnvironment {
    /// Environment with an entropy-seeded shuffle and the default retry policy
    ///
    /// Notices are only delivered when this is called inside a Tokio runtime.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        announcer: Arc<dyn Announcer>,
        results: Arc<dyn ResultStore>,
        directory: Arc<dyn EntrantDirectory>,
    ) -> Self {
        Self {
            clock,
            notices: NoticeOutbox::new(announcer),
            results,
            directory,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            retry: RetryPolicy::default(),
        }
    }

    /// Use a deterministic shuffle
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// Use `policy` for result commits
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

// ============================================================================
// Effects of one reduce
// ============================================================================

#[derive(Default)]
struct Step {
    outgoing: Vec<Outgoing>,
    effects: SmallVec<[Effect<RaceAction>; 4]>,
}

impl Step {
    fn announce(&mut self, notice: Notice) {
        self.outgoing.push(Outgoing::Announce(notice));
    }

    fn revise(&mut self, notice: Notice) {
        if let Some(key) = notice.key() {
            self.outgoing.push(Outgoing::Revise(key, notice));
        }
    }

    fn run(&mut self, effect: Effect<RaceAction>) {
        self.effects.push(effect);
    }

    /// Post the notices while the Store lock is still held, so batches queue
    /// in reduce order
    fn into_effects(
        self,
        state: &SessionState,
        notices: &NoticeOutbox,
    ) -> SmallVec<[Effect<RaceAction>; 4]> {
        notices.post(state.venue, self.outgoing);
        self.effects
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer of one venue's race session
#[derive(Clone, Debug, Default)]
pub struct RaceReducer;

impl RaceReducer {
    /// Creates a new `RaceReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply(state: &mut SessionState, action: RaceAction, env: &RaceEnvironment, step: &mut Step) {
        let outcome = match action {
            RaceAction::Join {
                entrant,
                name,
                rating,
            } => Self::join(state, env, step, entrant, name, rating),
            RaceAction::Leave { entrant } => Self::leave(state, env, step, entrant),
            RaceAction::SetReady { entrant, ready } => Self::set_ready(state, step, entrant, ready),
            RaceAction::ReportFinish { entrant, at } => {
                Self::report_finish(state, env, step, entrant, at)
            },
            RaceAction::ReportForfeit { entrant } => Self::report_forfeit(state, env, step, entrant),
            RaceAction::UndoFinish { entrant } => Self::undo_finish(state, step, entrant),
            RaceAction::UndoForfeit { entrant } => Self::undo_forfeit(state, step, entrant),
            RaceAction::TeamWith { entrant, partner } => {
                Self::team_with(state, step, entrant, partner)
            },
            RaceAction::Unteam { entrant } => Self::unteam(state, step, entrant),
            RaceAction::RandomizeTeams { group_size } => {
                Self::randomize_teams(state, env, step, group_size)
            },
            RaceAction::RenameTeam { entrant, name } => Self::rename_team(state, entrant, &name),
            RaceAction::SetLevel { entrant, level } => Self::set_level(state, step, entrant, level),
            RaceAction::Finalize => Self::finalize(state, env, step),
            RaceAction::AdminClear { persist_first } => {
                Self::admin_clear(state, env, step, persist_first);
                Ok(())
            },
            RaceAction::CountdownTick { epoch, remaining } => {
                Self::countdown_tick(state, step, epoch, remaining);
                Ok(())
            },
            RaceAction::CountdownElapsed { epoch } => {
                Self::countdown_elapsed(state, env, step, epoch);
                Ok(())
            },
            RaceAction::CompletionElapsed { epoch } => {
                Self::completion_elapsed(state, env, step, epoch);
                Ok(())
            },
            RaceAction::RaceRecorded { epoch, receipt } => {
                Self::race_recorded(state, env, step, epoch, &receipt);
                Ok(())
            },
            RaceAction::RecordingFailed { epoch, error } => {
                Self::recording_failed(state, step, epoch, error);
                Ok(())
            },
        };

        if let Err(reply) = outcome {
            state.last_reply = Some(reply);
        }
    }

    // ========== Membership ==========

    fn join(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        entrant: EntrantId,
        name: String,
        rating: Option<f64>,
    ) -> Result<(), String> {
        if !state.status.is_open() {
            return Err("The race has already started".to_string());
        }
        if state.entrants.contains_key(&entrant) {
            return Err(format!("{name} is already in this race"));
        }
        env.directory
            .claim(entrant, state.venue)
            .map_err(|venue| format!("{name} is already racing at {venue}"))?;

        Self::revert_countdown(state, step);
        let team = state.teams.add_solo(entrant);
        state.entrants.insert(
            entrant,
            Entrant {
                name: name.clone(),
                ready: false,
                team,
                rating: rating.unwrap_or(state.config.elo.starting_score),
                picks: 0,
            },
        );
        if state.status == SessionStatus::NoRace {
            state.status = SessionStatus::Joining;
        }

        tracing::debug!(venue = %state.venue, %entrant, %team, "Entrant joined");
        step.announce(Notice::Joined { name });
        Ok(())
    }

    fn leave(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        entrant: EntrantId,
    ) -> Result<(), String> {
        let team = state.team_of(entrant).ok_or(NOT_IN_RACE)?;
        if !state.status.is_open() {
            return Err("You cannot leave a running race; forfeit instead".to_string());
        }

        Self::revert_countdown(state, step);
        state.teams.remove_member(team, entrant);
        let name = state
            .entrants
            .remove(&entrant)
            .map(|e| e.name)
            .unwrap_or_default();
        env.directory.release(entrant, state.venue);
        if state.next_picker == Some(entrant) {
            state.next_picker = None;
        }
        if state.teams.is_empty() {
            state.status = SessionStatus::NoRace;
            state.level = None;
        }

        tracing::debug!(venue = %state.venue, %entrant, "Entrant left");
        step.announce(Notice::Left { name });
        Self::maybe_start_countdown(state, step);
        Ok(())
    }

    fn set_ready(
        state: &mut SessionState,
        step: &mut Step,
        entrant: EntrantId,
        ready: bool,
    ) -> Result<(), String> {
        let current = state.entrants.get(&entrant).map(|e| e.ready).ok_or(NOT_IN_RACE)?;
        if !matches!(state.status, SessionStatus::Joining | SessionStatus::Countdown) {
            return Err("The race has already started".to_string());
        }
        if ready && state.teams.len() < 2 {
            return Err("At least two teams are needed to start a race".to_string());
        }
        if current == ready {
            return Err(if ready { "You are already ready" } else { "You are not ready" }.to_string());
        }

        Self::revert_countdown(state, step);
        if let Some(e) = state.entrants.get_mut(&entrant) {
            e.ready = ready;
        }
        Self::maybe_start_countdown(state, step);
        Ok(())
    }

    fn require_teams_open(state: &SessionState) -> Result<(), String> {
        match state.status {
            SessionStatus::Joining | SessionStatus::Countdown => Ok(()),
            SessionStatus::NoRace => Err("Nobody has joined yet".to_string()),
            SessionStatus::Active | SessionStatus::Done => {
                Err("Teams cannot change once the race has started".to_string())
            },
        }
    }

    fn teams_changed(state: &SessionState, step: &mut Step) {
        step.announce(Notice::TeamsChanged {
            teams: state.team_listing(),
        });
    }

    fn team_with(
        state: &mut SessionState,
        step: &mut Step,
        entrant: EntrantId,
        partner: EntrantId,
    ) -> Result<(), String> {
        Self::require_teams_open(state)?;
        let (Some(into), Some(from)) = (state.team_of(entrant), state.team_of(partner)) else {
            return Err("Both entrants must be in this race".to_string());
        };
        let moved = state
            .teams
            .merge(into, from, state.config.max_team_size)
            .map_err(|e| e.to_string())?;

        Self::revert_countdown(state, step);
        state.set_team_ready(into, false);
        tracing::debug!(venue = %state.venue, team = %into, moved = moved.len(), "Teams merged");
        Self::teams_changed(state, step);
        Ok(())
    }

    fn unteam(state: &mut SessionState, step: &mut Step, entrant: EntrantId) -> Result<(), String> {
        Self::require_teams_open(state)?;
        let team = state.team_of(entrant).ok_or(NOT_IN_RACE)?;
        let solo = state.teams.split(team, entrant).map_err(|e| e.to_string())?;

        Self::revert_countdown(state, step);
        state.set_team_ready(team, false);
        state.set_team_ready(solo, false);
        Self::teams_changed(state, step);
        Ok(())
    }

    fn randomize_teams(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        group_size: usize,
    ) -> Result<(), String> {
        Self::require_teams_open(state)?;
        let assignments = {
            let mut rng = env.rng.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .teams
                .randomize(group_size, state.config.max_team_size, &mut *rng)
                .map_err(|e| e.to_string())?
        };

        Self::revert_countdown(state, step);
        for (member, team) in assignments {
            if let Some(e) = state.entrants.get_mut(&member) {
                e.team = team;
                e.ready = false;
            }
        }
        Self::teams_changed(state, step);
        Ok(())
    }

    fn rename_team(state: &mut SessionState, entrant: EntrantId, name: &str) -> Result<(), String> {
        Self::require_teams_open(state)?;
        let team = state.team_of(entrant).ok_or(NOT_IN_RACE)?;
        let name = name.trim();
        if name.is_empty() {
            return Err("Team names cannot be empty".to_string());
        }
        state.teams.rename(team, name).map_err(|e| e.to_string())?;
        state.last_reply = Some(format!("Your team is now called {name}"));
        Ok(())
    }

    fn set_level(
        state: &mut SessionState,
        step: &mut Step,
        entrant: EntrantId,
        level: LevelId,
    ) -> Result<(), String> {
        if !state.entrants.contains_key(&entrant) {
            return Err(NOT_IN_RACE.to_string());
        }
        if state.config.mode != RaceMode::Series {
            return Err("Levels are only chosen in series races".to_string());
        }
        if state.status != SessionStatus::Joining {
            return Err("The level can only be chosen before the countdown".to_string());
        }
        if let Some(picker) = state.next_picker.filter(|p| *p != entrant) {
            let name = state
                .entrants
                .get(&picker)
                .map_or_else(|| picker.to_string(), |e| e.name.clone());
            return Err(format!("{name} picks the next level"));
        }

        state.level = Some(level.clone());
        step.announce(Notice::LevelSet { level });
        Ok(())
    }

    // ========== Countdown ==========

    fn maybe_start_countdown(state: &mut SessionState, step: &mut Step) {
        if state.status != SessionStatus::Joining || state.teams.len() < 2 || !state.all_ready() {
            return;
        }

        let epoch = state.next_epoch();
        state.status = SessionStatus::Countdown;
        state.countdown = Some(epoch);

        let length = state.config.countdown;
        let mut timers: Vec<Effect<RaceAction>> = state
            .config
            .active_ticks()
            .into_iter()
            .map(|remaining| {
                Effect::delay(
                    length.saturating_sub(Duration::from_secs(remaining)),
                    RaceAction::CountdownTick { epoch, remaining },
                )
            })
            .collect();
        timers.push(Effect::delay(length, RaceAction::CountdownElapsed { epoch }));
        step.run(Effect::merge(timers).cancellable(COUNTDOWN));

        tracing::debug!(venue = %state.venue, epoch, "Countdown started");
        step.announce(Notice::CountdownStarted {
            race: state.race_number,
            seconds: length.as_secs(),
        });
    }

    fn revert_countdown(state: &mut SessionState, step: &mut Step) {
        if state.status != SessionStatus::Countdown {
            return;
        }
        state.status = SessionStatus::Joining;
        state.countdown = None;
        step.run(Effect::Cancel(COUNTDOWN));

        tracing::debug!(venue = %state.venue, "Countdown aborted");
        step.announce(Notice::CountdownAborted);
    }

    fn stale(state: &SessionState, timer: &'static str, epoch: u64) {
        tracing::warn!(venue = %state.venue, timer, epoch, "Ignoring stale timer action");
        race_metrics::record_stale_timer(timer);
    }

    fn countdown_tick(state: &SessionState, step: &mut Step, epoch: u64, remaining: u64) {
        if state.countdown != Some(epoch) {
            Self::stale(state, "countdown", epoch);
            return;
        }
        step.announce(Notice::CountdownTick { remaining });
    }

    fn countdown_elapsed(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        epoch: u64,
    ) {
        if state.countdown != Some(epoch) {
            Self::stale(state, "countdown", epoch);
            return;
        }
        state.countdown = None;
        state.status = SessionStatus::Active;
        state.start_time = Some(env.clock.now());

        tracing::info!(venue = %state.venue, race = state.race_number, "Race started");
        race_metrics::record_race_started();
        step.announce(Notice::Started {
            race: state.race_number,
        });
    }

    // ========== Finishing ==========

    fn racing_team(state: &SessionState, entrant: EntrantId) -> Result<TeamKey, String> {
        let team = state.team_of(entrant).ok_or(NOT_IN_RACE)?;
        if state.status != SessionStatus::Active {
            return Err("The race is not running".to_string());
        }
        match state.teams.get(team) {
            Some(t) if t.state == TeamState::NotDone => Ok(team),
            _ => Err("Your team is already done".to_string()),
        }
    }

    fn revise_placements(
        state: &SessionState,
        step: &mut Step,
        before: &PlacementSnapshot,
        skip: Option<TeamKey>,
    ) {
        for team in state.changed_placements(before, skip) {
            if let Some(row) = state.standings_row(team) {
                step.revise(Notice::Placement {
                    race: state.race_number,
                    team,
                    row,
                });
            }
        }
    }

    fn report_finish(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        entrant: EntrantId,
        at: DateTime<Utc>,
    ) -> Result<(), String> {
        let team = Self::racing_team(state, entrant)?;
        let start = state.start_time.unwrap_or(at);
        let elapsed = (at - start).max(TimeDelta::zero());

        let before = state.placement_snapshot();
        let shifted = state.teams.place_finish(team, elapsed);
        state.recompute_deltas(false);

        if let Some(row) = state.standings_row(team) {
            tracing::debug!(
                venue = %state.venue,
                %team,
                place = ?row.place,
                shifted = shifted.len(),
                "Team finished"
            );
            step.announce(Notice::Placement {
                race: state.race_number,
                team,
                row,
            });
        }
        Self::revise_placements(state, step, &before, Some(team));
        Self::check_done(state, env, step);
        Ok(())
    }

    fn report_forfeit(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        entrant: EntrantId,
    ) -> Result<(), String> {
        let team = Self::racing_team(state, entrant)?;

        let before = state.placement_snapshot();
        if let Some(t) = state.teams.get_mut(team) {
            t.forfeit();
        }
        state.recompute_deltas(false);

        tracing::debug!(venue = %state.venue, %team, "Team forfeited");
        step.announce(Notice::Forfeited {
            members: state.member_names(team),
        });
        Self::revise_placements(state, step, &before, None);
        Self::check_done(state, env, step);
        Ok(())
    }

    fn check_done(state: &mut SessionState, env: &RaceEnvironment, step: &mut Step) {
        if state.status != SessionStatus::Active || state.teams.not_done().next().is_some() {
            return;
        }
        state.status = SessionStatus::Done;

        let before = state.placement_snapshot();
        state.recompute_deltas(true);
        Self::revise_placements(state, step, &before, None);

        let abandoned = state.teams.all_forfeited();
        race_metrics::record_race_completed(state.teams.len(), abandoned);
        tracing::info!(venue = %state.venue, race = state.race_number, abandoned, "Race done");
        step.announce(Notice::Standings {
            race: state.race_number,
            rows: state.standings(),
        });

        if abandoned {
            step.announce(Notice::Abandoned {
                race: state.race_number,
            });
        }

        let banking = state.config.banking_period();
        if abandoned || banking.is_zero() {
            Self::begin_recording(state, env, step);
        } else {
            let epoch = state.next_epoch();
            state.completion = Some(epoch);
            step.run(
                Effect::delay(banking, RaceAction::CompletionElapsed { epoch }).cancellable(COMPLETION),
            );
        }
    }

    // ========== Undo ==========

    fn require_undoable(state: &SessionState) -> Result<(), String> {
        match state.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Done if state.recording.is_none() && !state.pending_clear => Ok(()),
            SessionStatus::Done => Err("Results are already being recorded".to_string()),
            _ => Err("The race is not running".to_string()),
        }
    }

    fn resume_if_done(state: &mut SessionState, step: &mut Step) {
        if state.status != SessionStatus::Done {
            return;
        }
        state.status = SessionStatus::Active;
        if state.completion.take().is_some() {
            step.run(Effect::Cancel(COMPLETION));
        }

        tracing::debug!(venue = %state.venue, "Race resumed");
        step.announce(Notice::Resumed);
    }

    fn undo_finish(state: &mut SessionState, step: &mut Step, entrant: EntrantId) -> Result<(), String> {
        let team = state.team_of(entrant).ok_or(NOT_IN_RACE)?;
        Self::require_undoable(state)?;
        if state.teams.get(team).map(|t| t.state) != Some(TeamState::Done) {
            return Err("Your team has not finished".to_string());
        }

        let before = state.placement_snapshot();
        let shifted = state.teams.withdraw_finish(team);
        Self::resume_if_done(state, step);
        state.recompute_deltas(false);

        tracing::debug!(venue = %state.venue, %team, shifted = shifted.len(), "Finish undone");
        step.announce(Notice::FinishUndone {
            members: state.member_names(team),
        });
        Self::revise_placements(state, step, &before, Some(team));
        Ok(())
    }

    fn undo_forfeit(state: &mut SessionState, step: &mut Step, entrant: EntrantId) -> Result<(), String> {
        let team = state.team_of(entrant).ok_or(NOT_IN_RACE)?;
        Self::require_undoable(state)?;
        if state.teams.get(team).map(|t| t.state) != Some(TeamState::Forfeited) {
            return Err("Your team has not forfeited".to_string());
        }

        let before = state.placement_snapshot();
        if let Some(t) = state.teams.get_mut(team) {
            t.reset_outcome();
        }
        Self::resume_if_done(state, step);
        state.recompute_deltas(false);

        tracing::debug!(venue = %state.venue, %team, "Forfeit undone");
        step.announce(Notice::ForfeitUndone {
            members: state.member_names(team),
        });
        Self::revise_placements(state, step, &before, None);
        Ok(())
    }

    // ========== Completion ==========

    fn completion_elapsed(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        epoch: u64,
    ) {
        if state.completion != Some(epoch) {
            Self::stale(state, "completion", epoch);
            return;
        }
        state.completion = None;
        Self::begin_recording(state, env, step);
    }

    fn begin_recording(state: &mut SessionState, env: &RaceEnvironment, step: &mut Step) {
        let epoch = state.next_epoch();
        state.recording = Some(epoch);

        let record = state.race_record(env.clock.now());
        let results = Arc::clone(&env.results);
        let policy = env.retry.clone();
        tracing::debug!(venue = %state.venue, race = record.race_number, "Recording race");

        step.run(
            Effect::Future(Box::pin(async move {
                let outcome = retry_with_predicate(
                    &policy,
                    || results.commit(&record),
                    ResultStoreError::is_transient,
                )
                .await;
                Some(match outcome {
                    Ok(receipt) => RaceAction::RaceRecorded { epoch, receipt },
                    Err(error) => RaceAction::RecordingFailed {
                        epoch,
                        error: error.to_string(),
                    },
                })
            }))
            .cancellable(RECORDING),
        );
    }

    fn finalize(state: &mut SessionState, env: &RaceEnvironment, step: &mut Step) -> Result<(), String> {
        if state.status != SessionStatus::Done {
            return Err("There is no finished race to record".to_string());
        }
        if state.recording.is_some() {
            return Err("Results are already being recorded".to_string());
        }
        if state.completion.take().is_some() {
            step.run(Effect::Cancel(COMPLETION));
        }
        Self::begin_recording(state, env, step);
        state.last_reply = Some("Recording results".to_string());
        Ok(())
    }

    fn race_recorded(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        epoch: u64,
        receipt: &CommitReceipt,
    ) {
        if state.recording != Some(epoch) {
            Self::stale(state, "recording", epoch);
            return;
        }
        state.recording = None;
        state.apply_receipt(receipt);

        tracing::info!(venue = %state.venue, race = receipt.race_number, "Race recorded");
        race_metrics::record_race_recorded();
        step.announce(Notice::Recorded {
            race: state.race_number,
        });

        if state.pending_clear {
            Self::clear(state, env, step);
        } else {
            Self::advance(state, env, step);
        }
    }

    fn recording_failed(state: &mut SessionState, step: &mut Step, epoch: u64, error: String) {
        if state.recording != Some(epoch) {
            Self::stale(state, "recording", epoch);
            return;
        }
        state.recording = None;
        state.pending_clear = false;

        tracing::warn!(venue = %state.venue, race = state.race_number, %error, "Recording failed");
        race_metrics::record_recording_failed();
        step.announce(Notice::RecordingFailed {
            race: state.race_number,
            error,
        });
    }

    /// Move past a done race
    fn advance(state: &mut SessionState, env: &RaceEnvironment, step: &mut Step) {
        match state.config.mode {
            RaceMode::FullGame => {
                Self::release_all(state, env);
                let next = state.fresh(state.race_number + 1);
                *state = next;
            },
            RaceMode::Series => {
                state.reset_for_next_race();
                Self::rotate_picker(state, step);
            },
        }
        tracing::debug!(venue = %state.venue, race = state.race_number, "Advanced to next race");
    }

    fn rotate_picker(state: &mut SessionState, step: &mut Step) {
        if !state.config.picker_rotation {
            return;
        }
        let Some((picker, entrant)) = state
            .entrants
            .iter_mut()
            .min_by_key(|(id, e)| (e.picks, **id))
        else {
            return;
        };
        entrant.picks += 1;
        let (picker, name) = (*picker, entrant.name.clone());
        state.next_picker = Some(picker);
        step.announce(Notice::NextPicker {
            entrant: picker,
            name,
        });
    }

    // ========== Administration ==========

    fn release_all(state: &SessionState, env: &RaceEnvironment) {
        for entrant in state.entrants.keys() {
            env.directory.release(*entrant, state.venue);
        }
    }

    fn admin_clear(
        state: &mut SessionState,
        env: &RaceEnvironment,
        step: &mut Step,
        persist_first: bool,
    ) {
        if persist_first && state.fault.is_none() && state.status == SessionStatus::Done {
            state.pending_clear = true;
            if state.recording.is_none() {
                if state.completion.take().is_some() {
                    step.run(Effect::Cancel(COMPLETION));
                }
                Self::begin_recording(state, env, step);
            }
            state.last_reply = Some("Recording results before clearing".to_string());
            return;
        }

        step.run(Effect::Cancel(COUNTDOWN));
        step.run(Effect::Cancel(COMPLETION));
        step.run(Effect::Cancel(RECORDING));
        Self::clear(state, env, step);
    }

    /// Replace the session with an empty one
    ///
    /// A race that started keeps its number even when nothing was recorded,
    /// so notices of the discarded race never collide with the next one.
    fn clear(state: &mut SessionState, env: &RaceEnvironment, step: &mut Step) {
        Self::release_all(state, env);
        let race_number = if state.start_time.is_some() {
            state.race_number + 1
        } else {
            state.race_number
        };
        let next = state.fresh(race_number);
        *state = next;

        tracing::info!(venue = %state.venue, "Session cleared");
        step.announce(Notice::Cleared);
    }
}

impl Reducer for RaceReducer {
    type State = SessionState;
    type Action = RaceAction;
    type Environment = RaceEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        state.last_reply = None;

        if let Some(fault) = &state.fault {
            if !matches!(action, RaceAction::AdminClear { .. }) {
                state.last_reply = Some(format!(
                    "This race is halted ({fault}); an administrator must clear it"
                ));
                return SmallVec::new();
            }
        }

        let mut step = Step::default();
        Self::apply(state, action, env, &mut step);

        if state.fault.is_none() {
            if let Err(detail) = state.check_invariants() {
                tracing::error!(venue = %state.venue, %detail, "Session invariant violated");
                race_metrics::record_session_fault();
                state.fault = Some(detail);
            }
        }

        step.into_effects(state, &env.notices)
    }
}
