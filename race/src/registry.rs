//! Venue → session lookup and the command surface.
//!
//! Each venue's session lives in its own [`Store`], so commands for one venue
//! serialize while different venues run concurrently. Every command is sent
//! with [`Store::send_and_read`], which reads the reply produced by exactly
//! that command.

use crate::action::RaceAction;
use crate::config::RaceConfig;
use crate::error::RaceError;
use crate::reducer::{RaceEnvironment, RaceReducer};
use crate::results::EntrantStats;
use crate::session::SessionState;
use crate::types::{CategoryId, EntrantId, LevelId, VenueId};
use chrono::{DateTime, Utc};
use racetrack_runtime::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Store owning one venue's session
pub type SessionStore = Store<SessionState, RaceAction, RaceEnvironment, RaceReducer>;

/// Reply text of an accepted or rejected command
pub type Reply = Option<String>;

/// Every open venue session
pub struct SessionRegistry {
    config: Arc<RaceConfig>,
    env: RaceEnvironment,
    sessions: RwLock<HashMap<VenueId, SessionStore>>,
}

impl SessionRegistry {
    /// Registry with no open venues
    #[must_use]
    pub fn new(config: RaceConfig, env: RaceEnvironment) -> Self {
        Self {
            config: Arc::new(config),
            env,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session for `category` at `venue`
    ///
    /// The race number continues from the venue's recorded races.
    ///
    /// # Errors
    ///
    /// [`RaceError::VenueExists`] if the venue already has a session, or
    /// [`RaceError::Results`] if the race number cannot be read.
    pub async fn open(&self, venue: VenueId, category: CategoryId) -> Result<(), RaceError> {
        if self.sessions.read().await.contains_key(&venue) {
            return Err(RaceError::VenueExists(venue));
        }
        let race_number = self.env.results.next_race_number(venue).await?;
        let config = Arc::new(self.config.category(&category));

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&venue) {
            return Err(RaceError::VenueExists(venue));
        }
        tracing::info!(%venue, %category, race_number, "Opening race session");
        sessions.insert(
            venue,
            Store::new(
                SessionState::new(venue, category, config, race_number),
                RaceReducer::new(),
                self.env.clone(),
            ),
        );
        Ok(())
    }

    /// Clear and close the session at `venue`
    ///
    /// Unrecorded results are discarded.
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`], or [`RaceError::Store`] if pending
    /// effects outlive the shutdown timeout.
    pub async fn close(&self, venue: VenueId) -> Result<(), RaceError> {
        let store = self
            .sessions
            .write()
            .await
            .remove(&venue)
            .ok_or(RaceError::UnknownVenue(venue))?;
        store
            .send(RaceAction::AdminClear {
                persist_first: false,
            })
            .await?;
        store.shutdown(self.config.shutdown_timeout).await?;
        self.flush_notices().await;
        tracing::info!(%venue, "Closed race session");
        Ok(())
    }

    /// Wait until every notice produced so far has been delivered
    pub async fn flush_notices(&self) {
        self.env.notices.flush().await;
    }

    /// Close every session
    ///
    /// # Errors
    ///
    /// The first error of any venue; every venue is still attempted.
    pub async fn shutdown(&self) -> Result<(), RaceError> {
        let venues: Vec<VenueId> = self.sessions.read().await.keys().copied().collect();
        let mut first = None;
        for venue in venues {
            if let Err(error) = self.close(venue).await {
                tracing::error!(%venue, %error, "Failed to close race session");
                first.get_or_insert(error);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Store of the session at `venue`
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`].
    pub async fn store(&self, venue: VenueId) -> Result<SessionStore, RaceError> {
        self.sessions
            .read()
            .await
            .get(&venue)
            .cloned()
            .ok_or(RaceError::UnknownVenue(venue))
    }

    /// Read the session at `venue`
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`].
    pub async fn session<F, T>(&self, venue: VenueId, f: F) -> Result<T, RaceError>
    where
        F: FnOnce(&SessionState) -> T,
    {
        Ok(self.store(venue).await?.state(f).await)
    }

    async fn dispatch(&self, venue: VenueId, action: RaceAction) -> Result<Reply, RaceError> {
        let store = self.store(venue).await?;
        let (_, (reply, fault)) = store
            .send_and_read(action, |s| (s.last_reply.clone(), s.fault.clone()))
            .await?;
        match fault {
            Some(detail) => Err(RaceError::Invariant { venue, detail }),
            None => Ok(reply),
        }
    }

    // ========== Commands ==========

    /// Join the race at `venue` with the entrant's stored rating
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`], [`RaceError::Results`] if the rating
    /// cannot be read, or [`RaceError::Invariant`].
    pub async fn join(
        &self,
        venue: VenueId,
        entrant: EntrantId,
        name: impl Into<String>,
    ) -> Result<Reply, RaceError> {
        let category = self.session(venue, |s| s.category.clone()).await?;
        let rating = self.env.results.rating(entrant, &category).await?;
        self.dispatch(
            venue,
            RaceAction::Join {
                entrant,
                name: name.into(),
                rating,
            },
        )
        .await
    }

    /// Leave before the race starts
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn leave(&self, venue: VenueId, entrant: EntrantId) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::Leave { entrant }).await
    }

    /// Mark ready or not ready
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn set_ready(
        &self,
        venue: VenueId,
        entrant: EntrantId,
        ready: bool,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::SetReady { entrant, ready })
            .await
    }

    /// Report a finish stamped now
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn report_finish(
        &self,
        venue: VenueId,
        entrant: EntrantId,
    ) -> Result<Reply, RaceError> {
        let at = self.env.clock.now();
        self.report_finish_at(venue, entrant, at).await
    }

    /// Report a finish stamped at `at`
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn report_finish_at(
        &self,
        venue: VenueId,
        entrant: EntrantId,
        at: DateTime<Utc>,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::ReportFinish { entrant, at })
            .await
    }

    /// Forfeit the entrant's team
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn report_forfeit(
        &self,
        venue: VenueId,
        entrant: EntrantId,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::ReportForfeit { entrant })
            .await
    }

    /// Withdraw the team's finish
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn undo_finish(&self, venue: VenueId, entrant: EntrantId) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::UndoFinish { entrant })
            .await
    }

    /// Withdraw the team's forfeit
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn undo_forfeit(
        &self,
        venue: VenueId,
        entrant: EntrantId,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::UndoForfeit { entrant })
            .await
    }

    /// Merge the partner's team into the entrant's team
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn team_with(
        &self,
        venue: VenueId,
        entrant: EntrantId,
        partner: EntrantId,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::TeamWith { entrant, partner })
            .await
    }

    /// Move the entrant to a new solo team
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn unteam(&self, venue: VenueId, entrant: EntrantId) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::Unteam { entrant }).await
    }

    /// Shuffle everyone into teams of `group_size`
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn randomize_teams(
        &self,
        venue: VenueId,
        group_size: usize,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::RandomizeTeams { group_size })
            .await
    }

    /// Name the entrant's co-op team
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn rename_team(
        &self,
        venue: VenueId,
        entrant: EntrantId,
        name: impl Into<String>,
    ) -> Result<Reply, RaceError> {
        self.dispatch(
            venue,
            RaceAction::RenameTeam {
                entrant,
                name: name.into(),
            },
        )
        .await
    }

    /// Choose the next series level
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn set_level(
        &self,
        venue: VenueId,
        entrant: EntrantId,
        level: LevelId,
    ) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::SetLevel { entrant, level })
            .await
    }

    /// Record a done race now, or retry a failed recording
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`] or [`RaceError::Invariant`].
    pub async fn finalize(&self, venue: VenueId) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::Finalize).await
    }

    /// Reset the venue to an empty session
    ///
    /// Also lifts a halt caused by an invariant violation.
    ///
    /// # Errors
    ///
    /// [`RaceError::UnknownVenue`].
    pub async fn admin_clear(&self, venue: VenueId, persist_first: bool) -> Result<Reply, RaceError> {
        self.dispatch(venue, RaceAction::AdminClear { persist_first })
            .await
    }

    // ========== Reads ==========

    /// Highest-rated entrants of `category`
    ///
    /// # Errors
    ///
    /// [`RaceError::Results`].
    pub async fn leaderboard(
        &self,
        category: &CategoryId,
        limit: usize,
    ) -> Result<Vec<EntrantStats>, RaceError> {
        Ok(self.env.results.leaderboard(category, limit).await?)
    }

    /// Cumulative stats of `entrant` in `category`
    ///
    /// # Errors
    ///
    /// [`RaceError::Results`].
    pub async fn stats(
        &self,
        entrant: EntrantId,
        category: &CategoryId,
    ) -> Result<Option<EntrantStats>, RaceError> {
        Ok(self.env.results.stats(entrant, category).await?)
    }
}
