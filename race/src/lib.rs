//! Race lifecycle engine.
//!
//! Entrants join a venue's session, organize into teams, ready up, and a
//! countdown starts the race. Finishes and forfeits may be reported out of
//! order; places and Elo-style rating deltas are corrected as reports arrive
//! and the earlier placement notices are revised. Once every team is done the
//! results are committed to a [`ResultStore`] in one transaction.
//!
//! # Architecture
//!
//! 1. **Commands** enter through the [`SessionRegistry`], one [`Store`] per venue
//! 2. **`RaceReducer`** validates them against the [`SessionState`] and mutates it
//! 3. **Effects** arm cancellable countdown and banking timers and commit
//!    results; notices queue on a per-venue [`NoticeOutbox`] in reduce order
//! 4. **Feedback actions** from timers and commits carry a token; stale ones
//!    are ignored
//!
//! # Example Usage
//!
//! ```no_run
//! use racetrack::{
//!     LogAnnouncer, MemoryResultStore, RaceConfig, RaceEnvironment, SessionRegistry,
//!     SharedDirectory,
//! };
//! use racetrack::types::{CategoryId, EntrantId, VenueId};
//! use racetrack_core::environment::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let env = RaceEnvironment::new(
//!     Arc::new(SystemClock),
//!     Arc::new(LogAnnouncer),
//!     Arc::new(MemoryResultStore::new()),
//!     Arc::new(SharedDirectory::new()),
//! );
//! let registry = SessionRegistry::new(RaceConfig::from_env()?, env);
//!
//! let venue = VenueId(1);
//! registry.open(venue, CategoryId::new("any%")).await?;
//! registry.join(venue, EntrantId(7), "ana").await?;
//! registry.join(venue, EntrantId(8), "bo").await?;
//! registry.set_ready(venue, EntrantId(7), true).await?;
//! registry.set_ready(venue, EntrantId(8), true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Store`]: racetrack_runtime::Store

pub mod action;
pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod mocks;
pub mod notice;
pub mod rating;
pub mod reducer;
pub mod registry;
pub mod results;
pub mod session;
pub mod team;
pub mod types;

// Re-export commonly used types
pub use action::RaceAction;
pub use config::{CategoryConfig, ConfigError, EloConfig, RaceConfig, ScoreAggregation};
pub use directory::{EntrantDirectory, SharedDirectory};
pub use error::RaceError;
pub use notice::{Announcer, LogAnnouncer, Notice, NoticeKey, NoticeOutbox, StandingsRow};
pub use reducer::{RaceEnvironment, RaceReducer, COMPLETION, COUNTDOWN, RECORDING};
pub use registry::{Reply, SessionRegistry, SessionStore};
pub use results::{
    CommitReceipt, EntrantStats, MemoryResultStore, PgResultStore, RaceRecord, ResultStore,
    ResultStoreError,
};
pub use session::SessionState;
pub use types::{EntrantId, RaceMode, SessionStatus, TeamState, VenueId};
