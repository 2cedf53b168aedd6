//! Error types of the race engine.

use crate::config::ConfigError;
use crate::results::ResultStoreError;
use crate::types::VenueId;
use racetrack_runtime::StoreError;
use thiserror::Error;

/// Errors returned by the session registry
///
/// Rejected commands are not errors: they succeed with a reply explaining why
/// nothing happened.
#[derive(Error, Debug)]
pub enum RaceError {
    /// No session is open at the venue
    #[error("No race session at {0}")]
    UnknownVenue(VenueId),

    /// A session is already open at the venue
    #[error("A race session is already open at {0}")]
    VenueExists(VenueId),

    /// The session detected an inconsistency and halted
    ///
    /// Every command except an admin clear is refused until the session is
    /// cleared.
    #[error("Race session at {venue} is halted: {detail}")]
    Invariant {
        /// Halted venue
        venue: VenueId,
        /// Violated invariant
        detail: String,
    },

    /// The venue's store rejected the action
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Result store failure while loading ratings or stats
    #[error("Result store error: {0}")]
    Results(#[from] ResultStoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
