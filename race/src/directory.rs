//! Which venue each entrant is racing at.
//!
//! An entrant may race at one venue at a time. Sessions claim an entrant when
//! they join and release it when they leave or the session is replaced.

use crate::types::{EntrantId, VenueId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Cross-venue membership lookup
///
/// Calls are synchronous so a session can claim an entrant inside its
/// reducer, atomically with adding it to a team.
pub trait EntrantDirectory: Send + Sync {
    /// Claim `entrant` for `venue`
    ///
    /// # Errors
    ///
    /// Returns the venue the entrant is already racing at, if it is not `venue`.
    fn claim(&self, entrant: EntrantId, venue: VenueId) -> Result<(), VenueId>;

    /// Release `entrant`, if it is held by `venue`
    fn release(&self, entrant: EntrantId, venue: VenueId);

    /// Venue currently holding `entrant`
    fn venue_of(&self, entrant: EntrantId) -> Option<VenueId>;
}

/// Process-wide directory shared by every session
#[derive(Debug, Default)]
pub struct SharedDirectory {
    claims: Mutex<HashMap<EntrantId, VenueId>>,
}

impl SharedDirectory {
    /// Empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntrantDirectory for SharedDirectory {
    fn claim(&self, entrant: EntrantId, venue: VenueId) -> Result<(), VenueId> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(&entrant) {
            Some(held) if *held != venue => Err(*held),
            _ => {
                claims.insert(entrant, venue);
                Ok(())
            },
        }
    }

    fn release(&self, entrant: EntrantId, venue: VenueId) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if claims.get(&entrant) == Some(&venue) {
            claims.remove(&entrant);
        }
    }

    fn venue_of(&self, entrant: EntrantId) -> Option<VenueId> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entrant)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entrant_races_at_one_venue() {
        let directory = SharedDirectory::new();
        let (ana, here, there) = (EntrantId(1), VenueId(10), VenueId(20));

        assert_eq!(directory.claim(ana, here), Ok(()));
        assert_eq!(directory.claim(ana, here), Ok(()));
        assert_eq!(directory.claim(ana, there), Err(here));

        directory.release(ana, there);
        assert_eq!(directory.venue_of(ana), Some(here));

        directory.release(ana, here);
        assert_eq!(directory.claim(ana, there), Ok(()));
    }
}
