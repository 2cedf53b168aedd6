//! In-process test doubles for the race environment.

use crate::notice::{Announcer, Notice, NoticeKey, Outgoing};
use crate::types::VenueId;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

/// Announcer that keeps every delivery in order
///
/// Clones share the same log, so a test can keep one handle and give another
/// to the environment.
#[derive(Debug, Clone, Default)]
pub struct RecordingAnnouncer {
    log: Arc<Mutex<Vec<(VenueId, Outgoing)>>>,
}

impl RecordingAnnouncer {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery so far
    #[must_use]
    pub fn deliveries(&self) -> Vec<(VenueId, Outgoing)> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// New notices delivered to `venue`
    #[must_use]
    pub fn announced(&self, venue: VenueId) -> Vec<Notice> {
        self.deliveries()
            .into_iter()
            .filter_map(|(v, out)| match out {
                Outgoing::Announce(notice) if v == venue => Some(notice),
                _ => None,
            })
            .collect()
    }

    /// Revisions delivered to `venue`
    #[must_use]
    pub fn revisions(&self, venue: VenueId) -> Vec<(NoticeKey, Notice)> {
        self.deliveries()
            .into_iter()
            .filter_map(|(v, out)| match out {
                Outgoing::Revise(key, notice) if v == venue => Some((key, notice)),
                _ => None,
            })
            .collect()
    }

    /// Latest content under `key`: the last revision, or the original notice
    #[must_use]
    pub fn current(&self, venue: VenueId, key: &NoticeKey) -> Option<Notice> {
        self.deliveries()
            .into_iter()
            .filter(|(v, _)| *v == venue)
            .filter_map(|(_, out)| match out {
                Outgoing::Announce(notice) if notice.key().as_ref() == Some(key) => Some(notice),
                Outgoing::Revise(k, notice) if k == *key => Some(notice),
                _ => None,
            })
            .last()
    }

    /// Forget everything delivered so far
    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn push(&self, venue: VenueId, out: Outgoing) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((venue, out));
    }
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn announce(&self, venue: VenueId, notice: Notice) {
        self.push(venue, Outgoing::Announce(notice));
    }

    async fn revise(&self, venue: VenueId, key: NoticeKey, notice: Notice) {
        self.push(venue, Outgoing::Revise(key, notice));
    }
}
