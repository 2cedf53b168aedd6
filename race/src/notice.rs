//! Outgoing notices and the delivery seam.
//!
//! The reducer decides *when* something is announced or an earlier notice is
//! revised; an [`Announcer`] decides *how* it reaches people. Notices that may
//! later be revised carry a [`NoticeKey`] so the announcer can find the
//! message it delivered.

use crate::types::{EntrantId, LevelId, TeamKey, VenueId};
use async_trait::async_trait;
use chrono::TimeDelta;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// Stable handle of a revisable notice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NoticeKey {
    /// A team's placement in one race
    Placement {
        /// Race number within the venue
        race: u64,
        /// Team handle
        team: TeamKey,
    },
    /// Final standings of one race
    Standings {
        /// Race number within the venue
        race: u64,
    },
}

/// One line of the standings table
#[derive(Clone, Debug, PartialEq)]
pub struct StandingsRow {
    /// Display names of the members
    pub members: Vec<String>,
    /// Team name, if any
    pub team_name: Option<String>,
    /// Place, `None` for forfeits
    pub place: Option<u32>,
    /// Elapsed time, `None` for forfeits
    pub time: Option<TimeDelta>,
    /// Per-member rating change
    pub rating_delta: Option<f64>,
}

/// Something the session wants people in the venue to see
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// An entrant joined
    Joined {
        /// Display name
        name: String,
    },
    /// An entrant left
    Left {
        /// Display name
        name: String,
    },
    /// Teams changed (merge, split, randomize, rename)
    TeamsChanged {
        /// Member names of every team, in order
        teams: Vec<Vec<String>>,
    },
    /// Everyone is ready
    CountdownStarted {
        /// Race number
        race: u64,
        /// Countdown length
        seconds: u64,
    },
    /// Seconds remaining before the start
    CountdownTick {
        /// Seconds left
        remaining: u64,
    },
    /// The countdown was interrupted
    CountdownAborted,
    /// The race clock started
    Started {
        /// Race number
        race: u64,
    },
    /// A team's finishing place, revised when late reports reorder the field
    Placement {
        /// Race number
        race: u64,
        /// Team handle
        team: TeamKey,
        /// Row content
        row: StandingsRow,
    },
    /// A team gave up
    Forfeited {
        /// Member names
        members: Vec<String>,
    },
    /// A finish was withdrawn
    FinishUndone {
        /// Member names
        members: Vec<String>,
    },
    /// A forfeit was withdrawn
    ForfeitUndone {
        /// Member names
        members: Vec<String>,
    },
    /// The race went from done back to running
    Resumed,
    /// Every team is done
    Standings {
        /// Race number
        race: u64,
        /// Rows sorted by place, forfeits last
        rows: Vec<StandingsRow>,
    },
    /// Results are stored
    Recorded {
        /// Race number
        race: u64,
    },
    /// Every team forfeited; the race is recorded with no rating change
    Abandoned {
        /// Race number
        race: u64,
    },
    /// Results could not be stored; the session waits for a retry
    RecordingFailed {
        /// Race number
        race: u64,
        /// Error text
        error: String,
    },
    /// Series mode: who picks the next level
    NextPicker {
        /// Picker identity
        entrant: EntrantId,
        /// Display name
        name: String,
    },
    /// The level for the next race
    LevelSet {
        /// Chosen level
        level: LevelId,
    },
    /// The session was cleared by an administrator
    Cleared,
}

impl Notice {
    /// Revision handle, for notices that can be revised
    #[must_use]
    pub const fn key(&self) -> Option<NoticeKey> {
        match self {
            Self::Placement { race, team, .. } => Some(NoticeKey::Placement {
                race: *race,
                team: *team,
            }),
            Self::Standings { race, .. } => Some(NoticeKey::Standings { race: *race }),
            _ => None,
        }
    }
}

fn format_time(time: TimeDelta) -> String {
    let total = time.num_milliseconds().max(0);
    let (secs, millis) = (total / 1000, total % 1000);
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}.{millis:03}")
    } else {
        format!("{m}:{s:02}.{millis:03}")
    }
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, r) if r != 11 => "st",
        (2, r) if r != 12 => "nd",
        (3, r) if r != 13 => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

impl fmt::Display for StandingsRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = self
            .team_name
            .clone()
            .unwrap_or_else(|| self.members.join(" & "));
        match (self.place, self.time) {
            (Some(place), Some(time)) => {
                write!(f, "{}: {who} ({})", ordinal(place), format_time(time))?;
            },
            _ => write!(f, "forfeit: {who}")?,
        }
        if let Some(delta) = self.rating_delta {
            write!(f, " [{delta:+.1}]")?;
        }
        Ok(())
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined { name } => write!(f, "{name} joined the race"),
            Self::Left { name } => write!(f, "{name} left the race"),
            Self::TeamsChanged { teams } => {
                let rendered: Vec<String> = teams.iter().map(|t| t.join(" & ")).collect();
                write!(f, "Teams: {}", rendered.join(" | "))
            },
            Self::CountdownStarted { race, seconds } => {
                write!(f, "Race {race} starts in {seconds} seconds")
            },
            Self::CountdownTick { remaining } => write!(f, "{remaining}..."),
            Self::CountdownAborted => f.write_str("Countdown aborted"),
            Self::Started { race } => write!(f, "Race {race}: go!"),
            Self::Placement { row, .. } => write!(f, "{row}"),
            Self::Forfeited { members } => write!(f, "{} forfeited", members.join(" & ")),
            Self::FinishUndone { members } => {
                write!(f, "{} are back in the race", members.join(" & "))
            },
            Self::ForfeitUndone { members } => {
                write!(f, "{} un-forfeited", members.join(" & "))
            },
            Self::Resumed => f.write_str("The race is running again"),
            Self::Standings { race, rows } => {
                write!(f, "Race {race} results:")?;
                for row in rows {
                    write!(f, "\n  {row}")?;
                }
                Ok(())
            },
            Self::Recorded { race } => write!(f, "Race {race} recorded"),
            Self::Abandoned { race } => write!(f, "Race {race}: everyone forfeited"),
            Self::RecordingFailed { race, error } => write!(
                f,
                "Race {race} could not be recorded ({error}); finalize to retry"
            ),
            Self::NextPicker { name, .. } => write!(f, "{name} picks the next level"),
            Self::LevelSet { level } => write!(f, "Next level: {level}"),
            Self::Cleared => f.write_str("The race was cleared"),
        }
    }
}

/// Delivers notices to a venue
///
/// Delivery problems are the announcer's own concern; the session never
/// waits on or reacts to them.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Deliver a new notice
    async fn announce(&self, venue: VenueId, notice: Notice);

    /// Replace the content of the notice previously delivered under `key`
    async fn revise(&self, venue: VenueId, key: NoticeKey, notice: Notice);
}

/// A pending delivery produced by one reduce
#[derive(Clone, Debug, PartialEq)]
pub enum Outgoing {
    /// New notice
    Announce(Notice),
    /// Revision of a keyed notice
    Revise(NoticeKey, Notice),
}

/// Deliver `batch` in order
pub async fn deliver(announcer: &dyn Announcer, venue: VenueId, batch: Vec<Outgoing>) {
    for item in batch {
        match item {
            Outgoing::Announce(notice) => announcer.announce(venue, notice).await,
            Outgoing::Revise(key, notice) => announcer.revise(venue, key, notice).await,
        }
    }
}

#[derive(Debug)]
enum Delivery {
    Batch(VenueId, Vec<Outgoing>),
    Flush(oneshot::Sender<()>),
}

/// Ordered notice delivery
///
/// Batches posted for a venue reach the [`Announcer`] in the order they were
/// posted, one at a time. Every venue has its own delivery task, so a slow
/// announcement at one venue never holds up another.
///
/// Posting never blocks. Delivery tasks need a Tokio runtime: an outbox
/// created outside one drops what is posted to it.
#[derive(Clone, Debug)]
pub struct NoticeOutbox {
    tx: Option<mpsc::UnboundedSender<Delivery>>,
}

impl NoticeOutbox {
    /// Start routing notices to `announcer`
    #[must_use]
    pub fn new(announcer: Arc<dyn Announcer>) -> Self {
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!("No Tokio runtime, notices will be dropped");
            return Self { tx: None };
        };
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(route(announcer, rx));
        Self { tx: Some(tx) }
    }

    /// Queue `batch` behind everything already posted for `venue`
    pub fn post(&self, venue: VenueId, batch: Vec<Outgoing>) {
        if batch.is_empty() {
            return;
        }
        let Some(tx) = &self.tx else {
            tracing::trace!(%venue, notices = batch.len(), "Dropping notices");
            return;
        };
        if tx.send(Delivery::Batch(venue, batch)).is_err() {
            tracing::warn!(%venue, "Notice delivery has stopped");
        }
    }

    /// Wait until everything posted so far has been delivered
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done, delivered) = oneshot::channel();
        if tx.send(Delivery::Flush(done)).is_ok() {
            let _ = delivered.await;
        }
    }
}

/// Hand each batch to its venue's lane
async fn route(announcer: Arc<dyn Announcer>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    let mut lanes: HashMap<VenueId, mpsc::UnboundedSender<Delivery>> = HashMap::new();
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Batch(venue, batch) => {
                let lane = lanes.entry(venue).or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(run_lane(Arc::clone(&announcer), venue, rx));
                    tx
                });
                if lane.send(Delivery::Batch(venue, batch)).is_err() {
                    tracing::warn!(%venue, "Notice lane has stopped");
                }
            },
            Delivery::Flush(done) => {
                let pending: Vec<oneshot::Receiver<()>> = lanes
                    .values()
                    .filter_map(|lane| {
                        let (tx, rx) = oneshot::channel();
                        lane.send(Delivery::Flush(tx)).ok().map(|()| rx)
                    })
                    .collect();
                tokio::spawn(async move {
                    for lane in pending {
                        let _ = lane.await;
                    }
                    let _ = done.send(());
                });
            },
        }
    }
}

async fn run_lane(
    announcer: Arc<dyn Announcer>,
    venue: VenueId,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Batch(_, batch) => deliver(announcer.as_ref(), venue, batch).await,
            Delivery::Flush(done) => {
                let _ = done.send(());
            },
        }
    }
}

/// Announcer that writes notices to the `tracing` log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce(&self, venue: VenueId, notice: Notice) {
        tracing::info!(%venue, key = ?notice.key(), "{notice}");
    }

    async fn revise(&self, venue: VenueId, key: NoticeKey, notice: Notice) {
        tracing::info!(%venue, ?key, "(revised) {notice}");
    }
}
