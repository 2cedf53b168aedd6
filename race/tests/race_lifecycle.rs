//! End-to-end race lifecycle through the registry and the venue stores.
//!
//! Time is paused, so countdown and banking timers fire as soon as every
//! task is idle and the clock is advanced past them.

#![allow(clippy::unwrap_used, clippy::panic, clippy::float_cmp)]

use async_trait::async_trait;
use chrono::TimeDelta;
use racetrack::mocks::RecordingAnnouncer;
use racetrack::types::{CategoryId, EntrantId, SessionStatus, TeamState, VenueId};
use racetrack::{
    Announcer, MemoryResultStore, Notice, NoticeKey, RaceConfig, RaceEnvironment, ResultStore,
    SessionRegistry, SharedDirectory, COMPLETION, COUNTDOWN,
};
use racetrack_core::environment::Clock;
use racetrack_runtime::retry::RetryPolicy;
use racetrack_testing::{epoch, init_test_tracing, test_clock, ManualClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const VENUE: VenueId = VenueId(1);
const A: EntrantId = EntrantId(1);
const B: EntrantId = EntrantId(2);
const C: EntrantId = EntrantId(3);

struct Harness {
    registry: SessionRegistry,
    announcer: RecordingAnnouncer,
    results: Arc<MemoryResultStore>,
}

/// Holds back its first placement notice while later notices go out
struct SlowFirstPlacement {
    inner: RecordingAnnouncer,
    delayed: AtomicBool,
}

#[async_trait]
impl Announcer for SlowFirstPlacement {
    async fn announce(&self, venue: VenueId, notice: Notice) {
        if matches!(notice, Notice::Placement { .. }) && !self.delayed.swap(true, Ordering::SeqCst)
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.announce(venue, notice).await;
    }

    async fn revise(&self, venue: VenueId, key: NoticeKey, notice: Notice) {
        self.inner.revise(venue, key, notice).await;
    }
}

async fn harness() -> Harness {
    let announcer = RecordingAnnouncer::new();
    harness_with(Arc::new(test_clock()), announcer.clone(), Arc::new(announcer)).await
}

async fn harness_with(
    clock: Arc<dyn Clock>,
    announcer: RecordingAnnouncer,
    delivery: Arc<dyn Announcer>,
) -> Harness {
    init_test_tracing();
    let results = Arc::new(MemoryResultStore::new());
    let env = RaceEnvironment::new(
        clock,
        delivery,
        Arc::clone(&results) as Arc<dyn ResultStore>,
        Arc::new(SharedDirectory::new()),
    )
    .with_seed(1)
    .with_retry(RetryPolicy::none());

    let registry = SessionRegistry::new(RaceConfig::from_lookup(|_| None).unwrap(), env);
    registry.open(VENUE, CategoryId::new("any%")).await.unwrap();

    Harness {
        registry,
        announcer,
        results,
    }
}

/// Let spawned effects run without reaching any timer
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn started(h: &Harness, entrants: &[EntrantId]) {
    for entrant in entrants {
        h.registry
            .join(VENUE, *entrant, format!("r{}", entrant.0))
            .await
            .unwrap();
    }
    for entrant in entrants {
        h.registry.set_ready(VENUE, *entrant, true).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(status(h).await, SessionStatus::Active);
}

async fn finish(h: &Harness, entrant: EntrantId, secs: i64) {
    h.registry
        .report_finish_at(VENUE, entrant, epoch() + TimeDelta::seconds(secs))
        .await
        .unwrap();
}

async fn status(h: &Harness) -> SessionStatus {
    h.registry.session(VENUE, |s| s.status).await.unwrap()
}

async fn place(h: &Harness, entrant: EntrantId) -> Option<u32> {
    h.registry
        .session(VENUE, |s| {
            s.team_of(entrant)
                .and_then(|k| s.teams.get(k))
                .and_then(|t| t.place)
        })
        .await
        .unwrap()
}

async fn placement_key(h: &Harness, entrant: EntrantId) -> NoticeKey {
    h.registry
        .session(VENUE, |s| NoticeKey::Placement {
            race: s.race_number,
            team: s.team_of(entrant).unwrap(),
        })
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn countdown_cancels_cleanly() {
    let h = harness().await;
    let store = h.registry.store(VENUE).await.unwrap();

    h.registry.join(VENUE, A, "ana").await.unwrap();
    h.registry.join(VENUE, B, "bo").await.unwrap();
    h.registry.set_ready(VENUE, A, true).await.unwrap();
    h.registry.set_ready(VENUE, B, true).await.unwrap();
    assert_eq!(status(&h).await, SessionStatus::Countdown);
    assert_eq!(store.live_effects(&COUNTDOWN), 1);

    tokio::time::sleep(Duration::from_millis(6_500)).await;
    h.registry.set_ready(VENUE, B, false).await.unwrap();
    assert_eq!(store.live_effects(&COUNTDOWN), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(status(&h).await, SessionStatus::Joining);

    let notices = h.announcer.announced(VENUE);
    assert!(notices.contains(&Notice::CountdownTick { remaining: 4 }));
    assert!(!notices.contains(&Notice::CountdownTick { remaining: 1 }));
    assert!(notices.contains(&Notice::CountdownAborted));
    assert!(!notices.iter().any(|n| matches!(n, Notice::Started { .. })));
}

#[tokio::test(start_paused = true)]
async fn late_report_revises_earlier_placement() {
    let h = harness().await;
    started(&h, &[A, B, C]).await;

    finish(&h, A, 30).await;
    finish(&h, B, 25).await;
    finish(&h, C, 40).await;
    settle().await;

    assert_eq!(place(&h, B).await, Some(1));
    assert_eq!(place(&h, A).await, Some(2));
    assert_eq!(place(&h, C).await, Some(3));

    let key = placement_key(&h, A).await;
    assert!(h.announcer.revisions(VENUE).iter().any(|(k, _)| *k == key));
    match h.announcer.current(VENUE, &key) {
        Some(Notice::Placement { row, .. }) => assert_eq!(row.place, Some(2)),
        other => panic!("unexpected notice {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn ties_share_a_place() {
    let h = harness().await;
    started(&h, &[A, B, C]).await;

    finish(&h, A, 20).await;
    finish(&h, C, 30).await;
    finish(&h, B, 20).await;

    assert_eq!(place(&h, A).await, Some(1));
    assert_eq!(place(&h, B).await, Some(1));
    assert_eq!(place(&h, C).await, Some(3));
}

#[tokio::test(start_paused = true)]
async fn finish_then_undo_restores_other_teams() {
    let h = harness().await;
    started(&h, &[A, B, C]).await;
    finish(&h, A, 30).await;

    let snapshot = || h.registry.session(VENUE, |s| s.placement_snapshot());
    let before = snapshot().await.unwrap();

    finish(&h, B, 25).await;
    assert_eq!(place(&h, A).await, Some(2));
    h.registry.undo_finish(VENUE, B).await.unwrap();

    assert_eq!(snapshot().await.unwrap(), before);
    assert_eq!(place(&h, B).await, None);
}

#[tokio::test(start_paused = true)]
async fn race_records_after_banking_and_advances() {
    let h = harness().await;
    started(&h, &[A, B]).await;

    finish(&h, A, 30).await;
    finish(&h, B, 45).await;
    assert_eq!(status(&h).await, SessionStatus::Done);
    assert!(h.results.races().is_empty());

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(status(&h).await, SessionStatus::NoRace);
    assert_eq!(h.registry.session(VENUE, |s| s.race_number).await.unwrap(), 2);

    let races = h.results.races();
    assert_eq!(races.len(), 1);
    let winner = races[0].teams.iter().find(|t| t.place == Some(1)).unwrap();
    let loser = races[0].teams.iter().find(|t| t.place == Some(2)).unwrap();
    assert_eq!(winner.rating_delta + loser.rating_delta, 0.0);

    let category = CategoryId::new("any%");
    let stats = h.registry.stats(A, &category).await.unwrap().unwrap();
    assert_eq!((stats.races, stats.firsts), (1, 1));
    assert_eq!(stats.rating, 1516.0);

    let board = h.registry.leaderboard(&category, 10).await.unwrap();
    assert_eq!(board.first().map(|s| s.entrant), Some(A));

    // Entrants are free to join the next race
    h.registry.join(VENUE, A, "ana").await.unwrap();
    assert_eq!(
        h.registry.session(VENUE, |s| s.entrants[&A].rating).await.unwrap(),
        1516.0
    );
}

#[tokio::test(start_paused = true)]
async fn undo_forfeit_of_last_team_resumes() {
    let h = harness().await;
    let store = h.registry.store(VENUE).await.unwrap();
    started(&h, &[A, B]).await;

    finish(&h, A, 30).await;
    h.registry.report_forfeit(VENUE, B).await.unwrap();
    assert_eq!(status(&h).await, SessionStatus::Done);
    assert_eq!(store.live_effects(&COMPLETION), 1);

    h.registry.undo_forfeit(VENUE, B).await.unwrap();
    assert_eq!(status(&h).await, SessionStatus::Active);
    assert_eq!(store.live_effects(&COMPLETION), 0);

    let (state, delta) = h
        .registry
        .session(VENUE, |s| {
            let team = s.teams.get(s.team_of(B).unwrap()).unwrap();
            (team.state, team.rating_delta)
        })
        .await
        .unwrap();
    assert_eq!(state, TeamState::NotDone);
    assert_eq!(delta, None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(status(&h).await, SessionStatus::Active);
    assert!(h.results.races().is_empty());
    settle().await;
    assert!(h.announcer.announced(VENUE).contains(&Notice::Resumed));
}

#[tokio::test(start_paused = true)]
async fn everyone_forfeiting_still_counts_the_race() {
    let h = harness().await;
    started(&h, &[A, B]).await;

    h.registry.report_forfeit(VENUE, A).await.unwrap();
    h.registry.report_forfeit(VENUE, B).await.unwrap();
    settle().await;

    assert_eq!(status(&h).await, SessionStatus::NoRace);
    assert_eq!(h.registry.session(VENUE, |s| s.race_number).await.unwrap(), 2);

    let races = h.results.races();
    assert_eq!(races.len(), 1);
    assert!(races[0].teams.iter().all(|t| t.forfeited && t.rating_delta == 0.0));

    let category = CategoryId::new("any%");
    let stats = h.registry.stats(B, &category).await.unwrap().unwrap();
    assert_eq!((stats.races, stats.forfeits, stats.firsts), (1, 1, 0));
    assert_eq!(stats.rating, 1500.0);

    h.registry.flush_notices().await;
    assert!(h
        .announcer
        .announced(VENUE)
        .contains(&Notice::Abandoned { race: 1 }));
}

#[tokio::test(start_paused = true)]
async fn undo_finish_from_done_resumes() {
    let h = harness().await;
    let store = h.registry.store(VENUE).await.unwrap();
    started(&h, &[A, B]).await;

    finish(&h, A, 30).await;
    finish(&h, B, 45).await;
    assert_eq!(status(&h).await, SessionStatus::Done);
    assert_eq!(store.live_effects(&COMPLETION), 1);

    h.registry.undo_finish(VENUE, A).await.unwrap();
    assert_eq!(status(&h).await, SessionStatus::Active);
    assert_eq!(store.live_effects(&COMPLETION), 0);
    assert_eq!(place(&h, A).await, None);
    assert_eq!(place(&h, B).await, Some(1));

    h.registry.flush_notices().await;
    let key = placement_key(&h, B).await;
    match h.announcer.current(VENUE, &key) {
        Some(Notice::Placement { row, .. }) => assert_eq!(row.place, Some(1)),
        other => panic!("unexpected notice {other:?}"),
    }
    assert!(h.announcer.announced(VENUE).contains(&Notice::Resumed));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(status(&h).await, SessionStatus::Active);
    assert!(h.results.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn revision_is_not_overtaken_by_a_slow_original() {
    let announcer = RecordingAnnouncer::new();
    let slow = SlowFirstPlacement {
        inner: announcer.clone(),
        delayed: AtomicBool::new(false),
    };
    let h = harness_with(Arc::new(test_clock()), announcer, Arc::new(slow)).await;
    started(&h, &[A, B, C]).await;

    finish(&h, A, 30).await;
    finish(&h, B, 25).await;
    h.registry.flush_notices().await;

    assert_eq!(place(&h, A).await, Some(2));
    let key = placement_key(&h, A).await;
    match h.announcer.current(VENUE, &key) {
        Some(Notice::Placement { row, .. }) => assert_eq!(row.place, Some(2)),
        other => panic!("unexpected notice {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn finish_is_stamped_by_the_environment_clock() {
    let clock = ManualClock::new(epoch());
    let announcer = RecordingAnnouncer::new();
    let h = harness_with(Arc::new(clock.clone()), announcer.clone(), Arc::new(announcer)).await;
    started(&h, &[A, B]).await;

    clock.advance(TimeDelta::milliseconds(42_500));
    h.registry.report_finish(VENUE, A).await.unwrap();

    let time = h
        .registry
        .session(VENUE, |s| s.teams.get(s.team_of(A).unwrap()).unwrap().done_time)
        .await
        .unwrap();
    assert_eq!(time, Some(TimeDelta::milliseconds(42_500)));
}

#[tokio::test(start_paused = true)]
async fn failed_recording_waits_for_finalize() {
    let h = harness().await;
    started(&h, &[A, B]).await;
    h.results.fail_next(1);

    finish(&h, A, 30).await;
    finish(&h, B, 45).await;
    let reply = h.registry.finalize(VENUE).await.unwrap();
    assert_eq!(reply.as_deref(), Some("Recording results"));
    settle().await;

    assert_eq!(status(&h).await, SessionStatus::Done);
    assert!(h.results.races().is_empty());
    assert!(h
        .announcer
        .announced(VENUE)
        .iter()
        .any(|n| matches!(n, Notice::RecordingFailed { race: 1, .. })));

    h.registry.finalize(VENUE).await.unwrap();
    settle().await;

    assert_eq!(status(&h).await, SessionStatus::NoRace);
    assert_eq!(h.results.races().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn admin_clear_can_record_first() {
    let h = harness().await;
    started(&h, &[A, B]).await;
    finish(&h, A, 30).await;
    finish(&h, B, 45).await;

    h.registry.admin_clear(VENUE, true).await.unwrap();
    settle().await;

    assert_eq!(status(&h).await, SessionStatus::NoRace);
    assert_eq!(h.results.races().len(), 1);
    assert!(h.announcer.announced(VENUE).contains(&Notice::Cleared));
}

#[tokio::test(start_paused = true)]
async fn admin_clear_discards_a_running_race() {
    let h = harness().await;
    started(&h, &[A, B]).await;
    finish(&h, A, 30).await;

    h.registry.admin_clear(VENUE, true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(status(&h).await, SessionStatus::NoRace);
    assert_eq!(h.registry.session(VENUE, |s| s.race_number).await.unwrap(), 2);
    assert!(h.results.races().is_empty());
}

#[tokio::test(start_paused = true)]
async fn entrant_races_at_one_venue_at_a_time() {
    let h = harness().await;
    let other = VenueId(2);
    h.registry.open(other, CategoryId::new("any%")).await.unwrap();

    h.registry.join(VENUE, A, "ana").await.unwrap();
    let reply = h.registry.join(other, A, "ana").await.unwrap();
    assert_eq!(reply.as_deref(), Some("ana is already racing at venue-1"));
    assert!(h.registry.session(other, |s| s.entrants.is_empty()).await.unwrap());

    h.registry.leave(VENUE, A).await.unwrap();
    assert_eq!(h.registry.join(other, A, "ana").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn unknown_venue_is_an_error() {
    let h = harness().await;
    let error = h.registry.join(VenueId(9), A, "ana").await.unwrap_err();
    assert!(matches!(error, racetrack::RaceError::UnknownVenue(VenueId(9))));
    assert!(matches!(
        h.registry.open(VENUE, CategoryId::new("any%")).await,
        Err(racetrack::RaceError::VenueExists(VENUE))
    ));
}
