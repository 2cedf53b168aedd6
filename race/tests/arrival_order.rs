//! Places and rating deltas do not depend on the order reports arrive in.

#![allow(clippy::unwrap_used, clippy::cast_possible_truncation)]

use chrono::TimeDelta;
use proptest::prelude::*;
use racetrack::mocks::RecordingAnnouncer;
use racetrack::session::PlacementSnapshot;
use racetrack::types::{CategoryId, EntrantId, VenueId};
use racetrack::{
    CategoryConfig, MemoryResultStore, RaceAction, RaceEnvironment, RaceReducer, SessionState,
    SharedDirectory,
};
use racetrack_core::reducer::Reducer;
use racetrack_testing::{epoch, test_clock};
use std::sync::Arc;

fn env() -> RaceEnvironment {
    RaceEnvironment::new(
        Arc::new(test_clock()),
        Arc::new(RecordingAnnouncer::new()),
        Arc::new(MemoryResultStore::new()),
        Arc::new(SharedDirectory::new()),
    )
}

/// Run a race where entrant `i` finishes at `times[i]` seconds, reported in `order`
fn run(times: &[i64], order: &[usize]) -> PlacementSnapshot {
    let reducer = RaceReducer::new();
    let env = env();
    let mut state = SessionState::new(
        VenueId(1),
        CategoryId::new("any%"),
        Arc::new(CategoryConfig::default()),
        1,
    );

    let ids: Vec<EntrantId> = (1..=times.len() as u64).map(EntrantId).collect();
    let mut actions: Vec<RaceAction> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| RaceAction::Join {
            entrant: *id,
            name: format!("r{id}"),
            rating: Some(1400.0 + 25.0 * i as f64),
        })
        .collect();
    actions.extend(ids.iter().map(|id| RaceAction::SetReady {
        entrant: *id,
        ready: true,
    }));
    actions.push(RaceAction::CountdownElapsed { epoch: 1 });
    actions.extend(order.iter().map(|i| RaceAction::ReportFinish {
        entrant: ids[*i],
        at: epoch() + TimeDelta::seconds(times[*i]),
    }));

    for action in actions {
        let _ = reducer.reduce(&mut state, action, &env);
    }
    assert!(state.fault.is_none(), "{:?}", state.fault);
    state.placement_snapshot()
}

proptest! {
    #[test]
    fn final_places_and_deltas_ignore_arrival_order(
        (times, order) in proptest::collection::vec(0_i64..40, 2..6)
            .prop_flat_map(|times| {
                let order: Vec<usize> = (0..times.len()).collect();
                (Just(times), Just(order).prop_shuffle())
            }),
    ) {
        let in_time_order = {
            let mut sorted: Vec<usize> = (0..times.len()).collect();
            sorted.sort_by_key(|i| times[*i]);
            sorted
        };

        let shuffled = run(&times, &order);
        let ordered = run(&times, &in_time_order);

        for ((key, (place, delta)), (_, (expected_place, expected_delta))) in
            shuffled.iter().zip(ordered.iter())
        {
            prop_assert_eq!(place, expected_place, "team {}", key);
            let (d, e) = (delta.unwrap(), expected_delta.unwrap());
            prop_assert!((d - e).abs() < 1e-9, "team {} delta {} vs {}", key, d, e);
        }
    }
}
