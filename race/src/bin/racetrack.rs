//! Racetrack demo
//!
//! Runs one scripted race at a single venue: three entrants join, two of
//! them team up, everyone readies, the countdown runs, finishes are reported
//! out of order and the results are recorded. Prints the category
//! leaderboard at the end.
//!
//! # Usage
//!
//! ```bash
//! # In-memory results
//! RACE_COUNTDOWN_SECS=3 cargo run --bin racetrack
//!
//! # PostgreSQL results and a Prometheus endpoint
//! DATABASE_URL=postgres://localhost/racetrack METRICS_ADDR=0.0.0.0:9000 \
//!     cargo run --bin racetrack
//! ```

use anyhow::Context;
use chrono::TimeDelta;
use racetrack::metrics::register_race_metrics;
use racetrack::types::{CategoryId, EntrantId, SessionStatus, VenueId};
use racetrack::{
    LogAnnouncer, MemoryResultStore, PgResultStore, RaceConfig, RaceEnvironment, ResultStore,
    SessionRegistry, SessionState, SharedDirectory,
};
use racetrack_core::environment::SystemClock;
use racetrack_runtime::metrics::MetricsServer;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,racetrack=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RaceConfig::from_env().context("loading configuration")?;

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr).start()?;
        register_race_metrics();
    }

    let results: Arc<dyn ResultStore> = match &config.database_url {
        Some(url) => {
            let store = PgResultStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("Recording results to PostgreSQL");
            Arc::new(store)
        },
        None => {
            tracing::info!("DATABASE_URL not set, recording results in memory");
            Arc::new(MemoryResultStore::new())
        },
    };

    let env = RaceEnvironment::new(
        Arc::new(SystemClock),
        Arc::new(LogAnnouncer),
        results,
        Arc::new(SharedDirectory::new()),
    );
    let wait_limit = config.defaults.countdown + Duration::from_secs(30);
    let registry = SessionRegistry::new(config, env);

    let venue = VenueId(1);
    let category = CategoryId::new("any%");
    let (ana, bo, cy) = (EntrantId(1), EntrantId(2), EntrantId(3));

    registry.open(venue, category.clone()).await?;
    for (entrant, name) in [(ana, "ana"), (bo, "bo"), (cy, "cy")] {
        registry.join(venue, entrant, name).await?;
    }
    registry.team_with(venue, bo, cy).await?;
    registry.rename_team(venue, bo, "the duo").await?;
    for entrant in [ana, bo, cy] {
        reply(registry.set_ready(venue, entrant, true).await?);
    }

    let start = wait_for(&registry, venue, wait_limit, |s| s.status == SessionStatus::Active)
        .await?
        .start_time
        .context("race started without a start time")?;

    // The duo reports first but finished later
    reply(
        registry
            .report_finish_at(venue, bo, start + TimeDelta::milliseconds(95_250))
            .await?,
    );
    reply(
        registry
            .report_finish_at(venue, ana, start + TimeDelta::milliseconds(88_400))
            .await?,
    );
    reply(registry.finalize(venue).await?);

    wait_for(&registry, venue, wait_limit, |s| s.status == SessionStatus::NoRace).await?;

    println!("\nLeaderboard for {category}:");
    for (rank, stats) in registry.leaderboard(&category, 10).await?.iter().enumerate() {
        println!(
            "  {}. {} {:.1} ({} races, {} wins)",
            rank + 1,
            stats.entrant,
            stats.rating,
            stats.races,
            stats.firsts
        );
    }

    registry.shutdown().await?;
    Ok(())
}

fn reply(reply: Option<String>) {
    if let Some(text) = reply {
        println!("> {text}");
    }
}

/// Poll the venue until `done` holds, returning a copy of the session
async fn wait_for<F>(
    registry: &SessionRegistry,
    venue: VenueId,
    limit: Duration,
    done: F,
) -> anyhow::Result<SessionState>
where
    F: Fn(&SessionState) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let session = registry.session(venue, Clone::clone).await?;
        if done(&session) {
            return Ok(session);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for the race at {venue} (status {})", session.status);
        }
        tokio::time::sleep(POLL).await;
    }
}
