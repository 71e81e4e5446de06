use crate::db::HistoryStore;
use crate::models::{TankRecord, RECORDED_TANKS};
use crate::telemetry_hub::TelemetryHub;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Writes the current level of every tank that has one. Returns how many were stored.
pub fn record_snapshot(hub: &TelemetryHub, store: &HistoryStore, now: OffsetDateTime) -> usize {
    let timestamp = (now.unix_timestamp_nanos() / 1_000_000) as i64;
    let readable_time = readable_time(now);
    let mut stored = 0;

    for (tank_id, signal) in RECORDED_TANKS {
        let Some(level) = hub.latest(signal) else {
            debug!("No level for {} yet, skipping.", tank_id);
            continue;
        };

        let record = TankRecord {
            tank_id: tank_id.to_string(),
            level,
            timestamp,
            readable_time: readable_time.clone(),
        };

        match store.insert_reading(&record) {
            Ok(()) => stored += 1,
            Err(e) => error!("Failed to store level for {}: {:?}", tank_id, e),
        }
    }

    stored
}

/// `YYYY-MM-DD HH:MM:SS`, UTC.
pub fn readable_time(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    at.format(&format).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Samples tank levels every `interval` until the task is aborted.
pub fn start_level_recorder(
    hub: TelemetryHub,
    store: Arc<HistoryStore>,
    interval: Duration,
) -> JoinHandle<()> {
    info!("Recording tank levels every {:?}.", interval);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let stored = record_snapshot(&hub, &store, OffsetDateTime::now_utc());
            debug!("Recorded {} tank level(s).", stored);
        }
    })
}
