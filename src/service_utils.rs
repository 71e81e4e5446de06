use crate::signals::{Reading, Signal};
use crate::telemetry_hub::{HubError, TelemetryHub};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Serialize)]
struct StatusMessage<'a> {
    status: &'a str,
    details: &'a str,
}

/// Publish hub status on the status topic
pub fn publish_status(hub: &TelemetryHub, status: &str, details: Option<&str>) -> Result<(), HubError> {
    let payload = serde_json::to_string(&StatusMessage {
        status,
        details: details.unwrap_or_default(),
    })?;
    let topic = hub.topics().status.clone();
    let completion = hub.publish(&topic, &payload)?;

    tokio::spawn(async move {
        match completion.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Status update on '{}' not sent: {}", topic, e),
            Err(_) => warn!("Status update on '{}' was dropped.", topic),
        }
    });
    Ok(())
}

/// Subscribe the level, flow and alert topics
pub fn start_ingestion(hub: &TelemetryHub) -> Result<(), HubError> {
    hub.subscribe_default_signals()?;

    let alerts_topic = hub.topics().alerts.clone();
    hub.subscribe_to_alerts(&alerts_topic, |message| {
        warn!("Alert: {}", message);
    })?;

    info!("Ingestion started for {} topic(s).", hub.subscriptions().len());
    Ok(())
}

/// Calls `on_change` with every new reading of `signal` until the task is aborted.
pub fn watch_signal<F>(hub: &TelemetryHub, signal: Signal, on_change: F) -> JoinHandle<()>
where
    F: Fn(Reading) + Send + 'static,
{
    let mut cell = hub.watch(signal);
    tokio::spawn(async move {
        while cell.changed().await.is_ok() {
            let reading = *cell.borrow_and_update();
            if let Some(reading) = reading {
                on_change(reading);
            }
        }
    })
}

/// Logs every change of every signal.
pub fn start_signal_logger(hub: &TelemetryHub) -> Vec<JoinHandle<()>> {
    Signal::ALL
        .into_iter()
        .map(|signal| {
            watch_signal(hub, signal, move |reading| {
                info!("{} is now {}", signal, reading.value);
            })
        })
        .collect()
}

/// Wait for a termination signal, then announce shutdown and disconnect
pub async fn handle_shutdown(hub: &TelemetryHub) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }

    info!("Hub is shutting down...");

    match publish_status(hub, "shutdown", Some("Telemetry hub is shutting down.")) {
        Ok(()) => {
            // Let the status message leave before the session closes.
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        }
        Err(e) => error!("Failed to publish shutdown status: {}", e),
    }

    hub.disconnect();
}
