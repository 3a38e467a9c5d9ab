use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use chrono::Utc;
use common::api::DeviceSnapshot;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
};

const UPDATE_BUFFER: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/device/stream", get(telemetry_stream))
}

/// Live telemetry feed: a `connected` event, the latest snapshot if one
/// exists, then a `data` event per broker update. The gateway subscription
/// is dropped together with the stream, so a departed client never leaks a
/// registration.
async fn telemetry_stream(
    State(state): State<AppState>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    if !state.gateway.is_connected() {
        state
            .gateway
            .connect()
            .await
            .map_err(|err| AppError::service_unavailable(format!("broker unavailable: {err}")))?;
    }

    let (tx, rx) = mpsc::channel::<Arc<DeviceSnapshot>>(UPDATE_BUFFER);
    let subscription = state.gateway.subscribe(move |snapshot| {
        // The gateway dispatch loop must never block; a slow client just
        // skips updates when its buffer is full.
        let _ = tx.try_send(snapshot);
    });

    let initial = initial_events(state.gateway.latest_snapshot());
    let updates = ReceiverStream::new(rx).map(move |snapshot| {
        let _owns = &subscription;
        snapshot_event(&snapshot)
    });

    let stream = tokio_stream::iter(initial)
        .chain(updates)
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn initial_events(latest: Option<Arc<DeviceSnapshot>>) -> Vec<Event> {
    let connected = Event::default()
        .event("connected")
        .data(json!({ "timestamp": Utc::now() }).to_string());

    match latest {
        Some(snapshot) => vec![connected, snapshot_event(&snapshot)],
        None => vec![connected],
    }
}

fn snapshot_event(snapshot: &DeviceSnapshot) -> Event {
    match Event::default().event("data").json_data(snapshot) {
        Ok(event) => event,
        Err(_) => Event::default().event("error").data("snapshot encoding failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            temperature: 215,
            humidity: 640,
            light: 1200,
            co2: 410,
            earth_temp: 180,
            earth_water: 55,
            earth_ec: 900,
            earth_n: 40,
            earth_p: 30,
            earth_k: 50,
            relay5: 1,
            relay6: 0,
            relay7: 0,
            relay8: 1,
            led1: 255,
            led2: 0,
            led3: 128,
            led4: 0,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn initial_events_start_with_connected() {
        let events = initial_events(None);
        assert_eq!(events.len(), 1, "no snapshot yet means only the greeting");

        let events = initial_events(Some(Arc::new(sample_snapshot())));
        assert_eq!(events.len(), 2, "latest snapshot is replayed on connect");
    }
}
