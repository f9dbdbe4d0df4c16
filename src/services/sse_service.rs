use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures::{StreamExt, stream::Map};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::{
    dto::sse::ServerEvent,
    error::SyncError,
    services::change_notifier::{RoomNotice, Subscription},
    state::SharedState,
};

const CHANNEL_CAPACITY: usize = 32;

type EncodeEvent = fn(ServerEvent) -> Result<Event, Infallible>;

/// Response stream fed by the forwarder task, with keep-alive comments interleaved.
pub type RoomEventStream = KeepAliveStream<Map<ReceiverStream<ServerEvent>, EncodeEvent>>;

/// Subscribe to a session and turn its notices into an SSE response.
///
/// The notifier callback only overwrites the latest payload. A forwarder task awaits the
/// client, so a slow reader skips intermediate snapshots but always receives the newest one.
/// The subscription lives in that task and is dropped once the client disconnects.
pub async fn room_stream(
    state: &SharedState,
    code: &str,
) -> Result<Sse<RoomEventStream>, SyncError> {
    let (latest_tx, latest_rx) = watch::channel::<Option<ServerEvent>>(None);
    let (tx, rx) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);

    let callback_code = code.to_owned();
    let subscription = state
        .engine()
        .subscribe(code, move |notice: RoomNotice| {
            match ServerEvent::from_notice(&callback_code, notice) {
                Ok(payload) => {
                    latest_tx.send_replace(Some(payload));
                }
                Err(err) => warn!(code = %callback_code, error = %err, "failed to encode room event"),
            }
        })
        .await?;

    info!(code = %code, "room SSE stream connected");
    tokio::spawn(hold_subscription(latest_rx, tx, subscription));

    let encode: EncodeEvent = |payload| Ok(to_event(payload));
    let stream = ReceiverStream::new(rx).map(encode);
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn to_event(payload: ServerEvent) -> Event {
    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    event
}

async fn hold_subscription(
    latest: watch::Receiver<Option<ServerEvent>>,
    tx: mpsc::Sender<ServerEvent>,
    subscription: Subscription,
) {
    forward_latest(latest, tx).await;
    info!(code = %subscription.code(), "room SSE stream disconnected");
    subscription.unsubscribe();
}

/// Push the newest payload to the client until it disconnects or the publisher goes away.
///
/// A payload published while the previous send is still waiting replaces any older unsent one.
async fn forward_latest(
    mut latest: watch::Receiver<Option<ServerEvent>>,
    tx: mpsc::Sender<ServerEvent>,
) {
    loop {
        tokio::select! {
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(payload) = latest.borrow_and_update().clone() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    fn payload(name: &str, data: &str) -> Option<ServerEvent> {
        Some(ServerEvent {
            event: Some(name.to_owned()),
            data: data.to_owned(),
        })
    }

    #[tokio::test]
    async fn slow_reader_still_gets_the_newest_payload() {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (tx, mut rx) = mpsc::channel(1);
        let forwarder = tokio::spawn(forward_latest(latest_rx, tx));

        for n in 0..500 {
            latest_tx.send_replace(payload("room.snapshot", &n.to_string()));
            tokio::task::yield_now().await;
        }
        latest_tx.send_replace(payload("room.closed", "{}"));
        drop(latest_tx);

        let mut received = Vec::new();
        timeout(Duration::from_secs(2), async {
            while let Some(event) = rx.recv().await {
                received.push(event);
            }
        })
        .await
        .unwrap();
        forwarder.await.unwrap();

        assert!(!received.is_empty());
        let last = received.last().unwrap();
        assert_eq!(last.event.as_deref(), Some("room.closed"));
    }

    #[tokio::test]
    async fn forwarder_stops_when_the_client_goes_away() {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (tx, rx) = mpsc::channel(1);
        let forwarder = tokio::spawn(forward_latest(latest_rx, tx));

        latest_tx.send_replace(payload("room.snapshot", "1"));
        drop(rx);

        timeout(Duration::from_secs(2), forwarder)
            .await
            .unwrap()
            .unwrap();
    }
}
