use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};

use crate::routes::AppState;
use crate::services::hub::{Hub, Subscription};

// GET /ws
#[utoipa::path(
    get,
    path = "/ws",
    responses(
        (status = 101, description = "Switching to WebSocket; server pushes asset events as JSON text frames")
    ),
    tag = "Notifications"
)]
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.ingest.hub().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Hub) {
    let subscription = hub.register();
    let id = subscription.id();
    tracing::info!("WebSocket | connected | id={} | clients={}", id, hub.connection_count());

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        if forward_events(subscription, &mut sender).await == WriterExit::Finished {
            let _ = sender.send(Message::Close(None)).await;
        }
    });

    // Client messages are ignored; reading only detects the close.
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    // Whichever task ends first takes the other down. Both halves of the
    // socket are dropped with their tasks, which closes the connection.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.unregister(id);
    tracing::info!("WebSocket | disconnected | id={} | clients={}", id, hub.connection_count());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    /// Queue drained after the subscriber was unregistered.
    Finished,
    /// The subscriber was dropped while a write was stuck.
    Evicted,
    /// The client stopped accepting writes.
    SinkFailed,
}

/// Pushes hub events into `sink` until the subscription ends.
///
/// Every write races the subscription's close token, so a client that stops
/// reading cannot park the task inside `send` after the hub has dropped it.
async fn forward_events<S>(mut subscription: Subscription, sink: &mut S) -> WriterExit
where
    S: Sink<Message> + Unpin,
{
    let closed = subscription.closed();
    while let Some(event) = subscription.recv().await {
        let text = match serde_json::to_string(&*event) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket | could not encode event");
                continue;
            }
        };
        tokio::select! {
            sent = sink.send(Message::Text(text.into())) => {
                if sent.is_err() {
                    return WriterExit::SinkFailed;
                }
            }
            _ = closed.cancelled() => {
                tracing::warn!(
                    "WebSocket | evicted mid-write | id={}",
                    subscription.id()
                );
                return WriterExit::Evicted;
            }
        }
    }
    WriterExit::Finished
}
