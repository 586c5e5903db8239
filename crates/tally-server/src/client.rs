use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tally_core::ConnectionId;
use tokio::sync::mpsc;

use crate::hub::BroadcastHub;
use crate::wire::ClientMessage;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Handle a WebSocket connection: split into reader/writer and run both until
/// either side ends, then drop the connection from the hub.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    hub: Arc<BroadcastHub>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward the outbox to the socket + periodic ping
    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_id, "Sent ping");
                }
            }
        }
    });

    // Reader task: dispatch inbound events
    let reader_id = connection_id.clone();
    let reader_hub = Arc::clone(&hub);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => dispatch(&reader_hub, &reader_id, text.as_str()),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish, then stop the other
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    let dropped = hub.on_disconnect(&connection_id);
    tracing::info!(connection_id = %connection_id, subscriptions = dropped, "WebSocket client disconnected");
}

/// Apply one inbound text frame. Malformed frames are logged and ignored.
pub fn dispatch(hub: &BroadcastHub, connection_id: &ConnectionId, raw: &str) {
    match ClientMessage::parse(raw) {
        Ok(ClientMessage::Subscribe { channel }) => {
            hub.subscribe(connection_id, channel);
        }
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "ignoring malformed client message");
        }
    }
}
