use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: a Ping every 15 seconds keeps idle relays alive
/// through proxies and detects dead peers.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Relay realtime events to one connected, pre-authenticated account.
///
/// Only events involving the account are forwarded; everything else on the
/// broadcast channel is invisible to this client. A lagging client loses
/// events for itself only — the client-side session reloads its list on
/// reconnect, so dropped events degrade to a refresh.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, account: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = dispatcher.subscribe();

    info!("account {account} connected to the message gateway");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            result = events.recv() => {
                let event = match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("gateway client {account} lagged, skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if !event.involves(account) {
                    continue;
                }

                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialize event for {account}: {e}");
                        continue;
                    }
                };
                if sender
                    .send(WsMessage::Text(Utf8Bytes::from(payload)))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Pong(_))) => trace!("pong from {account}"),
                    Some(Ok(_)) => {} // the relay is one-way; client frames are ignored
                    Some(Err(e)) => {
                        warn!("gateway error for {account}: {e}");
                        break;
                    }
                }
            }
        }
    }

    info!("account {account} disconnected from the message gateway");
}
