//! WebSocket upgrade and per-connection sync loop.
//!
//! One socket serves exactly one owner, addressed by the URL path segment
//! (`/ws/:owner_id`). Every binary frame the client sends is a length-
//! prefix-free MessagePack-encoded `SyncRequest`; the relay authorizes,
//! applies, diffs, replies on the same socket, and broadcasts newly accepted
//! messages to every other live subscriber of the same owner.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use evolu_core::protocol;
use futures_util::{SinkExt, StreamExt};

use super::AppState;
use crate::error::RelayError;
use crate::network::connection::OutboundMessage;

pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.relay.is_owner_allowed(&owner_id) {
        return (axum::http::StatusCode::UNAUTHORIZED, "owner not allowed").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, owner_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, owner_id: String) {
    let _in_flight = state.shutdown.in_flight_guard();
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound_rx) = state.registry.register(&state.config.connection);
    state.registry.subscribe(&owner_id, handle.id);

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let sent = match msg {
                OutboundMessage::Binary(bytes) => sender.send(WsMessage::Binary(bytes.into())).await,
                OutboundMessage::Close(reason) => {
                    let _ = sender
                        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                            code: axum::extract::ws::close_code::NORMAL,
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Binary(bytes) => {
                match process_sync_frame(&state, &owner_id, handle.id, &bytes) {
                    Ok(response_bytes) => {
                        let _ = handle.try_send(OutboundMessage::Binary(response_bytes));
                    }
                    Err(err) => {
                        tracing::warn!(owner_id, error = %err, "rejecting sync frame");
                        break;
                    }
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Text(_) => {}
        }
    }

    write_task.abort();
    state.registry.remove(handle.id, &owner_id);
}

fn process_sync_frame(
    state: &AppState,
    owner_id: &str,
    origin: crate::network::connection::ConnectionId,
    bytes: &[u8],
) -> Result<Vec<u8>, RelayError> {
    let request: evolu_core::SyncRequest =
        protocol::decode(bytes).map_err(|e| RelayError::Protocol(e.to_string()))?;
    if request.user_id != owner_id {
        return Err(RelayError::Protocol(format!(
            "request user_id {} does not match socket owner {owner_id}",
            request.user_id
        )));
    }

    let (response, newly_accepted) = state.relay.apply_and_diff(
        owner_id,
        request.write_key.as_deref(),
        &request.messages,
        &request.merkle_tree_json,
    )?;

    if !newly_accepted.is_empty() {
        let broadcast = evolu_core::SyncResponse {
            merkle_tree_json: response.merkle_tree_json.clone(),
            messages: newly_accepted,
        };
        if let Ok(bytes) = protocol::encode(&broadcast) {
            state.registry.broadcast_except(owner_id, origin, &bytes);
        }
    }

    protocol::encode(&response).map_err(|e| RelayError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ConnectionRegistry, NetworkConfig, ShutdownController};
    use crate::relay_state::RelayState;
    use evolu_core::{EncryptedMessage, NodeId, SyncRequest, Timestamp};
    use std::sync::Arc;
    use std::time::Instant;

    fn test_state() -> AppState {
        let config = Arc::new(NetworkConfig::default());
        AppState {
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            relay: Arc::new(RelayState::new(Arc::clone(&config))),
            config,
            start_time: Instant::now(),
        }
    }

    #[test]
    fn process_sync_frame_accepts_well_formed_request() {
        let state = test_state();
        let (handle, _rx) = state.registry.register(&state.config.connection);

        let request = SyncRequest {
            user_id: "owner-a".to_string(),
            node_id: "abc".to_string(),
            write_key: Some("key1".to_string()),
            merkle_tree_json: "{\"hash\":0}".to_string(),
            messages: vec![EncryptedMessage {
                timestamp: Timestamp {
                    millis: 1,
                    counter: 0,
                    node_id: NodeId([1; 8]),
                },
                content: vec![1, 2, 3],
            }],
        };
        let bytes = protocol::encode(&request).unwrap();

        let response_bytes = process_sync_frame(&state, "owner-a", handle.id, &bytes).unwrap();
        let response: evolu_core::SyncResponse = protocol::decode(&response_bytes).unwrap();
        assert!(!response.merkle_tree_json.is_empty());
    }

    #[test]
    fn process_sync_frame_rejects_malformed_bytes() {
        let state = test_state();
        let (handle, _rx) = state.registry.register(&state.config.connection);
        let err = process_sync_frame(&state, "owner-a", handle.id, b"not msgpack").unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn process_sync_frame_broadcasts_to_other_subscribers() {
        let state = test_state();
        let (origin, _rx1) = state.registry.register(&state.config.connection);
        let (other, mut rx2) = state.registry.register(&state.config.connection);
        state.registry.subscribe("owner-a", origin.id);
        state.registry.subscribe("owner-a", other.id);

        let request = SyncRequest {
            user_id: "owner-a".to_string(),
            node_id: "abc".to_string(),
            write_key: Some("key1".to_string()),
            merkle_tree_json: "{\"hash\":0}".to_string(),
            messages: vec![EncryptedMessage {
                timestamp: Timestamp {
                    millis: 1,
                    counter: 0,
                    node_id: NodeId([1; 8]),
                },
                content: vec![1, 2, 3],
            }],
        };
        let bytes = protocol::encode(&request).unwrap();
        process_sync_frame(&state, "owner-a", origin.id, &bytes).unwrap();

        assert!(rx2.try_recv().is_ok());
    }
}
