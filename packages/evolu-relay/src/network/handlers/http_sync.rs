//! HTTP sync endpoint: the non-WebSocket half of the sync protocol, for
//! clients that cannot hold a long-lived socket open (serverless functions,
//! one-shot scripts). One POST is exactly one sync round; there is no
//! broadcast to other subscribers over this transport, only over `/ws`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use evolu_core::protocol;

use super::AppState;
use crate::error::RelayError;

pub async fn http_sync_handler(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !state.relay.is_owner_allowed(&owner_id) {
        return (StatusCode::UNAUTHORIZED, Vec::new()).into_response();
    }

    match handle(&state, &owner_id, &body) {
        Ok(response_bytes) => {
            ([("content-type", "application/msgpack")], response_bytes).into_response()
        }
        Err(err) => (err.status_code(), Vec::new()).into_response(),
    }
}

fn handle(state: &AppState, owner_id: &str, body: &[u8]) -> Result<Vec<u8>, RelayError> {
    let request: evolu_core::SyncRequest =
        protocol::decode(body).map_err(|e| RelayError::Protocol(e.to_string()))?;
    if request.user_id != owner_id {
        return Err(RelayError::Protocol(format!(
            "request user_id {} does not match path owner {owner_id}",
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
            // No origin connection over HTTP -- every WS subscriber is "other".
            state
                .registry
                .broadcast_except(owner_id, crate::network::connection::ConnectionId(0), &bytes);
        }
    }

    protocol::encode(&response).map_err(|e| RelayError::Protocol(e.to_string()))
}
