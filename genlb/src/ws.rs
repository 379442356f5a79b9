use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use genlb_core::{DownstreamSink, GenlbError};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsParams {
    #[serde(rename = "clientId")]
    pub client_id: String,
}

/// Adapts an axum socket half to `genlb-core`'s framework-agnostic
/// `DownstreamSink` trait, so `WsHub` can address this client without ever
/// depending on axum (spec §4.7).
struct AxumDownstreamSink {
    sender: Mutex<futures_util::stream::SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl DownstreamSink for AxumDownstreamSink {
    async fn send_text(&self, text: String) -> Result<(), GenlbError> {
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| GenlbError::Internal(e.to_string()))
    }

    async fn send_binary(&self, data: Vec<u8>) -> Result<(), GenlbError> {
        self.sender
            .lock()
            .await
            .send(Message::Binary(data))
            .await
            .map_err(|e| GenlbError::Internal(e.to_string()))
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.client_id))
}

/// Downstream frame handling (spec §4.7): incoming text/binary frames from
/// the client carry no semantic meaning to the balancer and are only
/// logged at debug level to keep the connection alive.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_id: String) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(AxumDownstreamSink {
        sender: Mutex::new(sender),
    });
    state
        .engine
        .ws_hub
        .connect_downstream(client_id.clone(), sink)
        .await;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                debug!(%client_id, %text, "discarded downstream text frame");
            }
            Ok(Message::Binary(_)) => {
                debug!(%client_id, "discarded downstream binary frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(%client_id, error = %e, "downstream websocket error");
                break;
            }
        }
    }

    state.engine.ws_hub.disconnect_downstream(&client_id).await;
}
