//! Gateway WebSocket handler.
//!
//! One socket carries one call. Inbound frames are handed to the call's
//! [`CallSession`]; everything the session emits flows back through a single
//! bounded channel so tokens, sentinels, audio, and notices reach the gateway
//! in the order they were produced.

use crate::session::{
    CallSession, InboundFrame, OutboundFrame, AUDIO_DONE_SENTINEL, TEXT_DONE_SENTINEL,
};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound frames buffered per call before the writer applies backpressure.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Query parameters for the gateway connection.
#[derive(Debug, Default, Deserialize)]
pub struct WsConnectParams {
    /// Pre-assigns the call identifier; metadata frames may still change it.
    pub call_id: Option<String>,
}

impl From<OutboundFrame> for AxumMessage {
    fn from(frame: OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Token(token) => AxumMessage::Text(token.into()),
            OutboundFrame::TextDone => AxumMessage::Text(TEXT_DONE_SENTINEL.into()),
            OutboundFrame::Audio(chunk) => AxumMessage::Binary(chunk),
            OutboundFrame::AudioDone => AxumMessage::Text(AUDIO_DONE_SENTINEL.into()),
            OutboundFrame::Notice(message) => AxumMessage::Text(message.into()),
        }
    }
}

/// Upgrades a gateway connection into a call session.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.call_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, call_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CHANNEL_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(frame.into()).await.is_err() {
                break;
            }
        }
    });

    let mut session = CallSession::new(state.services.clone(), tx, call_id);
    session.on_open().await;

    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(AxumMessage::Text(text)) => InboundFrame::Text(text.to_string()),
            Ok(AxumMessage::Binary(audio)) => InboundFrame::Binary(audio),
            Ok(AxumMessage::Close(_)) => {
                session.on_inbound_message(InboundFrame::Close).await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(call_id = %session.call_id(), "gateway socket error: {}", e);
                break;
            }
        };
        session.on_inbound_message(frame).await;
    }

    session.on_close().await;
    send_task.abort();
}
