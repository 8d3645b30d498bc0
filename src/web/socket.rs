//! WebSocket endpoint validators connect to.

use super::AppState;
use crate::hub::{report, Hub, HubError};
use crate::protocol::encode_outgoing;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, peer, state.hub))
}

/// Drive one validator connection until either side closes it.
async fn run_connection(socket: WebSocket, peer: SocketAddr, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let (mut session, mut outbound) = hub.connections().on_connect(peer);

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match encode_outgoing(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode frame for {}: {}", peer, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = hub.connections().on_message(&mut session, text.as_str()).await {
                    report(&session, &e);
                }
            }
            Ok(Message::Binary(_)) => {
                report(&session, &HubError::ProtocolViolation("binary frame".to_string()));
            }
            Ok(Message::Close(_)) => break,
            // Ping and pong are answered by the transport
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Socket error from {}: {}", peer, e);
                break;
            }
        }
    }

    hub.connections().on_disconnect(session);
    writer.abort();
}
