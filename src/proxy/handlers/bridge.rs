// Bridging channel endpoint - the browser peer connects here
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::proxy::channel_registry::ChannelRegistry;

pub async fn handle_bridge(
    State(registry): State<Arc<ChannelRegistry>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_peer(registry, socket))
}

/// Pumps frames between the socket and the registry until either side ends.
async fn serve_peer(registry: Arc<ChannelRegistry>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let peer_id = registry.add_peer(outbound_tx);

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::warn!(peer_id, "Failed to write to bridging peer: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => registry.route_text(&text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => registry.route_text(text),
                Err(_) => tracing::warn!(peer_id, "Dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(peer_id, "Bridging peer closed the channel: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(peer_id, "Bridging channel error: {}", e);
                break;
            }
        }
    }

    writer.abort();
    registry.remove_peer(peer_id);
}
