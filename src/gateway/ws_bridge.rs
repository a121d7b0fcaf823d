//! Bidirectional bridge between a client's axum WebSocket connection and an
//! Upstream WebSocket connection, for standard WS routes that aren't
//! backstopped (e.g. `/subscribe`).

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, warn};

use crate::transaction::actor::UpstreamSocket;

/// Pumps messages in both directions until either side closes or errors.
/// Consumes both sockets; does not attempt to reconnect.
pub async fn bridge(client: WebSocket, upstream: UpstreamSocket) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(frame) = client_rx.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "client socket error, closing bridge");
                    break;
                }
            };
            let outgoing = match frame {
                ClientMessage::Text(text) => UpstreamMessage::Text(text),
                ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
                ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
                ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
                ClientMessage::Close(_) => {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            };
            if upstream_tx.send(outgoing).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(frame) = upstream_rx.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "upstream socket error, closing bridge");
                    break;
                }
            };
            let outgoing = match frame {
                UpstreamMessage::Text(text) => ClientMessage::Text(text),
                UpstreamMessage::Binary(data) => ClientMessage::Binary(data),
                UpstreamMessage::Ping(data) => ClientMessage::Ping(data),
                UpstreamMessage::Pong(data) => ClientMessage::Pong(data),
                UpstreamMessage::Close(_) => {
                    let _ = client_tx.send(ClientMessage::Close(None)).await;
                    break;
                }
                // Raw frames are never yielded by a well-formed upstream
                // stream in practice; skip rather than forward garbage.
                UpstreamMessage::Frame(_) => continue,
            };
            if client_tx.send(outgoing).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => debug!("client closed the bridge"),
        _ = upstream_to_client => debug!("upstream closed the bridge"),
    }
}
