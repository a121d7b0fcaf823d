//! Reverse-proxy to Upstream for any request on a standard, non-backstopped
//! route: a WebSocket upgrade is bridged via `ws_bridge::bridge`, everything
//! else is forwarded over HTTP verbatim (§4.5).

use axum::body::{Body, Bytes};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, State};
use axum::http::{HeaderMap, Method, Request, Uri};
use axum::response::{IntoResponse, Response};
use tracing::instrument;

use crate::app::AppState;
use crate::errors::GatewayError;
use crate::gateway::ws_bridge;

/// Router-level fallback: detects a WebSocket upgrade request by attempting
/// `WebSocketUpgrade` extraction first, falling through to a plain HTTP
/// forward if the request isn't one. Kept as a single handler so both the
/// nested `/api/v<version>` router and the outer router's top-level fallback
/// can share it.
#[instrument(level = "debug", skip(state, req))]
pub async fn handle(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (mut parts, body) = req.into_parts();

    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => bridge_upgrade(state, parts.uri, ws).await,
        Err(_not_an_upgrade) => {
            let body = match hyper::body::to_bytes(body).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    return GatewayError::GatewayForwardError(
                        format!("failed to read request body: {err}").into(),
                    )
                    .into_response()
                }
            };
            forward_to_upstream(State(state), parts.method, parts.uri, parts.headers, body)
                .await
                .into_response()
        }
    }
}

async fn bridge_upgrade(state: AppState, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    match state.upstream.dial_upstream_ws(&path_and_query).await {
        Ok(upstream_socket) => ws.on_upgrade(move |socket| async move {
            ws_bridge::bridge(socket, upstream_socket).await;
        }),
        Err(err) => err.into_response(),
    }
}

#[instrument(level = "debug", skip(state, headers, body))]
pub async fn forward_to_upstream(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let upstream_response = state
        .upstream
        .forward(method, &path_and_query, strip_hop_headers(headers), body.to_vec())
        .await?;

    reqwest_response_into_axum(upstream_response).await
}

/// Headers that must not be blindly forwarded between hops (`Host`,
/// connection-management headers set by the client's own transport).
fn strip_hop_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.remove(axum::http::header::HOST);
    headers.remove(axum::http::header::CONNECTION);
    headers
}

async fn reqwest_response_into_axum(response: reqwest::Response) -> Result<Response, GatewayError> {
    let status = response.status();
    let mut headers = response.headers().clone();
    headers.remove(axum::http::header::CONNECTION);
    headers.remove(axum::http::header::TRANSFER_ENCODING);
    let bytes = response.bytes().await.map_err(GatewayError::Reqwest)?;

    Ok((status, headers, bytes).into_response())
}
