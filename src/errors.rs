//! Utilities for logging errors for admins and displaying errors to callers.

use std::borrow::Cow;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use derive_more::{Display, Error, From};
use serde_json::json;
use tracing::warn;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every failure mode the transaction core and gateway can surface. Mirrors
/// the error kinds enumerated in the design: `SocketClosed`, `EmptyEdit`,
/// `UpstreamError`, `CommandProviderFailure`, `TriggerFailure`,
/// `GatewayForwardError`, plus the two ambient safety valves the design
/// recommends (`TriggerLoopExceeded`, `UpstreamTimeout`).
#[derive(Debug, Display, Error, From)]
pub enum GatewayError {
    /// Operation attempted after the transaction socket transitioned to Closed.
    #[display(fmt = "socket closed")]
    #[from(ignore)]
    SocketClosed,

    /// Non-2xx HTTP or protocol-level failure from Upstream.
    #[display(fmt = "upstream error ({status}): {body}")]
    #[from(ignore)]
    UpstreamError { status: StatusCode, body: String },

    /// A transaction function returned `false`.
    #[display(fmt = "command execution failed")]
    #[from(ignore)]
    CommandProviderFailure,

    /// The trigger step rejected.
    #[display(fmt = "trigger execution failed: {_0}")]
    #[from(ignore)]
    TriggerFailure(Cow<'static, str>),

    /// The commit trigger loop did not reach quiescence within the
    /// configured iteration cap.
    #[display(fmt = "trigger loop exceeded {max_iterations} iterations without quiescing")]
    #[from(ignore)]
    TriggerLoopExceeded { max_iterations: u32 },

    /// An awaited Upstream reply did not arrive within the configured
    /// timeout.
    #[display(fmt = "timed out waiting for upstream reply")]
    #[from(ignore)]
    UpstreamTimeout,

    /// The downstream proxy could not reach Upstream at all.
    #[display(fmt = "gateway forward error: {_0}")]
    #[from(ignore)]
    GatewayForwardError(Cow<'static, str>),

    /// No provider claimed a command whose registry lookup was expected to
    /// resolve (programmer error surfaced instead of panicking).
    #[display(fmt = "no provider registered for command type {_0}")]
    #[from(ignore)]
    NoSuchProvider(String),

    /// Popping the frame stack below the root frame, or popping an empty
    /// stack. Always a programmer error, kept as a typed error rather than
    /// a panic so a misbehaving plug-in can't take the whole process down.
    #[display(fmt = "frame stack underflow")]
    #[from(ignore)]
    FrameStackUnderflow,

    Io(std::io::Error),
    Json(serde_json::Error),
    Reqwest(reqwest::Error),
    WebSocket(tokio_tungstenite::tungstenite::Error),

    #[display(fmt = "{_0}")]
    #[from(ignore)]
    Anyhow(anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::SocketClosed => (StatusCode::CONFLICT, self.to_string()),
            GatewayError::UpstreamError { status, .. } => (*status, self.to_string()),
            GatewayError::CommandProviderFailure
            | GatewayError::TriggerFailure(_)
            | GatewayError::TriggerLoopExceeded { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            GatewayError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            GatewayError::GatewayForwardError(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            GatewayError::NoSuchProvider(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        if status.is_server_error() {
            warn!(error = %self, %status, "gateway error");
        }

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

/// Attaches human-readable context to a fallible or optional value, the way
/// `anyhow::Context` does, but producing a typed `GatewayError` instead.
pub trait GatewayErrorContext<T> {
    fn gateway_context<S: Into<Cow<'static, str>>>(self, msg: S) -> GatewayResult<T>;
}

impl<T> GatewayErrorContext<T> for Option<T> {
    fn gateway_context<S: Into<Cow<'static, str>>>(self, msg: S) -> GatewayResult<T> {
        self.ok_or_else(|| GatewayError::GatewayForwardError(msg.into()))
    }
}

impl<T, E> GatewayErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn gateway_context<S: Into<Cow<'static, str>>>(self, msg: S) -> GatewayResult<T> {
        self.map_err(|err| {
            GatewayError::GatewayForwardError(Cow::Owned(format!("{}: {err}", msg.into())))
        })
    }
}
