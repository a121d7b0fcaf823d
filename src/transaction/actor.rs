//! The task that exclusively owns the WebSocket to Upstream for one root
//! transaction (the "goroutine-with-mailbox" realization allowed by the
//! design's concurrency model, §5/§9). `TransactionContext` and its nested
//! children never touch the socket directly; they send `ActorCommand`s
//! through an `mpsc` channel and await a one-shot reply. Because the
//! mailbox is drained one message at a time, the wire ordering invariant
//! (one outstanding `execute` at a time, reply-before-next-send) holds
//! without any additional locking.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::errors::GatewayError;
use crate::model_uri::ModelUri;
use crate::protocol::{CommandOrPatch, MessageKind, ModelUpdateResult, TransactionMessage};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateKind {
    Close,
    RollBack,
}

pub enum ActorCommand {
    Execute {
        payload: CommandOrPatch,
        reply: oneshot::Sender<Result<ModelUpdateResult, GatewayError>>,
    },
    Terminate {
        kind: TerminateKind,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
}

pub struct SocketActor {
    model_uri: ModelUri,
    socket: UpstreamSocket,
    mailbox: mpsc::Receiver<ActorCommand>,
    reply_timeout: Duration,
    close_callback: Box<dyn FnOnce() + Send>,
}

impl SocketActor {
    pub fn new(
        model_uri: ModelUri,
        socket: UpstreamSocket,
        mailbox: mpsc::Receiver<ActorCommand>,
        reply_timeout: Duration,
        close_callback: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            model_uri,
            socket,
            mailbox,
            reply_timeout,
            close_callback,
        }
    }

    /// Reads Upstream's first message, which is a plain text frame carrying
    /// the transaction UUID (invariant #3: no `execute`/`close`/`roll-back`
    /// may be sent before this is received), then runs the mailbox loop
    /// until the session terminates. Invokes `close_callback` exactly once
    /// on every exit path.
    pub async fn run(mut self, uuid_tx: oneshot::Sender<Result<String, GatewayError>>) {
        let uuid = match self.await_uuid().await {
            Ok(uuid) => {
                let _ = uuid_tx.send(Ok(uuid.clone()));
                uuid
            }
            Err(err) => {
                let _ = uuid_tx.send(Err(err));
                (self.close_callback)();
                return;
            }
        };

        debug!(model_uri = %self.model_uri, %uuid, "transaction open");
        self.mailbox_loop().await;
        (self.close_callback)();
    }

    async fn await_uuid(&mut self) -> Result<String, GatewayError> {
        match self.socket.next().await {
            Some(Ok(WsMessage::Text(text))) => Ok(text),
            Some(Ok(other)) => Err(GatewayError::GatewayForwardError(
                format!("expected a text UUID frame first, got {other:?}").into(),
            )),
            Some(Err(err)) => Err(GatewayError::WebSocket(err)),
            None => Err(GatewayError::SocketClosed),
        }
    }

    async fn mailbox_loop(&mut self) {
        while let Some(command) = self.mailbox.recv().await {
            match command {
                ActorCommand::Execute { payload, reply } => {
                    let outcome = self.send_execute(payload).await;
                    let terminal = outcome.is_err();
                    let _ = reply.send(outcome);
                    if terminal {
                        return;
                    }
                }
                ActorCommand::Terminate { kind, reply } => {
                    let outcome = self.send_terminate(kind).await;
                    let _ = reply.send(outcome);
                    self.drain_until_closed().await;
                    return;
                }
            }
        }
    }

    async fn send_execute(
        &mut self,
        payload: CommandOrPatch,
    ) -> Result<ModelUpdateResult, GatewayError> {
        let message = TransactionMessage {
            kind: MessageKind::Execute,
            modeluri: self.model_uri.as_str().to_string(),
            data: serde_json::to_value(&payload)?,
        };
        self.send(&message).await?;
        self.await_reply().await
    }

    async fn send_terminate(&mut self, kind: TerminateKind) -> Result<(), GatewayError> {
        let message = TransactionMessage {
            kind: match kind {
                TerminateKind::Close => MessageKind::Close,
                TerminateKind::RollBack => MessageKind::RollBack,
            },
            modeluri: self.model_uri.as_str().to_string(),
            data: serde_json::Value::Null,
        };
        self.send(&message).await
    }

    async fn send(&mut self, message: &TransactionMessage) -> Result<(), GatewayError> {
        let text = serde_json::to_string(message)?;
        trace!(model_uri = %self.model_uri, %text, "sending to upstream");
        self.socket
            .send(WsMessage::Text(text))
            .await
            .map_err(GatewayError::WebSocket)
    }

    /// Every `execute` elicits exactly one reply (§4.3.1); out-of-band
    /// notifications are not modeled (Design Notes §9.2), so the channel is
    /// treated strictly request/reply after the UUID.
    async fn await_reply(&mut self) -> Result<ModelUpdateResult, GatewayError> {
        let next = tokio::time::timeout(self.reply_timeout, self.socket.next())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout)?;

        match next {
            Some(Ok(WsMessage::Text(text))) => {
                serde_json::from_str::<TransactionMessage>(&text)
                    .map_err(GatewayError::Json)
                    .and_then(|envelope| {
                        serde_json::from_value(envelope.data).map_err(GatewayError::Json)
                    })
            }
            Some(Ok(WsMessage::Close(_))) | None => Err(GatewayError::SocketClosed),
            Some(Ok(other)) => Err(GatewayError::GatewayForwardError(
                format!("unexpected reply frame: {other:?}").into(),
            )),
            Some(Err(err)) => Err(GatewayError::WebSocket(err)),
        }
    }

    async fn drain_until_closed(&mut self) {
        loop {
            match self.socket.next().await {
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(model_uri = %self.model_uri, %err, "error while waiting for upstream to close");
                    return;
                }
                None => return,
            }
        }
    }
}
