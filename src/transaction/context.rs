//! One transaction's edit session: owns (indirectly, through the socket
//! actor) a WebSocket to Upstream, a stack of nested edit frames, and
//! dispatches commands and triggers per the algorithms in the design.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::model_uri::ModelUri;
use crate::protocol::{Command, CommandOrPatch, ModelUpdateResult, Operation};
use crate::registry::command::{CommandOutcome, CommandProviderRegistry, Executor};
use crate::registry::trigger::{TriggerOutcome, TriggerProviderRegistry};
use crate::transaction::actor::{ActorCommand, SocketActor, TerminateKind, UpstreamSocket};
use crate::transaction::frame::FrameStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    AwaitingUuid,
    Open,
    Closing(TerminateKindPublic),
    Closed,
}

/// Mirrors `transaction::actor::TerminateKind`; kept as a separate, public
/// copy so the state machine is inspectable without exposing the actor's
/// internal wire plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateKindPublic {
    Close,
    RollBack,
}

struct RootShared {
    model_uri: ModelUri,
    transaction_uri: String,
    uuid: String,
    /// Identity used by `TransactionManager`'s close callback to tell
    /// whether the map entry it's about to remove still refers to this
    /// session, or was already replaced by a fresh `open` for the same
    /// model (§4.4: "removes the entry only if the current mapping still
    /// equals this context").
    session_id: Uuid,
    state: Mutex<SocketState>,
    frames: FrameStack,
    mailbox: mpsc::Sender<ActorCommand>,
    command_registry: Arc<CommandProviderRegistry>,
    trigger_registry: Arc<TriggerProviderRegistry>,
    max_trigger_iterations: u32,
}

/// One open transaction. Cloning yields another handle to the *same*
/// session (same socket actor, same frame stack) — this is exactly how
/// nested children share state with their root (§4.3.4).
#[derive(Clone)]
pub struct TransactionContext {
    shared: Arc<RootShared>,
    is_root: bool,
}

impl TransactionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open(
        model_uri: ModelUri,
        transaction_uri: String,
        session_id: Uuid,
        socket: UpstreamSocket,
        command_registry: Arc<CommandProviderRegistry>,
        trigger_registry: Arc<TriggerProviderRegistry>,
        max_trigger_iterations: u32,
        reply_timeout: Duration,
        close_callback: Box<dyn FnOnce() + Send>,
    ) -> Result<Self, GatewayError> {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(32);
        let (uuid_tx, uuid_rx) = oneshot::channel();

        let actor = SocketActor::new(
            model_uri.clone(),
            socket,
            mailbox_rx,
            reply_timeout,
            close_callback,
        );
        tokio::spawn(actor.run(uuid_tx));

        let uuid = uuid_rx.await.map_err(|_| GatewayError::SocketClosed)??;

        let shared = Arc::new(RootShared {
            model_uri,
            transaction_uri,
            uuid,
            session_id,
            state: Mutex::new(SocketState::Open),
            frames: FrameStack::new(),
            mailbox: mailbox_tx,
            command_registry,
            trigger_registry,
            max_trigger_iterations,
        });

        Ok(Self {
            shared,
            is_root: true,
        })
    }

    pub fn model_uri(&self) -> &ModelUri {
        &self.shared.model_uri
    }

    pub fn transaction_uri(&self) -> &str {
        &self.shared.transaction_uri
    }

    pub fn uuid(&self) -> &str {
        &self.shared.uuid
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.shared.state.lock().unwrap(), SocketState::Open)
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub(crate) fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    fn ensure_open(&self) -> Result<(), GatewayError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(GatewayError::SocketClosed)
        }
    }

    /// `openTransaction()` on an already-open context: a nested child that
    /// shares the same socket and frame stack. Pushes a frame on entry.
    pub fn nested_child(&self) -> Self {
        self.shared.frames.push_frame();
        Self {
            shared: self.shared.clone(),
            is_root: false,
        }
    }

    /// Single entry point for all edits: dispatches to `execute` for
    /// commands and `apply_patch` for patches.
    pub async fn edit(&self, edit: CommandOrPatch) -> Result<ModelUpdateResult, GatewayError> {
        match edit {
            CommandOrPatch::Command(command) => self.execute_command(command).await,
            CommandOrPatch::Patch(patch) => self.apply_patch_impl(patch).await,
        }
    }

    #[instrument(level = "debug", skip(self, command), fields(model_uri = %self.shared.model_uri, command_type = %command.command_type))]
    async fn execute_command(&self, command: Command) -> Result<ModelUpdateResult, GatewayError> {
        self.ensure_open()?;

        if !self.shared.command_registry.has_provider(&command.command_type) {
            return self.send_and_merge(CommandOrPatch::Command(command)).await;
        }

        let outcome = self
            .shared
            .command_registry
            .get_commands(&self.shared.model_uri, &command)
            .ok_or_else(|| GatewayError::NoSuchProvider(command.command_type.clone()))?;

        match outcome {
            CommandOutcome::Function(function) => {
                self.shared.frames.push_frame();
                let executor: Arc<dyn Executor> = Arc::new(self.clone());
                match function(executor).await {
                    Ok(true) => self.shared.frames.pop_frame(),
                    Ok(false) => {
                        let _ = self.shared.frames.pop_frame_discard();
                        self.rollback("command execution failed").await;
                        Err(GatewayError::CommandProviderFailure)
                    }
                    Err(err) => {
                        let _ = self.shared.frames.pop_frame_discard();
                        self.rollback(err.to_string()).await;
                        Err(err)
                    }
                }
            }
            CommandOutcome::Substitute(CommandOrPatch::Command(substitute)) => {
                self.send_and_merge(CommandOrPatch::Command(substitute)).await
            }
            CommandOutcome::Substitute(CommandOrPatch::Patch(ops)) => {
                self.apply_patch_impl(ops).await
            }
        }
    }

    #[instrument(level = "debug", skip(self, patch), fields(model_uri = %self.shared.model_uri, len = patch.len()))]
    async fn apply_patch_impl(
        &self,
        patch: Vec<Operation>,
    ) -> Result<ModelUpdateResult, GatewayError> {
        if patch.is_empty() {
            return Ok(ModelUpdateResult::failure());
        }
        self.ensure_open()?;
        self.send_and_merge(CommandOrPatch::Patch(patch)).await
    }

    async fn send_and_merge(
        &self,
        payload: CommandOrPatch,
    ) -> Result<ModelUpdateResult, GatewayError> {
        match self.send_execute(payload).await {
            Ok(reply) => {
                self.shared.frames.merge_into_top(reply.clone());
                Ok(reply)
            }
            Err(err) => {
                self.rollback(err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn send_execute(
        &self,
        payload: CommandOrPatch,
    ) -> Result<ModelUpdateResult, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .mailbox
            .send(ActorCommand::Execute {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| GatewayError::SocketClosed)?;
        reply_rx.await.map_err(|_| GatewayError::SocketClosed)?
    }

    /// Pushes a frame, runs the trigger outcome (a patch or a transaction
    /// function) inside it, and pops the frame regardless of outcome,
    /// returning the popped aggregated result. A `false` return from a
    /// trigger function downgrades that frame's `success` without
    /// discarding whatever patches it already produced; only an actual
    /// error rejects (and the caller auto-rolls-back).
    async fn perform_triggers(
        &self,
        outcome: TriggerOutcome,
    ) -> Result<ModelUpdateResult, GatewayError> {
        self.shared.frames.push_frame();

        let eval: Result<(), GatewayError> = match outcome {
            TriggerOutcome::Patch(ops) => self.apply_patch_impl(ops).await.map(|_| ()),
            TriggerOutcome::Function(function) => {
                let executor: Arc<dyn Executor> = Arc::new(self.clone());
                match function(executor).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        self.shared.frames.merge_into_top(ModelUpdateResult::failure());
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };

        match eval {
            Ok(()) => self.shared.frames.pop_frame(),
            Err(err) => {
                let _ = self.shared.frames.pop_frame();
                Err(err)
            }
        }
    }

    /// Commits the transaction. A nested child simply pops and returns its
    /// frame — only the root sends `close` to Upstream (§4.3.4, §4.3.5).
    #[instrument(level = "debug", skip(self), fields(model_uri = %self.shared.model_uri, is_root = self.is_root))]
    pub async fn commit(&self) -> Result<ModelUpdateResult, GatewayError> {
        if !self.is_root {
            return self.shared.frames.pop_frame();
        }

        if !self.is_open() {
            return Ok(ModelUpdateResult::failure());
        }

        let mut delta = self.shared.frames.peek_patch();
        let mut iterations: u32 = 0;

        loop {
            if delta.is_empty() {
                break;
            }

            iterations += 1;
            if iterations > self.shared.max_trigger_iterations {
                let err = GatewayError::TriggerLoopExceeded {
                    max_iterations: self.shared.max_trigger_iterations,
                };
                self.rollback(err.to_string()).await;
                return Err(err);
            }

            let outcome = self
                .shared
                .trigger_registry
                .get_triggers(&self.shared.model_uri, &delta);
            if outcome.is_empty() {
                break;
            }

            let result = match self.perform_triggers(outcome).await {
                Ok(result) => result,
                Err(err) => {
                    self.rollback(err.to_string()).await;
                    return Err(err);
                }
            };
            delta = result.patch;
        }

        let aggregate = self.shared.frames.pop_root_frame()?;
        self.send_close().await?;
        Ok(aggregate)
    }

    async fn send_close(&self) -> Result<(), GatewayError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            *state = SocketState::Closing(TerminateKindPublic::Close);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .mailbox
            .send(ActorCommand::Terminate {
                kind: TerminateKind::Close,
                reply: reply_tx,
            })
            .await
            .map_err(|_| GatewayError::SocketClosed)?;
        reply_rx.await.map_err(|_| GatewayError::SocketClosed)?
    }

    /// Best-effort and idempotent: always returns `{success: false}`, never
    /// errors, and sends `roll-back` at most once even if called again
    /// after the socket already started closing.
    #[instrument(level = "debug", skip(self, reason), fields(model_uri = %self.shared.model_uri))]
    pub async fn rollback(&self, reason: impl Into<String> + std::fmt::Display) -> ModelUpdateResult {
        {
            let mut state = self.shared.state.lock().unwrap();
            if matches!(*state, SocketState::Closing(_) | SocketState::Closed) {
                return ModelUpdateResult::failure();
            }
            warn!(model_uri = %self.shared.model_uri, %reason, "rolling back transaction");
            *state = SocketState::Closing(TerminateKindPublic::RollBack);
        }
        self.shared.frames.clear();

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .mailbox
            .send(ActorCommand::Terminate {
                kind: TerminateKind::RollBack,
                reply: reply_tx,
            })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        ModelUpdateResult::failure()
    }
}

#[async_trait::async_trait]
impl Executor for TransactionContext {
    async fn execute(&self, command: Command) -> Result<ModelUpdateResult, GatewayError> {
        self.execute_command(command).await
    }

    async fn apply_patch(&self, patch: Vec<Operation>) -> Result<ModelUpdateResult, GatewayError> {
        self.apply_patch_impl(patch).await
    }

    async fn open_transaction(&self) -> Result<Arc<dyn Executor>, GatewayError> {
        Ok(Arc::new(self.nested_child()))
    }
}

/// End-to-end scenarios (spec §8 S1-S4) against a scripted, real loopback
/// WebSocket standing in for Upstream. These exercise the actor, the frame
/// stack and the registries together, rather than any one in isolation.
#[cfg(test)]
mod scenario_tests {
    use super::*;
    use crate::protocol::{MessageKind, TransactionMessage};
    use crate::registry::command::CommandProvider;
    use crate::registry::trigger::TriggerProvider;
    use futures::future::BoxFuture;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Starts a loopback server that speaks the transaction wire protocol:
    /// sends the UUID frame, then for each inbound `execute` calls
    /// `on_execute` with the payload and replies with its result, until a
    /// `close`/`roll-back` arrives.
    fn spawn_fake_upstream(
        mut on_execute: impl FnMut(serde_json::Value) -> ModelUpdateResult + Send + 'static,
    ) -> (
        tokio::sync::oneshot::Receiver<String>,
        tokio::task::JoinHandle<Vec<MessageKind>>,
    ) {
        let (addr_tx, addr_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let _ = addr_tx.send(format!("ws://{addr}"));

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text("test-transaction-uuid".into()))
                .await
                .unwrap();

            let mut kinds = Vec::new();
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let msg: TransactionMessage = serde_json::from_str(&text).unwrap();
                        kinds.push(msg.kind);
                        match msg.kind {
                            MessageKind::Execute => {
                                let reply = on_execute(msg.data);
                                let envelope = TransactionMessage {
                                    kind: MessageKind::IncrementalUpdate,
                                    modeluri: msg.modeluri,
                                    data: serde_json::to_value(&reply).unwrap(),
                                };
                                let text = serde_json::to_string(&envelope).unwrap();
                                ws.send(WsMessage::Text(text)).await.unwrap();
                            }
                            MessageKind::Close | MessageKind::RollBack => {
                                let _ = ws.close(None).await;
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ => break,
                }
            }
            kinds
        });
        (addr_rx, handle)
    }

    async fn open_context(
        ws_url: String,
        command_registry: Arc<CommandProviderRegistry>,
        trigger_registry: Arc<TriggerProviderRegistry>,
    ) -> TransactionContext {
        let socket = connect_async(ws_url).await.unwrap().0;
        TransactionContext::open(
            ModelUri::new("file:/m1"),
            "http://upstream/api/v2/transaction/m1".to_string(),
            Uuid::new_v4(),
            socket,
            command_registry,
            trigger_registry,
            64,
            Duration::from_secs(5),
            Box::new(|| {}),
        )
        .await
        .unwrap()
    }

    fn op(path: &str) -> Operation {
        Operation {
            op: "replace".into(),
            path: path.into(),
            value: Some(serde_json::json!(true)),
            from: None,
        }
    }

    /// Simulates Upstream actually applying a patch payload: echoes its
    /// operations back as the applied delta. Commands-without-a-patch reply
    /// with an empty, successful delta.
    fn echo_patch(data: serde_json::Value) -> ModelUpdateResult {
        match serde_json::from_value::<CommandOrPatch>(data) {
            Ok(CommandOrPatch::Patch(ops)) => ModelUpdateResult::success(ops),
            _ => ModelUpdateResult::success(vec![]),
        }
    }

    #[tokio::test]
    async fn s1_direct_patch_is_forwarded_and_committed() {
        let (addr_rx, server) = spawn_fake_upstream(|_data| ModelUpdateResult::success(vec![op("/a")]));
        let ws_url = addr_rx.await.unwrap();

        let ctx = open_context(
            ws_url,
            Arc::new(CommandProviderRegistry::new()),
            Arc::new(TriggerProviderRegistry::new()),
        )
        .await;

        let result = ctx.apply_patch_impl(vec![op("/a")]).await.unwrap();
        assert!(result.success);

        let aggregate = ctx.commit().await.unwrap();
        assert!(aggregate.success);
        assert_eq!(aggregate.patch.len(), 1);

        let kinds = server.await.unwrap();
        assert_eq!(kinds, vec![MessageKind::Execute, MessageKind::Close]);
    }

    struct TwoPatchProvider;

    impl CommandProvider for TwoPatchProvider {
        fn provide(&self, _model_uri: &ModelUri, _command: &Command) -> CommandOutcome {
            CommandOutcome::Function(Arc::new(|executor: Arc<dyn Executor>| {
                Box::pin(async move {
                    executor.apply_patch(vec![op("/a")]).await?;
                    executor.apply_patch(vec![op("/b")]).await?;
                    Ok(true)
                }) as BoxFuture<'static, Result<bool, GatewayError>>
            }))
        }
    }

    #[tokio::test]
    async fn s2_nested_command_expansion_forwards_each_patch_in_order() {
        let (addr_rx, server) = spawn_fake_upstream(echo_patch);
        let ws_url = addr_rx.await.unwrap();

        let command_registry = Arc::new(CommandProviderRegistry::new());
        command_registry.register("T1", Arc::new(TwoPatchProvider));

        let ctx = open_context(ws_url, command_registry, Arc::new(TriggerProviderRegistry::new())).await;

        let result = ctx.execute_command(Command::new("T1")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.patch.len(), 2);

        let aggregate = ctx.commit().await.unwrap();
        assert!(aggregate.success);

        let kinds = server.await.unwrap();
        assert_eq!(kinds, vec![MessageKind::Execute, MessageKind::Execute, MessageKind::Close]);
    }

    struct FailingCommand;

    impl CommandProvider for FailingCommand {
        fn provide(&self, _model_uri: &ModelUri, _command: &Command) -> CommandOutcome {
            CommandOutcome::Function(Arc::new(|_executor: Arc<dyn Executor>| {
                Box::pin(async move { Ok(false) }) as BoxFuture<'static, Result<bool, GatewayError>>
            }))
        }
    }

    #[tokio::test]
    async fn s3_failing_command_function_rolls_back() {
        let (addr_rx, server) = spawn_fake_upstream(|_data| ModelUpdateResult::success(vec![]));
        let ws_url = addr_rx.await.unwrap();

        let command_registry = Arc::new(CommandProviderRegistry::new());
        command_registry.register("T1", Arc::new(FailingCommand));

        let ctx = open_context(ws_url, command_registry, Arc::new(TriggerProviderRegistry::new())).await;

        let err = ctx.execute_command(Command::new("T1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::CommandProviderFailure));

        let kinds = server.await.unwrap();
        assert_eq!(kinds, vec![MessageKind::RollBack]);
    }

    struct OneShotTrigger {
        fired: std::sync::atomic::AtomicBool,
    }

    impl TriggerProvider for OneShotTrigger {
        fn triggers(&self, _model_uri: &ModelUri, delta: &[Operation]) -> TriggerOutcome {
            if self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) || delta.is_empty() {
                return TriggerOutcome::empty();
            }
            TriggerOutcome::Patch(vec![op("/derived")])
        }
    }

    #[tokio::test]
    async fn s4_commit_trigger_loop_runs_until_quiescent() {
        let (addr_rx, server) = spawn_fake_upstream(echo_patch);
        let ws_url = addr_rx.await.unwrap();

        let trigger_registry = Arc::new(TriggerProviderRegistry::new());
        trigger_registry.register(
            ModelUri::new("file:/m1"),
            Arc::new(OneShotTrigger {
                fired: std::sync::atomic::AtomicBool::new(false),
            }),
        );

        let ctx = open_context(ws_url, Arc::new(CommandProviderRegistry::new()), trigger_registry).await;

        ctx.apply_patch_impl(vec![op("/a")]).await.unwrap();
        let aggregate = ctx.commit().await.unwrap();
        assert!(aggregate.success);

        let kinds = server.await.unwrap();
        // initial patch, the one trigger-produced patch, then close.
        assert_eq!(
            kinds,
            vec![MessageKind::Execute, MessageKind::Execute, MessageKind::Close]
        );
    }
}
