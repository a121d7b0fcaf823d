//! Maps a command type to either a substitute command/patch or a
//! transaction function that performs further edits on the executor that
//! dispatched it.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::errors::GatewayError;
use crate::model_uri::ModelUri;
use crate::protocol::{Command, CommandOrPatch};

/// Performs further edits on the executor that invoked it and reports
/// whether they all succeeded. Bound to `'static` because providers are
/// registered once and invoked from arbitrary tasks afterward.
pub type TransactionFunction = Arc<
    dyn Fn(Arc<dyn Executor>) -> BoxFuture<'static, Result<bool, GatewayError>> + Send + Sync,
>;

/// What a [`CommandProvider`] hands back for a given command: either a
/// substitute payload to send to Upstream directly, or a function to run
/// recursively inside a nested frame.
#[derive(Clone)]
pub enum CommandOutcome {
    Substitute(CommandOrPatch),
    Function(TransactionFunction),
}

/// The capability surface a transaction/trigger function is given: perform
/// more edits on the context that invoked it, without depending on the
/// concrete `TransactionContext` type.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        command: Command,
    ) -> Result<crate::protocol::ModelUpdateResult, GatewayError>;

    async fn apply_patch(
        &self,
        patch: Vec<crate::protocol::Operation>,
    ) -> Result<crate::protocol::ModelUpdateResult, GatewayError>;

    async fn open_transaction(&self) -> Result<Arc<dyn Executor>, GatewayError>;
}

pub trait CommandProvider: Send + Sync {
    fn provide(&self, model_uri: &ModelUri, command: &Command) -> CommandOutcome;
}

/// Read-mostly registry of command providers, keyed by command type.
/// Non-blocking insertion and lookup via `DashMap`; when multiple providers
/// are registered for the same type the first one registered wins.
#[derive(Default)]
pub struct CommandProviderRegistry {
    providers: DashMap<String, Arc<dyn CommandProvider>>,
}

impl CommandProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` for `command_type`. If a provider is already
    /// registered for that type, this is a no-op: first wins.
    pub fn register(&self, command_type: impl Into<String>, provider: Arc<dyn CommandProvider>) {
        self.providers.entry(command_type.into()).or_insert(provider);
    }

    pub fn has_provider(&self, command_type: &str) -> bool {
        self.providers.contains_key(command_type)
    }

    pub fn get_commands(&self, model_uri: &ModelUri, command: &Command) -> Option<CommandOutcome> {
        self.providers
            .get(&command.command_type)
            .map(|provider| provider.provide(model_uri, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;

    struct AlwaysPatch;

    impl CommandProvider for AlwaysPatch {
        fn provide(&self, _model_uri: &ModelUri, _command: &Command) -> CommandOutcome {
            CommandOutcome::Substitute(CommandOrPatch::Patch(vec![Operation {
                op: "replace".into(),
                path: "/name".into(),
                value: Some(serde_json::json!("X")),
                from: None,
            }]))
        }
    }

    struct AlwaysOtherPatch;

    impl CommandProvider for AlwaysOtherPatch {
        fn provide(&self, _model_uri: &ModelUri, _command: &Command) -> CommandOutcome {
            CommandOutcome::Substitute(CommandOrPatch::Patch(vec![]))
        }
    }

    #[test]
    fn has_provider_reflects_registration() {
        let registry = CommandProviderRegistry::new();
        assert!(!registry.has_provider("T1"));
        registry.register("T1", Arc::new(AlwaysPatch));
        assert!(registry.has_provider("T1"));
    }

    #[test]
    fn first_registration_wins() {
        let registry = CommandProviderRegistry::new();
        registry.register("T1", Arc::new(AlwaysPatch));
        registry.register("T1", Arc::new(AlwaysOtherPatch));

        let uri = ModelUri::new("file:/m1");
        let cmd = Command::new("T1");
        let outcome = registry.get_commands(&uri, &cmd).unwrap();
        match outcome {
            CommandOutcome::Substitute(CommandOrPatch::Patch(ops)) => {
                assert_eq!(ops.len(), 1, "AlwaysPatch registered first should win")
            }
            _ => panic!("expected a patch substitute"),
        }
    }

    #[test]
    fn unknown_type_has_no_outcome() {
        let registry = CommandProviderRegistry::new();
        let uri = ModelUri::new("file:/m1");
        let cmd = Command::new("Unknown");
        assert!(registry.get_commands(&uri, &cmd).is_none());
    }
}
