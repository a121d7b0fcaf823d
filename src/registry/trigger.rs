//! Given a just-applied delta of patch operations on a model, returns
//! further patches (or a transaction function) to apply. Consulted in a
//! loop during commit until quiescence (see `transaction::context::commit`).

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::model_uri::ModelUri;
use crate::protocol::{ModelUpdateResult, Operation};
use crate::registry::command::{Executor, TransactionFunction};

#[derive(Clone)]
pub enum TriggerOutcome {
    Patch(Vec<Operation>),
    Function(TransactionFunction),
}

impl TriggerOutcome {
    pub fn empty() -> Self {
        TriggerOutcome::Patch(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TriggerOutcome::Patch(ops) if ops.is_empty())
    }
}

pub trait TriggerProvider: Send + Sync {
    fn triggers(&self, model_uri: &ModelUri, delta: &[Operation]) -> TriggerOutcome;
}

/// Registry of trigger providers, keyed by model URI. More than one
/// provider may be registered per model (a supplemented multiplicity; the
/// per-call contract is still the single `Operation[] | TransactionFunction`
/// the design specifies) — `get_triggers` combines every non-empty result
/// into one outcome: pure-patch results are concatenated, and if any
/// provider returned a function the whole round is folded into a single
/// function that applies the concatenated patch and then runs each
/// registered function in registration order, merging their results.
#[derive(Default)]
pub struct TriggerProviderRegistry {
    providers: DashMap<ModelUri, Vec<Arc<dyn TriggerProvider>>>,
}

impl TriggerProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model_uri: ModelUri, provider: Arc<dyn TriggerProvider>) {
        self.providers.entry(model_uri).or_default().push(provider);
    }

    pub fn get_triggers(&self, model_uri: &ModelUri, delta: &[Operation]) -> TriggerOutcome {
        let providers = match self.providers.get(model_uri) {
            Some(providers) => providers.clone(),
            None => return TriggerOutcome::empty(),
        };

        let outcomes: Vec<TriggerOutcome> = providers
            .iter()
            .map(|provider| provider.triggers(model_uri, delta))
            .filter(|outcome| !outcome.is_empty())
            .collect();

        if outcomes.is_empty() {
            return TriggerOutcome::empty();
        }

        let mut patch = Vec::new();
        let mut functions: Vec<TransactionFunction> = Vec::new();
        for outcome in outcomes {
            match outcome {
                TriggerOutcome::Patch(ops) => patch.extend(ops),
                TriggerOutcome::Function(function) => functions.push(function),
            }
        }

        if functions.is_empty() {
            return TriggerOutcome::Patch(patch);
        }

        let combined: TransactionFunction = Arc::new(move |executor: Arc<dyn Executor>| {
            let patch = patch.clone();
            let functions = functions.clone();
            Box::pin(async move {
                let mut aggregate = ModelUpdateResult::success(vec![]);
                if !patch.is_empty() {
                    aggregate.merge(executor.apply_patch(patch).await?);
                    if !aggregate.success {
                        return Ok(false);
                    }
                }
                for function in functions {
                    if !function(executor.clone()).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }) as BoxFuture<'static, Result<bool, crate::errors::GatewayError>>
        });

        TriggerOutcome::Function(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpTrigger;

    impl TriggerProvider for NoOpTrigger {
        fn triggers(&self, _model_uri: &ModelUri, _delta: &[Operation]) -> TriggerOutcome {
            TriggerOutcome::empty()
        }
    }

    struct OneShotTrigger;

    impl TriggerProvider for OneShotTrigger {
        fn triggers(&self, _model_uri: &ModelUri, _delta: &[Operation]) -> TriggerOutcome {
            TriggerOutcome::Patch(vec![Operation {
                op: "replace".into(),
                path: "/derived".into(),
                value: Some(serde_json::json!(true)),
                from: None,
            }])
        }
    }

    #[test]
    fn no_providers_returns_empty() {
        let registry = TriggerProviderRegistry::new();
        let uri = ModelUri::new("file:/m1");
        assert!(registry.get_triggers(&uri, &[]).is_empty());
    }

    #[test]
    fn noop_provider_yields_empty_outcome() {
        let registry = TriggerProviderRegistry::new();
        let uri = ModelUri::new("file:/m1");
        registry.register(uri.clone(), Arc::new(NoOpTrigger));

        assert!(registry.get_triggers(&uri, &[]).is_empty());
    }

    #[test]
    fn single_patch_provider_is_passed_through() {
        let registry = TriggerProviderRegistry::new();
        let uri = ModelUri::new("file:/m1");
        registry.register(uri.clone(), Arc::new(OneShotTrigger));

        match registry.get_triggers(&uri, &[]) {
            TriggerOutcome::Patch(ops) => assert_eq!(ops.len(), 1),
            TriggerOutcome::Function(_) => panic!("expected a patch outcome"),
        }
    }

    #[test]
    fn multiple_patch_providers_are_concatenated() {
        let registry = TriggerProviderRegistry::new();
        let uri = ModelUri::new("file:/m1");
        registry.register(uri.clone(), Arc::new(OneShotTrigger));
        registry.register(uri.clone(), Arc::new(OneShotTrigger));

        match registry.get_triggers(&uri, &[]) {
            TriggerOutcome::Patch(ops) => assert_eq!(ops.len(), 2),
            TriggerOutcome::Function(_) => panic!("expected a patch outcome"),
        }
    }
}
