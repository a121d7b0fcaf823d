//! Composition root: wires config, the Upstream client, the command/trigger
//! registries and the transaction manager into the shared state axum
//! handlers see.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::GatewayResult;
use crate::registry::{CommandProviderRegistry, TriggerProviderRegistry};
use crate::transaction::manager::TransactionManager;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub upstream: Arc<UpstreamClient>,
    pub command_registry: Arc<CommandProviderRegistry>,
    pub trigger_registry: Arc<TriggerProviderRegistry>,
    pub transaction_manager: Arc<TransactionManager>,
}

pub struct App {
    pub state: AppState,
}

impl App {
    pub fn new(config: AppConfig) -> GatewayResult<Self> {
        let config = Arc::new(config);
        let upstream = Arc::new(UpstreamClient::new(&config)?);
        let command_registry = Arc::new(CommandProviderRegistry::new());
        let trigger_registry = Arc::new(TriggerProviderRegistry::new());
        let transaction_manager = Arc::new(TransactionManager::new(
            upstream.clone(),
            command_registry.clone(),
            trigger_registry.clone(),
            &config,
        ));

        Ok(Self {
            state: AppState {
                config,
                upstream,
                command_registry,
                trigger_registry,
                transaction_manager,
            },
        })
    }

    pub fn command_registry(&self) -> &Arc<CommandProviderRegistry> {
        &self.state.command_registry
    }

    pub fn trigger_registry(&self) -> &Arc<TriggerProviderRegistry> {
        &self.state.trigger_registry
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.state.transaction_manager
    }

    pub fn into_router(self, plugins: Vec<crate::gateway::PluginRouterSpec>) -> axum::Router {
        crate::gateway::build_router(self.state, plugins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        let app = App::new(AppConfig::default()).unwrap();
        assert_eq!(app.transaction_manager().open_transaction_count(), 0);
    }
}
