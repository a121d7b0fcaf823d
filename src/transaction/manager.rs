//! Creates transactions by POSTing to Upstream, tracks at-most-one open
//! root transaction per model, and cleans up the map entry when a
//! transaction's socket closes.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::GatewayError;
use crate::model_uri::ModelUri;
use crate::registry::{CommandProviderRegistry, TriggerProviderRegistry};
use crate::transaction::context::TransactionContext;
use crate::upstream::UpstreamClient;

pub struct TransactionManager {
    upstream: Arc<UpstreamClient>,
    command_registry: Arc<CommandProviderRegistry>,
    trigger_registry: Arc<TriggerProviderRegistry>,
    max_trigger_iterations: u32,
    reply_timeout: std::time::Duration,
    transactions: Arc<DashMap<ModelUri, TransactionContext>>,
}

impl TransactionManager {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        command_registry: Arc<CommandProviderRegistry>,
        trigger_registry: Arc<TriggerProviderRegistry>,
        config: &AppConfig,
    ) -> Self {
        Self {
            upstream,
            command_registry,
            trigger_registry,
            max_trigger_iterations: config.max_trigger_iterations,
            reply_timeout: config.reply_timeout(),
            transactions: Arc::new(DashMap::new()),
        }
    }

    pub fn open_transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Opens a transaction on `model_uri`. If a root transaction is already
    /// open for this model, returns a nested child of it instead of talking
    /// to Upstream again (invariant §3.1).
    #[instrument(level = "debug", skip(self), fields(%model_uri))]
    pub async fn open_transaction(
        &self,
        model_uri: ModelUri,
    ) -> Result<TransactionContext, GatewayError> {
        if let Some(existing) = self.transactions.get(&model_uri) {
            return Ok(existing.nested_child());
        }

        let client_id = Uuid::new_v4();
        let transaction_uri = self
            .upstream
            .create_transaction(&model_uri, client_id)
            .await?;
        let socket = self.upstream.dial_transaction_socket(&transaction_uri).await?;

        let close_callback = {
            let transactions = self.transactions.clone();
            let model_uri = model_uri.clone();
            Box::new(move || {
                transactions.remove_if(&model_uri, |_, ctx| ctx.session_id() == client_id);
            })
        };

        let fresh = TransactionContext::open(
            model_uri.clone(),
            transaction_uri,
            client_id,
            socket,
            self.command_registry.clone(),
            self.trigger_registry.clone(),
            self.max_trigger_iterations,
            self.reply_timeout,
            close_callback,
        )
        .await?;

        match self.transactions.entry(model_uri) {
            Entry::Occupied(occupied) => {
                // Lost a race with a concurrent open for the same model.
                // Use the winner and discard ours.
                let winner = occupied.get().nested_child();
                drop(occupied);
                fresh.rollback("superseded by a concurrent open").await;
                Ok(winner)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_no_open_transactions() {
        let config = AppConfig::default();
        let upstream = Arc::new(UpstreamClient::new(&config).unwrap());
        let manager = TransactionManager::new(
            upstream,
            Arc::new(CommandProviderRegistry::new()),
            Arc::new(TriggerProviderRegistry::new()),
            &config,
        );
        assert_eq!(manager.open_transaction_count(), 0);
    }
}
