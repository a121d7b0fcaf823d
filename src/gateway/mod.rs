//! Routing, backstop computation, HTTP reverse-proxy and WebSocket bridging
//! in front of Upstream (§4.5).

pub mod proxy;
pub mod routes;
pub mod ws_bridge;

pub use routes::{is_backstopped, is_standard_route, PluginRoute, PluginRouterSpec, STANDARD_ROUTES};

use axum::Router;
use tracing::info;

use crate::app::AppState;

/// Builds the full axum router: the `/api/v<version>` prefix carrying every
/// plug-in's backstopped routes, falling back to a WebSocket bridge or
/// verbatim HTTP reverse-proxy to Upstream for everything else, both inside
/// and outside that prefix.
pub fn build_router(state: AppState, plugins: Vec<PluginRouterSpec>) -> Router {
    let prefix = state.config.api_prefix();
    let mut api_router: Router<AppState> = Router::new();

    for plugin in plugins {
        let router_id = plugin.router_id.clone().unwrap_or_else(|| "<anonymous>".to_string());
        let mut plugin_router: Router<AppState> = Router::new();
        for route in plugin.backstopped_routes() {
            info!(router_id = %router_id, path = route.path, "registering backstopped plug-in route");
            plugin_router = plugin_router.route(route.path, route.handler.clone());
        }
        if let Some(layer) = &plugin.layer {
            plugin_router = layer(plugin_router);
        }
        api_router = api_router.merge(plugin_router);
    }

    let api_router = api_router.fallback(proxy::handle);

    Router::new()
        .nest(&prefix, api_router)
        .fallback(proxy::handle)
        .with_state(state)
}
