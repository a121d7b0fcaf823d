//! STANDARD_ROUTES and the backstop-set computation described in §4.5.

use axum::routing::MethodRouter;
use reqwest::Method;

use crate::app::AppState;

/// Paths relative to `/api/v<version>` that Upstream is known to serve.
pub const STANDARD_ROUTES: &[&str] = &[
    "/models",
    "/modelelement",
    "/modeluris",
    "/server/ping",
    "/server/configure",
    "/subscribe",
    "/close",
    "/save",
    "/saveall",
    "/undo",
    "/redo",
    "/transaction",
    "/validation",
    "/validation/constraints",
    "/typeschema",
    "/uischema",
];

/// Is `path` (relative to `/api/v<version>`, i.e. with that prefix already
/// stripped) one Upstream is known to serve on its own?
pub fn is_standard_route(path: &str) -> bool {
    STANDARD_ROUTES.contains(&path)
}

/// `is_backstopped(path, forward_to_upstream)`: whether a plug-in-handled
/// route must be served locally instead of forwarded.
///
/// `!is_standard_route(path) || !forward_to_upstream`: a non-standard route
/// is always backstopped regardless of the flag; a standard route is
/// backstopped only when the plug-in explicitly opted out of Upstream
/// handling it (S6).
pub fn is_backstopped(path: &str, forward_to_upstream: bool) -> bool {
    !is_standard_route(path) || !forward_to_upstream
}

/// One route a plug-in contributes: method, path (relative to the
/// `/api/v<version>` prefix), and its handler.
pub struct PluginRoute {
    pub method: Method,
    pub path: &'static str,
    pub handler: MethodRouter<AppState>,
}

/// A plug-in's isolated router: an optional id for diagnostics, whether it
/// wants Upstream to continue serving its standard-route paths, and the
/// routes it contributes.
pub struct PluginRouterSpec {
    pub router_id: Option<String>,
    pub forward_to_upstream: bool,
    pub routes: Vec<PluginRoute>,
    pub layer: Option<Box<dyn Fn(axum::Router<AppState>) -> axum::Router<AppState> + Send + Sync>>,
}

impl PluginRouterSpec {
    pub fn new(forward_to_upstream: bool) -> Self {
        Self {
            router_id: None,
            forward_to_upstream,
            routes: Vec::new(),
            layer: None,
        }
    }

    pub fn with_router_id(mut self, router_id: impl Into<String>) -> Self {
        self.router_id = Some(router_id.into());
        self
    }

    pub fn with_route(mut self, method: Method, path: &'static str, handler: MethodRouter<AppState>) -> Self {
        self.routes.push(PluginRoute { method, path, handler });
        self
    }

    /// Which of this router's routes are backstopped, given its
    /// `forward_to_upstream` flag.
    pub fn backstopped_routes(&self) -> Vec<&PluginRoute> {
        self.routes
            .iter()
            .filter(|route| is_backstopped(route.path, self.forward_to_upstream))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_route_forwarded_by_default() {
        assert!(!is_backstopped("/models", true));
    }

    #[test]
    fn standard_route_backstopped_when_explicitly_opted_out() {
        assert!(is_backstopped("/models", false));
    }

    #[test]
    fn non_standard_route_always_backstopped() {
        assert!(is_backstopped("/foo", true));
        assert!(is_backstopped("/foo", false));
    }

    #[test]
    fn plugin_spec_reports_only_backstopped_routes() {
        let spec = PluginRouterSpec::new(true)
            .with_route(Method::GET, "/foo", axum::routing::get(|| async { "ok" }))
            .with_route(Method::GET, "/models", axum::routing::get(|| async { "ok" }));

        let backstopped: Vec<&str> = spec.backstopped_routes().iter().map(|r| r.path).collect();
        assert_eq!(backstopped, vec!["/foo"]);
    }
}
