//! A reverse-proxying gateway and transaction coordinator that sits in front
//! of a model-editing Upstream service, accumulating recursive command and
//! trigger edits into a single incremental update per committed transaction.

pub mod app;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod model_uri;
pub mod protocol;
pub mod registry;
pub mod transaction;
pub mod upstream;

pub use app::App;
pub use config::AppConfig;
pub use errors::{GatewayError, GatewayResult};
