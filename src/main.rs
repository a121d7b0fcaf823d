use std::path::PathBuf;

use argh::FromArgs;
use modelserver_gateway::{App, AppConfig};
use tracing::info;

/// A transaction-coordinating gateway that sits in front of a model-editing
/// Upstream service.
#[derive(FromArgs)]
struct Cli {
    /// path to a TOML config file. Falls back to built-in defaults if omitted.
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// override the port the gateway listens on.
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli: Cli = argh::from_env();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    let listen_port = config.listen_port;
    let app = App::new(config)?;
    let router = app.into_router(Vec::new());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], listen_port));
    info!(%addr, "gateway listening");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
