//! Entry point for the `husk-gateway` HTTP server.

use husk_executor::{HuskPaths, Orchestrator};
use husk_gateway::{reaper, routes::create_router};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("husk=info")))
        .init();

    let addr = std::env::var("HUSK_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:3456".to_owned());

    let paths = HuskPaths::from_env();
    info!(home = %paths.base().display(), "using husk home");
    let orchestrator = Orchestrator::system(paths);
    let _reaper = reaper::spawn(orchestrator.clone(), reaper::REAP_INTERVAL);
    let app = create_router(orchestrator);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "husk-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
