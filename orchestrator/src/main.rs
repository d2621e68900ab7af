//! Fleet orchestrator - serves model workers on demand.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_orchestrator::{api, AppState, Config, Orchestrator, SqliteRegistry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("fleet-orchestrator {}", VERSION);
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set FLEET__ORCHESTRATOR__MODEL_DIR and \
             FLEET__ORCHESTRATOR__WORKER_BINARY environment variables.",
            e
        )
    })?;
    let instance_id = config.instance.resolve_id();
    tracing::info!("Starting fleet-orchestrator {} as {}", VERSION, instance_id);

    let registry = Arc::new(SqliteRegistry::open(&config.registry.path)?);
    tracing::info!("Registry at {}", config.registry.path);

    let orchestrator = Arc::new(Orchestrator::with_defaults(
        instance_id,
        config.orchestrator.clone(),
        registry,
    ));
    let gc_handle = orchestrator.spawn_gc_loop();

    let state = Arc::new(AppState::new(config.clone(), orchestrator.clone()));
    let app = api::app(state);

    // Start server
    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    orchestrator.stop_all().await;
    gc_handle.abort();

    served?;
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, stopping workers");
}
