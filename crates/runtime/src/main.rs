//! Backbone entry point.

use runtime::{Backbone, Config, WelcomeBonus};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const WELCOME_BONUS: i64 = 25;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    let config = Config::from_env().expect("invalid configuration");

    // 2. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 3. Install Prometheus metrics recorder and its scrape endpoint
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
        .expect("failed to install Prometheus recorder");
    tracing::info!(addr = %config.metrics_addr, "metrics endpoint listening");

    // 4. Build the backbone and start the sample saga
    let mut backbone = Backbone::build(config)
        .await
        .expect("failed to start backbone");
    let manager = backbone
        .saga_manager()
        .register(WelcomeBonus::new(backbone.gateway().clone(), WELCOME_BONUS));
    backbone.run_sagas(manager);

    // 5. Serve until asked to stop
    shutdown_signal().await;
    backbone.shutdown().await;

    tracing::info!("backbone shut down gracefully");
}
