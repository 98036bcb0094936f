use anyhow::anyhow;
use modfleet_node::api::{self, AppState};
use modfleet_node::bus::{BusConnector, BusEndpoint, LocalBroker, MqttConnector};
use modfleet_node::devsched::DevScheduler;
use modfleet_node::execution::ProcessEngine;
use modfleet_node::observability::{init_metrics, init_tracing, TracingConfig};
use modfleet_node::{Node, NodeConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing(TracingConfig::from_env()).map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting modfleet-node");

    let metrics_state = match init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Failed to initialize metrics");
            None
        }
    };

    let config = NodeConfig::from_env();
    info!(
        node_id = %config.node_id,
        realm = %config.realm,
        max_modules = config.max_modules,
        standalone = config.standalone,
        "Loaded configuration"
    );

    // in-process broker, kept for standalone runs and closed on exit
    let broker = LocalBroker::new();
    let connector: Arc<dyn BusConnector> = match (&config.bus_uri, config.standalone) {
        (Some(uri), false) => {
            let endpoint = BusEndpoint::parse(uri)?;
            info!(broker = %endpoint, "Using external MQTT broker");
            Arc::new(MqttConnector::new(endpoint))
        }
        (uri, standalone) => {
            if standalone {
                if uri.is_some() {
                    warn!("MODFLEET_STANDALONE is set, ignoring MODFLEET_BUS_URI");
                }
                DevScheduler::spawn(&broker, &config.realm).await?;
            } else {
                warn!("No external transport configured, registration will wait for an in-process scheduler");
            }
            Arc::new(broker.clone())
        }
    };

    let engine = Arc::new(ProcessEngine::new(config.wasm_runner.clone()));
    let node = match Node::start(config.clone(), connector, engine).await {
        Ok(node) => node,
        Err(e) => {
            error!(node_id = %config.node_id, error = %e, "Failed to start node");
            broker.close();
            return Ok(ExitCode::FAILURE);
        }
    };

    let app = api::create_router(AppState {
        node: node.clone(),
        metrics_state,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    node.shutdown().await;
    broker.close();
    info!("modfleet-node stopped");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    if let Err(e) = wait_for_signal().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
