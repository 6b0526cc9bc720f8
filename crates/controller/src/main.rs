mod client_proxy;
mod error;
mod host_driver;
mod scheduler;
mod signal_bus;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tracing::{info, warn};

use agency_core::config::AgencyConfig;
use agency_core::store::{InMemoryStore, Store};
use agency_core::store_mongo::MongoStore;
use agency_core::trustee::TrusteeClient;

use client_proxy::{ClientProxy, NodeRuntime};
use host_driver::{BollardHostDriver, HostDriver, NodeTls};
use scheduler::{Scheduler, SchedulerLoops};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _basic_tracing = agency_core::logging::init_basic("info,controller=debug");

    info!("starting controller v{}", env!("CARGO_PKG_VERSION"));

    let config = AgencyConfig::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    drop(_basic_tracing);
    agency_core::logging::init_from_config(&config.logging);

    info!("configuration loaded successfully");

    let store: Arc<dyn Store> = if config.mongo.host.is_empty() {
        warn!("mongo.host is empty, running against an in-memory store");
        Arc::new(InMemoryStore::new())
    } else {
        Arc::new(
            MongoStore::connect(&config.mongo)
                .await
                .context("failed to connect to mongo")?,
        )
    };

    let trustee = Arc::new(TrusteeClient::new(config.trustee.bind_socket_path.clone()));

    store.reset_nodes().await.context("failed to reset node mirrors")?;

    let mut nodes: HashMap<String, Arc<ClientProxy>> = HashMap::new();
    for (name, node_config) in &config.controller.docker.nodes {
        let tls = node_config.tls.as_ref().map(|t| NodeTls {
            ca_cert: t.ca_cert.clone(),
            client_cert: t.client_cert.clone(),
            client_key: t.client_key.clone(),
        });
        let driver: Arc<dyn HostDriver> = match BollardHostDriver::connect(&node_config.base_url, tls.as_ref()) {
            Ok(driver) => Arc::new(driver),
            Err(e) => {
                warn!(node = %name, error = %e, "failed to construct host driver, node will stay unregistered");
                continue;
            }
        };

        let runtime = NodeRuntime {
            environment: node_config.environment.clone(),
            network: node_config.network.clone(),
        };

        match ClientProxy::start(
            name.clone(),
            driver,
            Arc::clone(&store),
            Arc::clone(&trustee),
            runtime,
            config.broker.external_url.clone(),
            config.controller.agent_binary_path.clone(),
        )
        .await
        {
            Ok(Some(proxy)) => {
                nodes.insert(name.clone(), proxy);
            }
            Ok(None) => {
                info!(node = %name, "node started offline, will be picked up by the inspection loop");
            }
            Err(e) => {
                warn!(node = %name, error = %e, "failed to start client proxy");
            }
        }
    }

    let (scheduler, loops) = Scheduler::new(nodes, Arc::clone(&store), Arc::clone(&trustee), &config);

    let SchedulerLoops {
        scheduling_rx,
        inspection_rx,
        voiding_rx,
        notification_rx,
    } = loops;

    tokio::spawn(Arc::clone(&scheduler).run_ticker());
    tokio::spawn(Arc::clone(&scheduler).run_scheduling_loop(scheduling_rx));
    tokio::spawn(Arc::clone(&scheduler).run_inspection_loop(inspection_rx));
    tokio::spawn(Arc::clone(&scheduler).run_voiding_loop(voiding_rx));
    tokio::spawn(Arc::clone(&scheduler).run_notification_loop(notification_rx));

    let signal_socket = config.controller.bind_socket_path.clone();
    let signal_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if let Err(e) = signal_bus::serve(&signal_socket, signal_scheduler).await {
            warn!(error = %e, "signal bus exited with an error");
        }
    });

    // Kick an initial pass so work registered before this process started
    // doesn't wait a full tick.
    scheduler.schedule();

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ready", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8081")
        .await
        .context("failed to bind health/ready listener")?;
    info!(addr = "0.0.0.0:8081", "health/ready surface listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("health/ready server exited with an error")?;
        }
        _ = agency_core::logging::shutdown_signal() => {
            info!("controller shutting down");
        }
    }

    Ok(())
}
