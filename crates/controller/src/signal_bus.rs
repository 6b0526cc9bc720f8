//! One-way, connectionless wake-up endpoint for the broker (and any other
//! internal producer) to nudge the scheduling loop, per spec §6. Grounded in
//! the trustee's `server.rs` socket-bind/permission dance, adapted from a
//! connection-oriented listener to a single datagram socket since the wire
//! contract here is fire-and-forget, not request/reply.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::UnixDatagram;
use tracing::{info, warn};

use crate::scheduler::Scheduler;

#[derive(Debug, Deserialize)]
struct SignalMessage {
    destination: String,
}

/// Binds the signal socket at `socket_path` (0700) and serves datagrams until
/// the process exits. Every `{"destination":"scheduler"}` message triggers a
/// best-effort `Scheduler::schedule()`; anything else is ignored.
pub async fn serve(socket_path: &str, scheduler: Arc<Scheduler>) -> anyhow::Result<()> {
    let path = Path::new(socket_path);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let socket = UnixDatagram::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    info!(socket = socket_path, "signal bus listening");

    let mut buf = vec![0u8; 4096];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "signal bus recv failed");
                continue;
            }
        };

        match serde_json::from_slice::<SignalMessage>(&buf[..n]) {
            Ok(msg) if msg.destination == "scheduler" => scheduler.schedule(),
            Ok(msg) => warn!(destination = %msg.destination, "signal bus ignoring unknown destination"),
            Err(e) => warn!(error = %e, "malformed signal bus message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_core::store::InMemoryStore;
    use agency_core::trustee::TrusteeClient;
    use std::collections::HashMap;

    #[tokio::test]
    async fn schedule_destination_wakes_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("signal.sock");
        let socket_str = socket_path.to_str().unwrap().to_string();

        let store = Arc::new(InMemoryStore::new());
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));
        let config = agency_core::config::AgencyConfig::default();
        let (scheduler, mut loops) = Scheduler::new(HashMap::new(), store, trustee, &config);

        let serve_path = socket_str.clone();
        let scheduler_clone = Arc::clone(&scheduler);
        tokio::spawn(async move {
            serve(&serve_path, scheduler_clone).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(br#"{"destination":"scheduler"}"#, &socket_path)
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), loops.scheduling_rx.recv())
            .await
            .expect("scheduling signal should arrive")
            .expect("channel should stay open");
    }

    #[tokio::test]
    async fn unknown_destination_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("signal.sock");
        let socket_str = socket_path.to_str().unwrap().to_string();

        let store = Arc::new(InMemoryStore::new());
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));
        let config = agency_core::config::AgencyConfig::default();
        let (scheduler, mut loops) = Scheduler::new(HashMap::new(), store, trustee, &config);

        let serve_path = socket_str.clone();
        let scheduler_clone = Arc::clone(&scheduler);
        tokio::spawn(async move {
            serve(&serve_path, scheduler_clone).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(br#"{"destination":"broker"}"#, &socket_path)
            .await
            .unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            loops.scheduling_rx.recv(),
        )
        .await;
        assert!(result.is_err(), "no scheduling signal should have arrived");
    }
}
