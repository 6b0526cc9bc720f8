use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use agency_core::trustee::{TrusteeReply, TrusteeRequest};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// The trustee's entire state: an in-memory `uuid -> value` map, never
/// persisted. A restart loses every secret it holds.
#[derive(Default)]
pub struct Vault {
    secrets: Mutex<HashMap<String, Value>>,
}

impl Vault {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn handle(&self, request: TrusteeRequest) -> TrusteeReply {
        match request {
            TrusteeRequest::Store { secrets } => {
                let mut vault = self.secrets.lock().await;
                if secrets.keys().any(|k| vault.contains_key(k)) {
                    return TrusteeReply::failed("one or more keys already present", true, false);
                }
                vault.extend(secrets);
                TrusteeReply::success()
            }
            TrusteeRequest::Delete { keys } => {
                let mut vault = self.secrets.lock().await;
                for key in &keys {
                    vault.remove(key);
                }
                TrusteeReply::success()
            }
            TrusteeRequest::Collect { keys } => {
                let vault = self.secrets.lock().await;
                let mut collected = HashMap::with_capacity(keys.len());
                for key in &keys {
                    match vault.get(key) {
                        Some(value) => {
                            collected.insert(key.clone(), value.clone());
                        }
                        None => {
                            return TrusteeReply::failed(
                                format!("missing secret key: {key}"),
                                true,
                                false,
                            );
                        }
                    }
                }
                TrusteeReply::collected(collected)
            }
            TrusteeRequest::Inspect => TrusteeReply::success(),
        }
    }
}

/// Binds the request/reply listener on `socket_path`, restricting it to
/// 0700 as required by the IPC contract, and serves connections until the
/// process exits.
pub async fn serve(socket_path: &str, vault: Arc<Vault>) -> anyhow::Result<()> {
    let path = Path::new(socket_path);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    info!(socket = socket_path, "trustee listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let vault = Arc::clone(&vault);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, vault).await {
                warn!(error = %e, "trustee connection ended with an error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, vault: Arc<Vault>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }

        let reply = match serde_json::from_str::<TrusteeRequest>(line.trim_end()) {
            Ok(request) => vault.handle(request).await,
            Err(e) => {
                error!(error = %e, "malformed trustee request");
                TrusteeReply::failed(format!("malformed request: {e}"), true, false)
            }
        };

        let mut payload = serde_json::to_vec(&reply)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
}
