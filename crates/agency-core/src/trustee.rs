//! The trustee IPC protocol and a client for it. Both `trustee` (server
//! side) and `controller` (client side) share these types so the wire
//! format lives in exactly one place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::TrusteeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrusteeRequest {
    Store { secrets: HashMap<String, Value> },
    Delete { keys: Vec<String> },
    Collect { keys: Vec<String> },
    Inspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrusteeReplyState {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrusteeReply {
    pub state: TrusteeReplyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
    #[serde(default)]
    pub disable_retry: bool,
    #[serde(default)]
    pub inspect: bool,
}

impl TrusteeReply {
    pub fn success() -> Self {
        Self {
            state: TrusteeReplyState::Success,
            collected: None,
            debug_info: None,
            disable_retry: false,
            inspect: false,
        }
    }

    pub fn collected(secrets: HashMap<String, Value>) -> Self {
        Self {
            state: TrusteeReplyState::Success,
            collected: Some(secrets),
            debug_info: None,
            disable_retry: false,
            inspect: false,
        }
    }

    pub fn failed(debug_info: impl Into<String>, disable_retry: bool, inspect: bool) -> Self {
        Self {
            state: TrusteeReplyState::Failed,
            collected: None,
            debug_info: Some(debug_info.into()),
            disable_retry,
            inspect,
        }
    }
}

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Request/reply client over the trustee's filesystem socket. Reconnects on
/// any send/receive error and surfaces a transient failure so the caller
/// can retry after an `inspect`, per the IPC's stated failure contract.
pub struct TrusteeClient {
    socket_path: PathBuf,
    timeout: Duration,
    stream: Mutex<Option<UnixStream>>,
}

impl TrusteeClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            stream: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, req: &TrusteeRequest) -> Result<TrusteeReply, TrusteeError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|_| TrusteeError::Transient)?;
            *guard = Some(stream);
        }

        let result = self.roundtrip(guard.as_mut().expect("stream just set"), req).await;
        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn roundtrip(
        &self,
        stream: &mut UnixStream,
        req: &TrusteeRequest,
    ) -> Result<TrusteeReply, TrusteeError> {
        let mut payload = serde_json::to_vec(req).map_err(|e| TrusteeError::Permanent(e.to_string()))?;
        payload.push(b'\n');

        tokio::time::timeout(self.timeout, stream.write_all(&payload))
            .await
            .map_err(|_| TrusteeError::Transient)?
            .map_err(|_| TrusteeError::Transient)?;

        let mut reader = BufReader::new(&mut *stream);
        let mut line = String::new();
        let n = tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| TrusteeError::Transient)?
            .map_err(|_| TrusteeError::Transient)?;
        if n == 0 {
            return Err(TrusteeError::Transient);
        }

        serde_json::from_str(line.trim_end()).map_err(|_| TrusteeError::Transient)
    }

    pub async fn store(&self, secrets: HashMap<String, Value>) -> Result<(), TrusteeError> {
        let reply = self.request(&TrusteeRequest::Store { secrets }).await?;
        reply_to_unit(reply)
    }

    pub async fn delete(&self, keys: Vec<String>) -> Result<(), TrusteeError> {
        let reply = self.request(&TrusteeRequest::Delete { keys }).await?;
        reply_to_unit(reply)
    }

    pub async fn collect(&self, keys: Vec<String>) -> Result<HashMap<String, Value>, TrusteeError> {
        let reply = self.request(&TrusteeRequest::Collect { keys }).await?;
        match reply.state {
            TrusteeReplyState::Success => Ok(reply.collected.unwrap_or_default()),
            TrusteeReplyState::Failed => Err(reply_failure(reply)),
        }
    }

    pub async fn inspect(&self) -> Result<(), TrusteeError> {
        let reply = self.request(&TrusteeRequest::Inspect).await?;
        reply_to_unit(reply)
    }
}

fn reply_to_unit(reply: TrusteeReply) -> Result<(), TrusteeError> {
    match reply.state {
        TrusteeReplyState::Success => Ok(()),
        TrusteeReplyState::Failed => Err(reply_failure(reply)),
    }
}

fn reply_failure(reply: TrusteeReply) -> TrusteeError {
    let debug_info = reply.debug_info.unwrap_or_default();
    if reply.disable_retry {
        TrusteeError::Permanent(debug_info)
    } else {
        TrusteeError::Transient
    }
}
