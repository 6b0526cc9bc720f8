use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque 96-bit identity shared by every persisted entity.
pub type Id = ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Docker,
    #[serde(rename = "nvidia-docker")]
    NvidiaDocker,
}

impl Engine {
    /// The only place that cares which container runtime backs which engine string.
    pub fn runtime(self) -> &'static str {
        match self {
            Engine::Docker => "runc",
            Engine::NvidiaDocker => "nvidia",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuRequirement {
    pub vram: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    pub image: ImageSpec,
    pub ram: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<Vec<GpuRequirement>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub engine: Engine,
    pub settings: ContainerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettingsInner {
    #[serde(default = "default_batch_concurrency_limit")]
    pub batch_concurrency_limit: u32,
    #[serde(default)]
    pub retry_if_failed: bool,
    #[serde(default)]
    pub disable_pull: bool,
}

fn default_batch_concurrency_limit() -> u32 {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub engine: String,
    pub settings: ExecutionSettingsInner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub _id: Id,
    pub username: String,
    pub registration_time: DateTime<Utc>,
    pub container: ContainerSpec,
    pub cli: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSettings>,
    #[serde(default)]
    pub protected_keys_voided: bool,
}

impl Experiment {
    pub fn batch_concurrency_limit(&self) -> u32 {
        self.execution
            .as_ref()
            .map(|e| e.settings.batch_concurrency_limit)
            .unwrap_or_else(default_batch_concurrency_limit)
    }

    pub fn retry_if_failed(&self) -> bool {
        self.execution
            .as_ref()
            .map(|e| e.settings.retry_if_failed)
            .unwrap_or(false)
    }

    pub fn disable_pull(&self) -> bool {
        self.execution
            .as_ref()
            .map(|e| e.settings.disable_pull)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Registered,
    Scheduled,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Succeeded | BatchState::Failed | BatchState::Cancelled
        )
    }

    /// Whether this state counts against an experiment's concurrency cap and
    /// against a node's resource bookkeeping.
    pub fn is_active(self) -> bool {
        matches!(self, BatchState::Scheduled | BatchState::Processing)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub state: BatchState,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccagent: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub _id: Id,
    pub experiment_id: Id,
    pub username: String,
    pub registration_time: DateTime<Utc>,
    pub state: BatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "usedGPUs")]
    pub used_gpus: Option<Vec<i64>>,
    #[serde(default)]
    pub mount: bool,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub protected_keys_voided: bool,
    #[serde(default)]
    pub notifications_sent: bool,
}

impl Batch {
    pub fn push_history(
        &mut self,
        state: BatchState,
        time: DateTime<Utc>,
        debug_info: Option<String>,
        ccagent: Option<Value>,
    ) {
        self.history.push(HistoryEntry {
            state,
            time,
            debug_info,
            node: self.node.clone(),
            ccagent,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHistoryEntry {
    pub state: Option<NodeState>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

/// In-memory mirror of a configured host, owned exclusively by its client proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMirror {
    pub _id: Id,
    pub node_name: String,
    #[serde(default)]
    pub state: Option<NodeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub history: Vec<NodeHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackToken {
    pub batch_id: Id,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub token_hash: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
