//! The persistence port: every query/update the controller needs, stated as
//! operations on collections of documents. `InMemoryStore` is a faithful
//! reference implementation used by unit tests and by any self-check run
//! without a live database; `MongoStore` (see `store_mongo`) backs
//! production deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Batch, BatchState, CallbackToken, Experiment, HistoryEntry, Id, NodeMirror, NodeState};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_experiment(&self, experiment: Experiment) -> StoreResult<()>;
    async fn get_experiment(&self, id: &Id) -> StoreResult<Option<Experiment>>;
    async fn set_experiment_protected_keys_voided(&self, id: &Id) -> StoreResult<()>;
    async fn unvoided_experiments(&self) -> StoreResult<Vec<Experiment>>;
    async fn all_batches_terminal_for_experiment(&self, experiment_id: &Id) -> StoreResult<bool>;

    async fn insert_batch(&self, batch: Batch) -> StoreResult<()>;
    async fn get_batch(&self, id: &Id) -> StoreResult<Option<Batch>>;
    async fn fifo_registered_batches(&self) -> StoreResult<Vec<Batch>>;
    async fn count_active_batches_for_experiment(&self, experiment_id: &Id) -> StoreResult<u64>;
    async fn active_batches_for_node(&self, node: &str) -> StoreResult<Vec<Batch>>;
    async fn batches_assigned_to_node(&self, node: &str, states: &[BatchState]) -> StoreResult<Vec<Batch>>;
    async fn terminal_unvoided_batches(&self) -> StoreResult<Vec<Batch>>;
    async fn set_batch_protected_keys_voided(&self, id: &Id) -> StoreResult<()>;
    async fn terminal_unnotified_batches(&self) -> StoreResult<Vec<Batch>>;
    async fn mark_notification_sent(&self, id: &Id) -> StoreResult<bool>;
    async fn any_pending_work(&self) -> StoreResult<bool>;

    /// Atomically applies a state transition if, and only if, the batch's
    /// persisted state still equals `expected` (optimistic concurrency).
    /// Returns `false` if another writer already moved the batch.
    async fn apply_batch_transition(
        &self,
        id: &Id,
        expected: BatchState,
        new_state: BatchState,
        new_node: Option<String>,
        used_gpus: Option<Vec<i64>>,
        mount: Option<bool>,
        increment_attempts: bool,
        history: HistoryEntry,
    ) -> StoreResult<bool>;

    async fn reset_nodes(&self) -> StoreResult<()>;
    async fn insert_node_mirror(&self, node_name: &str) -> StoreResult<Id>;
    async fn get_node_mirror(&self, node_name: &str) -> StoreResult<Option<NodeMirror>>;
    async fn set_node_online(&self, node_name: &str, ram: u64, cpus: u32, time: DateTime<Utc>) -> StoreResult<()>;
    async fn set_node_offline(&self, node_name: &str, time: DateTime<Utc>, debug_info: Option<String>) -> StoreResult<()>;
    async fn offline_nodes(&self) -> StoreResult<Vec<NodeMirror>>;
    async fn online_nodes(&self) -> StoreResult<Vec<NodeMirror>>;

    async fn insert_callback_token(&self, token: CallbackToken) -> StoreResult<()>;
}

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Data {
        experiments: HashMap<Id, Experiment>,
        batches: HashMap<Id, Batch>,
        nodes: HashMap<String, NodeMirror>,
        callback_tokens: Vec<CallbackToken>,
    }

    /// Reference `Store` implementation backed by in-process maps, standing
    /// in for a document database in tests and self-checks.
    pub struct InMemoryStore {
        data: Mutex<Data>,
    }

    impl Default for InMemoryStore {
        fn default() -> Self {
            Self { data: Mutex::new(Data::default()) }
        }
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn insert_experiment(&self, experiment: Experiment) -> StoreResult<()> {
            self.data.lock().await.experiments.insert(experiment._id, experiment);
            Ok(())
        }

        async fn get_experiment(&self, id: &Id) -> StoreResult<Option<Experiment>> {
            Ok(self.data.lock().await.experiments.get(id).cloned())
        }

        async fn set_experiment_protected_keys_voided(&self, id: &Id) -> StoreResult<()> {
            let mut data = self.data.lock().await;
            if let Some(e) = data.experiments.get_mut(id) {
                e.protected_keys_voided = true;
            }
            Ok(())
        }

        async fn unvoided_experiments(&self) -> StoreResult<Vec<Experiment>> {
            Ok(self
                .data
                .lock()
                .await
                .experiments
                .values()
                .filter(|e| !e.protected_keys_voided)
                .cloned()
                .collect())
        }

        async fn all_batches_terminal_for_experiment(&self, experiment_id: &Id) -> StoreResult<bool> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .filter(|b| &b.experiment_id == experiment_id)
                .all(|b| b.state.is_terminal()))
        }

        async fn insert_batch(&self, batch: Batch) -> StoreResult<()> {
            self.data.lock().await.batches.insert(batch._id, batch);
            Ok(())
        }

        async fn get_batch(&self, id: &Id) -> StoreResult<Option<Batch>> {
            Ok(self.data.lock().await.batches.get(id).cloned())
        }

        async fn fifo_registered_batches(&self) -> StoreResult<Vec<Batch>> {
            let data = self.data.lock().await;
            let mut batches: Vec<Batch> = data
                .batches
                .values()
                .filter(|b| b.state == BatchState::Registered)
                .cloned()
                .collect();
            batches.sort_by_key(|b| b.registration_time);
            Ok(batches)
        }

        async fn count_active_batches_for_experiment(&self, experiment_id: &Id) -> StoreResult<u64> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .filter(|b| &b.experiment_id == experiment_id && b.state.is_active())
                .count() as u64)
        }

        async fn active_batches_for_node(&self, node: &str) -> StoreResult<Vec<Batch>> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .filter(|b| b.state.is_active() && b.node.as_deref() == Some(node))
                .cloned()
                .collect())
        }

        async fn batches_assigned_to_node(&self, node: &str, states: &[BatchState]) -> StoreResult<Vec<Batch>> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .filter(|b| b.node.as_deref() == Some(node) && states.contains(&b.state))
                .cloned()
                .collect())
        }

        async fn terminal_unvoided_batches(&self) -> StoreResult<Vec<Batch>> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .filter(|b| b.state.is_terminal() && !b.protected_keys_voided)
                .cloned()
                .collect())
        }

        async fn set_batch_protected_keys_voided(&self, id: &Id) -> StoreResult<()> {
            let mut data = self.data.lock().await;
            if let Some(b) = data.batches.get_mut(id) {
                b.protected_keys_voided = true;
            }
            Ok(())
        }

        async fn terminal_unnotified_batches(&self) -> StoreResult<Vec<Batch>> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .filter(|b| b.state.is_terminal() && !b.notifications_sent)
                .cloned()
                .collect())
        }

        async fn mark_notification_sent(&self, id: &Id) -> StoreResult<bool> {
            let mut data = self.data.lock().await;
            match data.batches.get_mut(id) {
                Some(b) if !b.notifications_sent => {
                    b.notifications_sent = true;
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Ok(false),
            }
        }

        async fn any_pending_work(&self) -> StoreResult<bool> {
            let data = self.data.lock().await;
            Ok(data
                .batches
                .values()
                .any(|b| !b.state.is_terminal() || !b.protected_keys_voided || !b.notifications_sent))
        }

        async fn apply_batch_transition(
            &self,
            id: &Id,
            expected: BatchState,
            new_state: BatchState,
            new_node: Option<String>,
            used_gpus: Option<Vec<i64>>,
            mount: Option<bool>,
            increment_attempts: bool,
            history: HistoryEntry,
        ) -> StoreResult<bool> {
            let mut data = self.data.lock().await;
            let Some(batch) = data.batches.get_mut(id) else {
                return Ok(false);
            };
            if batch.state != expected {
                return Ok(false);
            }
            batch.state = new_state;
            if new_node.is_some() || !matches!(new_state, BatchState::Registered) {
                batch.node = new_node;
            } else {
                batch.node = None;
            }
            if let Some(gpus) = used_gpus {
                batch.used_gpus = Some(gpus);
            }
            if let Some(m) = mount {
                batch.mount = m;
            }
            if increment_attempts {
                batch.attempts += 1;
            }
            batch.history.push(history);
            Ok(true)
        }

        async fn reset_nodes(&self) -> StoreResult<()> {
            self.data.lock().await.nodes.clear();
            Ok(())
        }

        async fn insert_node_mirror(&self, node_name: &str) -> StoreResult<Id> {
            let id = Id::new();
            let mirror = NodeMirror {
                _id: id,
                node_name: node_name.to_string(),
                state: None,
                ram: None,
                cpus: None,
                history: Vec::new(),
            };
            self.data.lock().await.nodes.insert(node_name.to_string(), mirror);
            Ok(id)
        }

        async fn get_node_mirror(&self, node_name: &str) -> StoreResult<Option<NodeMirror>> {
            Ok(self.data.lock().await.nodes.get(node_name).cloned())
        }

        async fn set_node_online(&self, node_name: &str, ram: u64, cpus: u32, time: DateTime<Utc>) -> StoreResult<()> {
            let mut data = self.data.lock().await;
            let mirror = data.nodes.get_mut(node_name).ok_or(StoreError::NotFound)?;
            mirror.state = Some(NodeState::Online);
            mirror.ram = Some(ram);
            mirror.cpus = Some(cpus);
            mirror.history.push(crate::model::NodeHistoryEntry {
                state: Some(NodeState::Online),
                time,
                debug_info: None,
            });
            Ok(())
        }

        async fn set_node_offline(&self, node_name: &str, time: DateTime<Utc>, debug_info: Option<String>) -> StoreResult<()> {
            let mut data = self.data.lock().await;
            let mirror = data.nodes.get_mut(node_name).ok_or(StoreError::NotFound)?;
            mirror.state = Some(NodeState::Offline);
            mirror.history.push(crate::model::NodeHistoryEntry {
                state: Some(NodeState::Offline),
                time,
                debug_info,
            });
            Ok(())
        }

        async fn offline_nodes(&self) -> StoreResult<Vec<NodeMirror>> {
            let data = self.data.lock().await;
            Ok(data
                .nodes
                .values()
                .filter(|n| n.state == Some(NodeState::Offline))
                .cloned()
                .collect())
        }

        async fn online_nodes(&self) -> StoreResult<Vec<NodeMirror>> {
            let data = self.data.lock().await;
            Ok(data
                .nodes
                .values()
                .filter(|n| n.state == Some(NodeState::Online))
                .cloned()
                .collect())
        }

        async fn insert_callback_token(&self, token: CallbackToken) -> StoreResult<()> {
            self.data.lock().await.callback_tokens.push(token);
            Ok(())
        }
    }
}

pub use memory::InMemoryStore;
