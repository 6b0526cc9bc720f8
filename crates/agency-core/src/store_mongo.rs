//! MongoDB-backed `Store` implementation. Mirrors the in-memory reference
//! implementation's semantics exactly; every optimistic-concurrency update
//! here is the `$set`/`$push` predicate the persistence contract calls for.

use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};

use crate::config::MongoConfig;
use crate::error::StoreError;
use crate::model::{
    Batch, BatchState, CallbackToken, Experiment, HistoryEntry, Id, NodeHistoryEntry, NodeMirror, NodeState,
};
use crate::store::{Store, StoreResult};

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(config: &MongoConfig) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(config.connection_uri()).await?;
        let db = client.database(&config.db);
        Ok(Self { db })
    }

    fn experiments(&self) -> Collection<Experiment> {
        self.db.collection("experiments")
    }

    fn batches(&self) -> Collection<Batch> {
        self.db.collection("batches")
    }

    fn nodes(&self) -> Collection<NodeMirror> {
        self.db.collection("nodes")
    }

    fn callback_tokens(&self) -> Collection<CallbackToken> {
        self.db.collection("callback_tokens")
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn insert_experiment(&self, experiment: Experiment) -> StoreResult<()> {
        self.experiments().insert_one(experiment).await.map_err(backend_err)?;
        Ok(())
    }

    async fn get_experiment(&self, id: &Id) -> StoreResult<Option<Experiment>> {
        self.experiments()
            .find_one(doc! { "_id": id })
            .await
            .map_err(backend_err)
    }

    async fn set_experiment_protected_keys_voided(&self, id: &Id) -> StoreResult<()> {
        self.experiments()
            .update_one(doc! { "_id": id }, doc! { "$set": { "protectedKeysVoided": true } })
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn unvoided_experiments(&self) -> StoreResult<Vec<Experiment>> {
        collect_cursor(
            self.experiments()
                .find(doc! { "protectedKeysVoided": false })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn all_batches_terminal_for_experiment(&self, experiment_id: &Id) -> StoreResult<bool> {
        let non_terminal = self
            .batches()
            .count_documents(doc! {
                "experimentId": experiment_id,
                "state": { "$nin": ["succeeded", "failed", "cancelled"] },
            })
            .await
            .map_err(backend_err)?;
        Ok(non_terminal == 0)
    }

    async fn insert_batch(&self, batch: Batch) -> StoreResult<()> {
        self.batches().insert_one(batch).await.map_err(backend_err)?;
        Ok(())
    }

    async fn get_batch(&self, id: &Id) -> StoreResult<Option<Batch>> {
        self.batches().find_one(doc! { "_id": id }).await.map_err(backend_err)
    }

    async fn fifo_registered_batches(&self) -> StoreResult<Vec<Batch>> {
        let options = mongodb::options::FindOptions::builder()
            .sort(doc! { "registrationTime": 1 })
            .build();
        collect_cursor(
            self.batches()
                .find(doc! { "state": "registered" })
                .with_options(options)
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn count_active_batches_for_experiment(&self, experiment_id: &Id) -> StoreResult<u64> {
        self.batches()
            .count_documents(doc! {
                "experimentId": experiment_id,
                "state": { "$in": ["scheduled", "processing"] },
            })
            .await
            .map_err(backend_err)
    }

    async fn active_batches_for_node(&self, node: &str) -> StoreResult<Vec<Batch>> {
        collect_cursor(
            self.batches()
                .find(doc! { "node": node, "state": { "$in": ["scheduled", "processing"] } })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn batches_assigned_to_node(&self, node: &str, states: &[BatchState]) -> StoreResult<Vec<Batch>> {
        let state_strs: Vec<String> = states
            .iter()
            .map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string())
            .collect();
        collect_cursor(
            self.batches()
                .find(doc! { "node": node, "state": { "$in": state_strs } })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn terminal_unvoided_batches(&self) -> StoreResult<Vec<Batch>> {
        collect_cursor(
            self.batches()
                .find(doc! {
                    "state": { "$in": ["succeeded", "failed", "cancelled"] },
                    "protectedKeysVoided": false,
                })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn set_batch_protected_keys_voided(&self, id: &Id) -> StoreResult<()> {
        self.batches()
            .update_one(doc! { "_id": id }, doc! { "$set": { "protectedKeysVoided": true } })
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn terminal_unnotified_batches(&self) -> StoreResult<Vec<Batch>> {
        collect_cursor(
            self.batches()
                .find(doc! {
                    "state": { "$in": ["succeeded", "failed", "cancelled"] },
                    "notificationsSent": false,
                })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn mark_notification_sent(&self, id: &Id) -> StoreResult<bool> {
        let result = self
            .batches()
            .update_one(
                doc! { "_id": id, "notificationsSent": false },
                doc! { "$set": { "notificationsSent": true } },
            )
            .await
            .map_err(backend_err)?;
        Ok(result.modified_count == 1)
    }

    async fn any_pending_work(&self) -> StoreResult<bool> {
        let count = self
            .batches()
            .count_documents(doc! {
                "$or": [
                    { "state": { "$nin": ["succeeded", "failed", "cancelled"] } },
                    { "protectedKeysVoided": false },
                    { "notificationsSent": false },
                ]
            })
            .await
            .map_err(backend_err)?;
        Ok(count > 0)
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
        let expected_str = serde_json::to_value(expected).unwrap().as_str().unwrap().to_string();
        let new_state_bson = bson::to_bson(&new_state).map_err(backend_err)?;
        let mut set_doc = doc! { "state": new_state_bson, "node": new_node.clone() };
        if let Some(gpus) = used_gpus {
            set_doc.insert("usedGPUs", gpus);
        }
        if let Some(m) = mount {
            set_doc.insert("mount", m);
        }
        let mut update = doc! {
            "$set": set_doc,
            "$push": { "history": bson::to_bson(&history).map_err(backend_err)? },
        };
        if increment_attempts {
            update.insert("$inc", doc! { "attempts": 1 });
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let result = self
            .batches()
            .find_one_and_update(doc! { "_id": id, "state": expected_str }, update)
            .with_options(options)
            .await
            .map_err(backend_err)?;
        Ok(result.is_some())
    }

    async fn reset_nodes(&self) -> StoreResult<()> {
        self.nodes().drop().await.map_err(backend_err)?;
        Ok(())
    }

    async fn insert_node_mirror(&self, node_name: &str) -> StoreResult<Id> {
        let mirror = NodeMirror {
            _id: Id::new(),
            node_name: node_name.to_string(),
            state: None,
            ram: None,
            cpus: None,
            history: Vec::new(),
        };
        let id = mirror._id;
        self.nodes().insert_one(mirror).await.map_err(backend_err)?;
        Ok(id)
    }

    async fn get_node_mirror(&self, node_name: &str) -> StoreResult<Option<NodeMirror>> {
        self.nodes()
            .find_one(doc! { "nodeName": node_name })
            .await
            .map_err(backend_err)
    }

    async fn set_node_online(&self, node_name: &str, ram: u64, cpus: u32, time: DateTime<Utc>) -> StoreResult<()> {
        let entry = NodeHistoryEntry { state: Some(NodeState::Online), time, debug_info: None };
        self.nodes()
            .update_one(
                doc! { "nodeName": node_name },
                doc! {
                    "$set": { "state": "online", "ram": ram as i64, "cpus": cpus as i32 },
                    "$push": { "history": bson::to_bson(&entry).map_err(backend_err)? },
                },
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn set_node_offline(&self, node_name: &str, time: DateTime<Utc>, debug_info: Option<String>) -> StoreResult<()> {
        let entry = NodeHistoryEntry { state: Some(NodeState::Offline), time, debug_info };
        self.nodes()
            .update_one(
                doc! { "nodeName": node_name },
                doc! {
                    "$set": { "state": "offline" },
                    "$push": { "history": bson::to_bson(&entry).map_err(backend_err)? },
                },
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn offline_nodes(&self) -> StoreResult<Vec<NodeMirror>> {
        collect_cursor(
            self.nodes()
                .find(doc! { "state": "offline" })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn online_nodes(&self) -> StoreResult<Vec<NodeMirror>> {
        collect_cursor(
            self.nodes()
                .find(doc! { "state": "online" })
                .await
                .map_err(backend_err)?,
        )
        .await
    }

    async fn insert_callback_token(&self, token: CallbackToken) -> StoreResult<()> {
        self.callback_tokens().insert_one(token).await.map_err(backend_err)?;
        Ok(())
    }
}

async fn collect_cursor<T>(cursor: mongodb::Cursor<T>) -> StoreResult<Vec<T>>
where
    T: serde::de::DeserializeOwned + Unpin + Send + Sync,
{
    use futures_util::stream::TryStreamExt;
    cursor.try_collect().await.map_err(backend_err)
}
