//! The batch failure helper: the single entry point used by every producer
//! of a batch failure (client proxy action loop, container monitor,
//! scheduler placement, trustee fill failures).

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{Batch, BatchState, HistoryEntry, Id};
use crate::store::Store;

/// Once a batch has failed this many times, it is terminal regardless of
/// `retryIfFailed`. Named per the design note that the scheduler's
/// pre-attempt increment and this threshold must be read together.
pub const FAILURE_ATTEMPT_THRESHOLD: u32 = 2;

pub struct FailureArgs {
    pub batch_id: Id,
    pub debug_info: String,
    pub ccagent: Option<Value>,
    pub current_state: BatchState,
    pub disable_retry_if_failed: bool,
}

/// Applies the retry/terminal classification and writes the transition
/// under an optimistic `state=current_state` predicate. Returns `false`
/// (no-op) if the batch was already terminal or another writer won the race.
pub async fn batch_failure(
    store: &dyn Store,
    args: FailureArgs,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    if args.current_state.is_terminal() {
        return Ok(false);
    }

    let batch: Batch = store
        .get_batch(&args.batch_id)
        .await?
        .ok_or(StoreError::NotFound)?;

    let terminal_by_attempts_or_flag =
        batch.attempts >= FAILURE_ATTEMPT_THRESHOLD || args.disable_retry_if_failed;

    let retry_allowed = if terminal_by_attempts_or_flag {
        false
    } else {
        store
            .get_experiment(&batch.experiment_id)
            .await?
            .map(|e| e.retry_if_failed())
            .unwrap_or(false)
    };

    let (new_state, new_node) = if retry_allowed {
        (BatchState::Registered, None)
    } else {
        (BatchState::Failed, batch.node.clone())
    };

    let history = HistoryEntry {
        state: new_state,
        time: now,
        debug_info: Some(args.debug_info),
        node: new_node.clone(),
        ccagent: args.ccagent,
    };

    store
        .apply_batch_transition(
            &args.batch_id,
            args.current_state,
            new_state,
            new_node,
            None,
            None,
            false,
            history,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerSpec, ContainerSettings, Engine, Experiment, ExecutionSettings, ExecutionSettingsInner, ImageSpec};
    use crate::store::InMemoryStore;

    fn experiment(retry_if_failed: bool) -> Experiment {
        Experiment {
            _id: Id::new(),
            username: "alice".into(),
            registration_time: Utc::now(),
            container: ContainerSpec {
                engine: Engine::Docker,
                settings: ContainerSettings {
                    image: ImageSpec { url: "img".into(), auth: None },
                    ram: 1024,
                    gpus: None,
                },
            },
            cli: Value::Null,
            execution: Some(ExecutionSettings {
                engine: "ccagency".into(),
                settings: ExecutionSettingsInner {
                    batch_concurrency_limit: 64,
                    retry_if_failed,
                    disable_pull: false,
                },
            }),
            protected_keys_voided: false,
        }
    }

    fn batch(experiment_id: Id, attempts: u32, state: BatchState) -> Batch {
        Batch {
            _id: Id::new(),
            experiment_id,
            username: "alice".into(),
            registration_time: Utc::now(),
            state,
            node: Some("n1".into()),
            attempts,
            used_gpus: None,
            mount: false,
            inputs: Default::default(),
            outputs: Default::default(),
            history: Vec::new(),
            protected_keys_voided: false,
            notifications_sent: false,
        }
    }

    #[tokio::test]
    async fn retries_when_under_threshold_and_retry_enabled() {
        let store = InMemoryStore::new();
        let exp = experiment(true);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, 1, BatchState::Processing);
        let id = b._id;
        store.insert_batch(b).await.unwrap();

        let changed = batch_failure(
            &store,
            FailureArgs {
                batch_id: id,
                debug_info: "boom".into(),
                ccagent: None,
                current_state: BatchState::Processing,
                disable_retry_if_failed: false,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(changed);
        let reloaded = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, BatchState::Registered);
        assert!(reloaded.node.is_none());
    }

    #[tokio::test]
    async fn terminal_at_threshold_regardless_of_retry() {
        let store = InMemoryStore::new();
        let exp = experiment(true);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, FAILURE_ATTEMPT_THRESHOLD, BatchState::Processing);
        let id = b._id;
        store.insert_batch(b).await.unwrap();

        batch_failure(
            &store,
            FailureArgs {
                batch_id: id,
                debug_info: "boom".into(),
                ccagent: None,
                current_state: BatchState::Processing,
                disable_retry_if_failed: false,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let reloaded = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, BatchState::Failed);
        assert_eq!(reloaded.node.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn disable_retry_flag_forces_terminal() {
        let store = InMemoryStore::new();
        let exp = experiment(true);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, 0, BatchState::Registered);
        let id = b._id;
        store.insert_batch(b).await.unwrap();

        batch_failure(
            &store,
            FailureArgs {
                batch_id: id,
                debug_info: "structurally invalid".into(),
                ccagent: None,
                current_state: BatchState::Registered,
                disable_retry_if_failed: true,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let reloaded = store.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, BatchState::Failed);
    }

    #[tokio::test]
    async fn terminal_current_state_is_a_no_op() {
        let store = InMemoryStore::new();
        let exp = experiment(true);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, 0, BatchState::Cancelled);
        let id = b._id;
        store.insert_batch(b).await.unwrap();

        let changed = batch_failure(
            &store,
            FailureArgs {
                batch_id: id,
                debug_info: "late failure report".into(),
                ccagent: None,
                current_state: BatchState::Cancelled,
                disable_retry_if_failed: false,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(!changed);
    }
}
