//! Client proxy: the controller-side agent that drives one node's
//! container engine, per spec §4.4. Owns a host driver, a bounded FIFO
//! action queue, a container-monitor loop, and the node's mirror document.
//! Grounded in the teacher's `agent/pool.rs` ownership/bounded-pool style,
//! generalized from "one gRPC-connected agent" to "one Docker host driver".

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agency_core::failure::{batch_failure, FailureArgs};
use agency_core::model::{Batch, BatchState, CallbackToken, Experiment};
use agency_core::store::Store;
use agency_core::trustee::TrusteeClient;
use agency_core::{blue, callback, secrets};
use bson::oid::ObjectId;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::error::ActionError;
use crate::host_driver::{
    ContainerFilter, CreateSpec, HostDriver, LogStream, RegistryAuth,
};

/// `check_for_batches`/container-start concurrency, per spec §4.4.
const WORKER_POOL_SIZE: usize = 4;
/// Container monitor polling cadence, per spec §4.4.
const CHECK_RUNNING_CONTAINERS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const ACTION_QUEUE_CAPACITY: usize = 256;

/// `(image url, registry auth) -> batches ready to start on that image`,
/// the grouping `check_for_batches` pulls by.
type ImageGroups = HashMap<(String, Option<(String, String)>), Vec<(Batch, Experiment)>>;

#[derive(Debug, Clone, Copy)]
pub enum Action {
    Inspect,
    CheckForBatches,
    CleanUp,
}

pub struct NodeRuntime {
    pub environment: HashMap<String, String>,
    pub network: Option<String>,
}

pub struct ClientProxy {
    pub node_name: String,
    driver: Arc<dyn HostDriver>,
    store: Arc<dyn Store>,
    trustee: Arc<TrusteeClient>,
    runtime: NodeRuntime,
    broker_external_url: String,
    agent_binary_path: String,
    action_tx: Mutex<mpsc::Sender<Action>>,
    monitor_tx: Mutex<mpsc::Sender<(String, ObjectId)>>,
    torn_down: AtomicBool,
}

impl ClientProxy {
    /// Startup protocol per spec §4.4: insert a mirror, open the driver,
    /// reconcile orphaned batches, and on success start the action and
    /// monitor loops and mark the node online.
    pub async fn start(
        node_name: String,
        driver: Arc<dyn HostDriver>,
        store: Arc<dyn Store>,
        trustee: Arc<TrusteeClient>,
        runtime: NodeRuntime,
        broker_external_url: String,
        agent_binary_path: String,
    ) -> anyhow::Result<Option<Arc<Self>>> {
        if store.get_node_mirror(&node_name).await?.is_none() {
            store.insert_node_mirror(&node_name).await?;
        }

        let info = match driver.info().await {
            Ok(info) => info,
            Err(e) => {
                store.set_node_offline(&node_name, Utc::now(), Some(e.diagnostic().to_string())).await?;
                warn!(node = %node_name, error = %e, "node driver unreachable at startup, marking offline");
                return Ok(None);
            }
        };

        let (action_tx, action_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
        let (monitor_tx, monitor_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);

        let proxy = Arc::new(Self {
            node_name: node_name.clone(),
            driver,
            store,
            trustee,
            runtime,
            broker_external_url,
            agent_binary_path,
            action_tx: Mutex::new(action_tx),
            monitor_tx: Mutex::new(monitor_tx),
            torn_down: AtomicBool::new(false),
        });

        if let Err(e) = proxy.fail_batches_without_assigned_container().await {
            proxy.store.set_node_offline(&node_name, Utc::now(), Some(e.debug_info())).await?;
            warn!(node = %node_name, error = %e, "startup reconciliation failed, marking offline");
            return Ok(None);
        }

        proxy.store.set_node_online(&node_name, info.ram_mib, info.cpus, Utc::now()).await?;

        tokio::spawn(Arc::clone(&proxy).run_action_loop(action_rx));
        tokio::spawn(Arc::clone(&proxy).run_monitor_loop(monitor_rx));

        proxy.put_action(Action::Inspect);
        Ok(Some(proxy))
    }

    /// Returns `false` if the action queue has been torn down (node offline).
    pub fn put_action(&self, action: Action) -> bool {
        if self.torn_down.load(Ordering::Acquire) {
            return false;
        }
        self.action_tx.lock().try_send(action).is_ok()
    }

    /// Inspection-loop recovery per spec §4.5: re-probes an offline node's
    /// driver and, on success, brings it back online with fresh action and
    /// monitor loops.
    pub async fn inspect_offline_node(self: &Arc<Self>) {
        let info = match self.driver.info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(node = %self.node_name, error = %e, "offline node still unreachable");
                return;
            }
        };
        if let Err(e) = self.inspect().await {
            warn!(node = %self.node_name, error = %e, "offline node liveness probe still failing");
            return;
        }

        let (action_tx, action_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
        let (monitor_tx, monitor_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
        *self.action_tx.lock() = action_tx;
        *self.monitor_tx.lock() = monitor_tx;
        self.torn_down.store(false, Ordering::Release);

        if let Err(e) = self.store.set_node_online(&self.node_name, info.ram_mib, info.cpus, Utc::now()).await {
            warn!(node = %self.node_name, error = %e, "failed to mark recovered node online");
            return;
        }

        tokio::spawn(Arc::clone(self).run_action_loop(action_rx));
        tokio::spawn(Arc::clone(self).run_monitor_loop(monitor_rx));
        info!(node = %self.node_name, "node back online");
        self.put_action(Action::Inspect);
    }

    async fn run_action_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Action>) {
        while let Some(action) = rx.recv().await {
            let result = match action {
                Action::Inspect => self.inspect().await,
                Action::CheckForBatches => self.check_for_batches().await,
                Action::CleanUp => self.clean_up().await,
            };

            if let Err(e) = result {
                warn!(node = %self.node_name, action = ?action, error = %e, "action failed, scheduling inspection");
                if let Err(inspect_err) = self.inspect().await {
                    error!(node = %self.node_name, error = %inspect_err, "inspection failed, taking node offline");
                    self.torn_down.store(true, Ordering::Release);
                    let _ = self
                        .store
                        .set_node_offline(&self.node_name, Utc::now(), Some(inspect_err.debug_info()))
                        .await;
                    return;
                }
            }
        }
    }

    /// Liveness probe: a one-shot container curling the broker's external
    /// URL with the node's configured network/environment.
    async fn inspect(&self) -> Result<(), ActionError> {
        self.driver
            .run_one_shot(
                "curlimages/curl:latest",
                vec!["curl".to_string(), "-sf".to_string(), self.broker_external_url.clone()],
                self.runtime.environment.clone(),
                self.runtime.network.clone(),
            )
            .await?;
        Ok(())
    }

    async fn clean_up(&self) -> Result<(), ActionError> {
        let cancelled = self
            .store
            .batches_assigned_to_node(&self.node_name, &[BatchState::Cancelled])
            .await?;
        for batch in cancelled {
            let name = batch._id.to_hex();
            if let Err(e) = self.driver.remove(&name, true).await {
                warn!(node = %self.node_name, batch = %name, error = %e, "failed to remove cancelled container");
            }
        }

        let exited = self.driver.list(ContainerFilter::Exited).await?;
        for container in exited {
            let Ok(batch_id) = ObjectId::parse_str(&container.name) else { continue };
            let Some(batch) = self.store.get_batch(&batch_id).await? else { continue };
            if batch.state != BatchState::Processing {
                continue;
            }
            let logs = self.driver.logs(&container.name, LogStream::Both).await.unwrap_or_default();
            self.driver.remove(&container.name, true).await.ok();
            batch_failure(
                self.store.as_ref(),
                FailureArgs {
                    batch_id,
                    debug_info: String::from_utf8_lossy(&logs).to_string(),
                    ccagent: None,
                    current_state: BatchState::Processing,
                    disable_retry_if_failed: false,
                },
                Utc::now(),
            )
            .await?;
        }
        Ok(())
    }

    /// Repairs state after a controller restart: batches this node owns
    /// that have no matching container anywhere are assumed lost.
    async fn fail_batches_without_assigned_container(&self) -> Result<(), ActionError> {
        let assigned = self
            .store
            .batches_assigned_to_node(&self.node_name, &[BatchState::Scheduled, BatchState::Processing])
            .await?;
        let present: HashSet<String> = self
            .driver
            .list(ContainerFilter::Any)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();

        for batch in assigned {
            let name = batch._id.to_hex();
            if present.contains(&name) {
                continue;
            }
            batch_failure(
                self.store.as_ref(),
                FailureArgs {
                    batch_id: batch._id,
                    debug_info: "no container found for this batch after controller restart".to_string(),
                    ccagent: None,
                    current_state: batch.state,
                    disable_retry_if_failed: false,
                },
                Utc::now(),
            )
            .await?;
        }
        Ok(())
    }

    async fn check_for_batches(&self) -> Result<(), ActionError> {
        let scheduled = self
            .store
            .batches_assigned_to_node(&self.node_name, &[BatchState::Scheduled])
            .await?;

        let mut by_image: ImageGroups = HashMap::new();

        for batch in scheduled {
            let Some(mut experiment) = self.store.get_experiment(&batch.experiment_id).await? else {
                continue;
            };

            let exp_keys = secrets::get_experiment_secret_keys(&experiment);
            if !exp_keys.is_empty() {
                match self.trustee.collect(exp_keys).await {
                    Ok(collected) => {
                        let _ = secrets::fill_experiment_secrets(&mut experiment, &collected);
                    }
                    Err(e) => {
                        let disable_retry = e.disable_retry();
                        self.fail_batch(&batch, &e.to_string(), disable_retry).await?;
                        continue;
                    }
                }
            }

            let mut batch = batch;
            let keys = secrets::get_batch_secret_keys(&batch);
            if !keys.is_empty() {
                match self.trustee.collect(keys).await {
                    Ok(collected) => {
                        if secrets::fill_batch_secrets(&mut batch, &collected).is_err() {
                            self.fail_batch(&batch, "failed to fill batch secrets", true).await?;
                            continue;
                        }
                    }
                    Err(e) => {
                        let disable_retry = e.disable_retry();
                        self.fail_batch(&batch, &e.to_string(), disable_retry).await?;
                        continue;
                    }
                }
            }

            let auth = experiment
                .container
                .settings
                .image
                .auth
                .as_ref()
                .and_then(unwrap_secret_tag)
                .and_then(|v| {
                    let user = v.get("username")?.as_str()?.to_string();
                    let pass = v.get("password")?.as_str()?.to_string();
                    Some((user, pass))
                });
            let key = (experiment.container.settings.image.url.clone(), auth);
            by_image.entry(key).or_default().push((batch, experiment));
        }

        let pull_permits = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
        let mut pull_handles = Vec::new();
        for ((image, auth), group) in by_image {
            let driver = Arc::clone(&self.driver);
            let permits = Arc::clone(&pull_permits);
            pull_handles.push(tokio::spawn(async move {
                let _permit = permits.acquire().await.unwrap();
                let registry_auth = auth.map(|(username, password)| RegistryAuth {
                    username: Some(username),
                    password: Some(password),
                });
                let result = driver.pull(&image, registry_auth).await;
                (group, result)
            }));
        }

        let mut to_start = Vec::new();
        for handle in pull_handles {
            let (group, result) = handle.await.expect("pull task panicked");
            match result {
                Ok(()) => to_start.extend(group),
                Err(e) => {
                    for (batch, _experiment) in group {
                        self.fail_batch(&batch, &format!("image pull failed: {e}"), false).await?;
                    }
                }
            }
        }

        let start_permits = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
        let mut start_handles = Vec::new();
        for (batch, experiment) in to_start {
            let this = self.clone_handles();
            let permits = Arc::clone(&start_permits);
            start_handles.push(tokio::spawn(async move {
                let _permit = permits.acquire().await.unwrap();
                this.start_batch_container(batch, experiment).await
            }));
        }
        for handle in start_handles {
            if let Err(e) = handle.await.expect("start task panicked") {
                warn!(node = %self.node_name, error = %e, "failed to start batch container");
            }
        }

        Ok(())
    }

    /// Cheap clone of the handles `start_batch_container` needs, so it can
    /// run inside its own spawned task without borrowing `self`.
    fn clone_handles(&self) -> StartContext {
        StartContext {
            node_name: self.node_name.clone(),
            driver: Arc::clone(&self.driver),
            store: Arc::clone(&self.store),
            environment: self.runtime.environment.clone(),
            network: self.runtime.network.clone(),
            agent_binary_path: self.agent_binary_path.clone(),
            monitor_tx: self.monitor_tx.lock().clone(),
        }
    }

    async fn fail_batch(&self, batch: &Batch, debug_info: &str, disable_retry: bool) -> Result<(), ActionError> {
        batch_failure(
            self.store.as_ref(),
            FailureArgs {
                batch_id: batch._id,
                debug_info: debug_info.to_string(),
                ccagent: None,
                current_state: batch.state,
                disable_retry_if_failed: disable_retry,
            },
            Utc::now(),
        )
        .await?;
        Ok(())
    }

    async fn run_monitor_loop(self: Arc<Self>, mut rx: mpsc::Receiver<(String, ObjectId)>) {
        let mut tracked: HashMap<String, ObjectId> = HashMap::new();
        let mut ticker = tokio::time::interval(CHECK_RUNNING_CONTAINERS_INTERVAL);

        loop {
            tokio::select! {
                Some((name, batch_id)) = rx.recv() => {
                    tracked.insert(name, batch_id);
                }
                _ = ticker.tick() => {
                    if tracked.is_empty() {
                        continue;
                    }
                    let running: HashSet<String> = match self.driver.list(ContainerFilter::Running).await {
                        Ok(list) => list.into_iter().map(|c| c.name).collect(),
                        Err(e) => {
                            warn!(node = %self.node_name, error = %e, "monitor loop failed to list containers");
                            continue;
                        }
                    };

                    let finished: Vec<(String, ObjectId)> = tracked
                        .iter()
                        .filter(|(name, _)| !running.contains(*name))
                        .map(|(name, id)| (name.clone(), *id))
                        .collect();

                    for (name, batch_id) in finished {
                        tracked.remove(&name);
                        self.handle_finished_container(&name, batch_id).await;
                    }
                }
            }
        }
    }

    async fn handle_finished_container(&self, name: &str, batch_id: ObjectId) {
        let outcome = self.inspect_finished_container(name).await;
        if let Err(e) = self.driver.remove(name, true).await {
            warn!(node = %self.node_name, batch = %name, error = %e, "failed to remove finished container");
        }

        let Some(batch) = self.store.get_batch(&batch_id).await.ok().flatten() else { return };
        if batch.state != BatchState::Processing {
            return;
        }

        match outcome {
            Ok(cb) if cb.state == blue::AgentCallbackState::Succeeded => {
                let _ = self
                    .store
                    .apply_batch_transition(
                        &batch_id,
                        BatchState::Processing,
                        BatchState::Succeeded,
                        batch.node.clone(),
                        None,
                        None,
                        false,
                        agency_core::model::HistoryEntry {
                            state: BatchState::Succeeded,
                            time: Utc::now(),
                            debug_info: cb.debug_info,
                            node: batch.node.clone(),
                            ccagent: None,
                        },
                    )
                    .await;
            }
            Ok(cb) => {
                let _ = self
                    .fail_batch(&batch, cb.debug_info.as_deref().unwrap_or("batch reported failure"), false)
                    .await;
            }
            Err(e) => {
                let _ = self.fail_batch(&batch, &e, false).await;
            }
        }
    }

    async fn inspect_finished_container(&self, name: &str) -> Result<blue::AgentCallback, String> {
        let stdout = self.driver.logs(name, LogStream::Stdout).await.map_err(|e| e.diagnostic().to_string())?;
        let stderr = self.driver.logs(name, LogStream::Stderr).await.map_err(|e| e.diagnostic().to_string())?;
        let mut cb = blue::parse_agent_callback(&stdout)?;
        if cb.state == blue::AgentCallbackState::Failed {
            let stderr_text = String::from_utf8_lossy(&stderr).to_string();
            cb.debug_info = Some(match cb.debug_info {
                Some(existing) => format!("{stderr_text}\n{existing}"),
                None => stderr_text,
            });
        }
        Ok(cb)
    }
}

/// The fields `start_batch_container` needs, decoupled from `&ClientProxy`
/// so the per-batch start can run inside its own spawned task.
struct StartContext {
    node_name: String,
    driver: Arc<dyn HostDriver>,
    store: Arc<dyn Store>,
    environment: HashMap<String, String>,
    network: Option<String>,
    agent_binary_path: String,
    monitor_tx: mpsc::Sender<(String, ObjectId)>,
}

impl StartContext {
    async fn start_batch_container(&self, mut batch: Batch, experiment: Experiment) -> Result<(), ActionError> {
        let runtime = experiment.container.engine;
        let runtime_str = crate::host_driver::engine_to_runtime(runtime);

        let mut env = self.environment.clone();
        if let Some(gpus) = batch.used_gpus.as_ref().filter(|g| !g.is_empty()) {
            let ids = gpus.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(",");
            env.insert("NVIDIA_VISIBLE_DEVICES".to_string(), ids);
            env.insert("NVIDIA_DRIVER_CAPABILITIES".to_string(), "compute,utility".to_string());
        }

        let mut devices = Vec::new();
        let mut cap_add = Vec::new();
        let mut security_opt = Vec::new();
        if batch.mount {
            devices.push("/dev/fuse".to_string());
            cap_add.push("SYS_ADMIN".to_string());
            security_opt.push("apparmor:unconfined".to_string());
        }

        let ram = experiment.container.settings.ram;

        let token = callback::generate_token();
        env.insert("CC_AGENT_AUTH_TOKEN".to_string(), token.raw.clone());
        self.store
            .insert_callback_token(CallbackToken {
                batch_id: batch._id,
                salt: token.salt,
                token_hash: token.hash,
                timestamp: Utc::now(),
            })
            .await?;

        let archive = match build_blue_archive(&experiment, &mut batch, &self.agent_binary_path) {
            Ok(archive) => archive,
            Err(e) => {
                batch_failure(
                    self.store.as_ref(),
                    FailureArgs {
                        batch_id: batch._id,
                        debug_info: e,
                        ccagent: None,
                        current_state: batch.state,
                        disable_retry_if_failed: true,
                    },
                    Utc::now(),
                )
                .await?;
                return Ok(());
            }
        };

        let name = batch._id.to_hex();
        let transitioned = self
            .store
            .apply_batch_transition(
                &batch._id,
                BatchState::Scheduled,
                BatchState::Processing,
                Some(self.node_name.clone()),
                batch.used_gpus.clone(),
                Some(batch.mount),
                false,
                agency_core::model::HistoryEntry {
                    state: BatchState::Processing,
                    time: Utc::now(),
                    debug_info: None,
                    node: Some(self.node_name.clone()),
                    ccagent: None,
                },
            )
            .await?;
        if !transitioned {
            return Ok(());
        }

        let _ = self.driver.remove(&name, true).await;

        let spec = CreateSpec {
            image: experiment.container.settings.image.url.clone(),
            name: name.clone(),
            command: vec![
                "python3".to_string(),
                blue::BLUE_AGENT_PATH.to_string(),
                blue::BLUE_DESCRIPTOR_PATH.to_string(),
            ],
            user: "1000:1000".to_string(),
            mem_limit_mib: ram,
            memswap_limit_mib: ram,
            runtime: runtime_str,
            env,
            network: self.network.clone(),
            devices,
            cap_add,
            security_opt,
        };

        let container_id = self.driver.create(spec).await?;
        self.driver.put_archive(&container_id, "/", archive).await?;
        self.driver.start(&container_id).await?;

        self.monitor_tx.send((name, batch._id)).await.ok();
        Ok(())
    }
}

/// Unwraps a `{"!secret": <value>}` envelope left by secret separation; a
/// plain, never-separated value passes through unchanged.
fn unwrap_secret_tag(value: &serde_json::Value) -> Option<&serde_json::Value> {
    match value.as_object() {
        Some(map) if map.len() == 1 => map.get("!secret").or(Some(value)),
        _ => Some(value),
    }
}

/// Builds the in-memory tar archive carrying the agent executable (read
/// from `agent_binary_path` on the controller's own filesystem) and the
/// serialized Blue descriptor, per spec §4.4 step 9 / §4.6 step 5.
fn build_blue_archive(experiment: &Experiment, batch: &mut Batch, agent_binary_path: &str) -> Result<Vec<u8>, String> {
    let blue_batch = blue::translate_single(&blue::DefaultBlueTranslator, experiment, batch).map_err(|e| e.to_string())?;
    let json = serde_json::to_vec(&blue_batch).map_err(|e| e.to_string())?;
    let agent = std::fs::read(agent_binary_path)
        .map_err(|e| format!("failed to read agent binary at {agent_binary_path}: {e}"))?;

    let mut builder = tar::Builder::new(Vec::new());

    let mut agent_header = tar::Header::new_gnu();
    agent_header.set_size(agent.len() as u64);
    agent_header.set_mode(0o755);
    agent_header.set_cksum();
    builder
        .append_data(&mut agent_header, blue::BLUE_AGENT_PATH.trim_start_matches('/'), agent.as_slice())
        .map_err(|e| e.to_string())?;

    let mut descriptor_header = tar::Header::new_gnu();
    descriptor_header.set_size(json.len() as u64);
    descriptor_header.set_mode(0o644);
    descriptor_header.set_cksum();
    builder
        .append_data(&mut descriptor_header, blue::BLUE_DESCRIPTOR_PATH.trim_start_matches('/'), json.as_slice())
        .map_err(|e| e.to_string())?;

    builder.into_inner().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_driver::fake::FakeHostDriver;
    use agency_core::model::{ContainerSettings, ContainerSpec, Engine, ImageSpec};
    use agency_core::store::InMemoryStore;

    /// Drops a fixture agent binary on disk and returns its path; stands in
    /// for the real build-step artifact `controller.agent_binary_path`
    /// points at in production.
    fn test_agent_binary_path() -> String {
        let path = std::env::temp_dir().join("agency-test-blue-agent");
        std::fs::write(&path, b"#!/bin/sh\necho fixture agent\n").unwrap();
        path.to_str().unwrap().to_string()
    }

    fn experiment(ram: u64) -> Experiment {
        Experiment {
            _id: ObjectId::new(),
            username: "alice".to_string(),
            registration_time: Utc::now(),
            container: ContainerSpec {
                engine: Engine::Docker,
                settings: ContainerSettings {
                    image: ImageSpec { url: "busybox".to_string(), auth: None },
                    ram,
                    gpus: None,
                },
            },
            cli: serde_json::json!({"command": ["true"]}),
            execution: None,
            protected_keys_voided: false,
        }
    }

    fn batch(experiment_id: agency_core::model::Id, node: &str, state: BatchState) -> Batch {
        Batch {
            _id: ObjectId::new(),
            experiment_id,
            username: "alice".to_string(),
            registration_time: Utc::now(),
            state,
            node: Some(node.to_string()),
            attempts: 0,
            used_gpus: None,
            mount: false,
            inputs: Default::default(),
            outputs: Default::default(),
            history: Vec::new(),
            protected_keys_voided: false,
            notifications_sent: false,
        }
    }

    fn runtime() -> NodeRuntime {
        NodeRuntime { environment: HashMap::new(), network: None }
    }

    #[tokio::test]
    async fn start_inserts_mirror_and_marks_node_online() {
        let store = Arc::new(InMemoryStore::new());
        let driver: Arc<dyn HostDriver> = Arc::new(FakeHostDriver::new());
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));

        let proxy = ClientProxy::start(
            "node-a".to_string(),
            driver,
            Arc::clone(&store) as Arc<dyn Store>,
            trustee,
            runtime(),
            "http://broker.local".to_string(),
            test_agent_binary_path(),
        )
        .await
        .unwrap();

        assert!(proxy.is_some());
        let mirror = store.get_node_mirror("node-a").await.unwrap().unwrap();
        assert_eq!(mirror.state, Some(agency_core::model::NodeState::Online));
        assert_eq!(mirror.ram, Some(8192));
    }

    #[tokio::test]
    async fn start_marks_node_offline_when_driver_unreachable() {
        struct UnreachableDriver;
        #[async_trait::async_trait]
        impl HostDriver for UnreachableDriver {
            async fn info(&self) -> Result<crate::host_driver::NodeInfo, crate::host_driver::DriverError> {
                Err(crate::host_driver::DriverError::Diagnostic("connection refused".to_string()))
            }
            async fn pull(&self, _: &str, _: Option<RegistryAuth>) -> Result<(), crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn create(&self, _: CreateSpec) -> Result<String, crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn start(&self, _: &str) -> Result<(), crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn put_archive(&self, _: &str, _: &str, _: Vec<u8>) -> Result<(), crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn list(&self, _: ContainerFilter) -> Result<Vec<crate::host_driver::ContainerSummary>, crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn logs(&self, _: &str, _: LogStream) -> Result<Vec<u8>, crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn remove(&self, _: &str, _: bool) -> Result<(), crate::host_driver::DriverError> {
                unreachable!()
            }
            async fn run_one_shot(
                &self,
                _: &str,
                _: Vec<String>,
                _: HashMap<String, String>,
                _: Option<String>,
            ) -> Result<(), crate::host_driver::DriverError> {
                unreachable!()
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let driver: Arc<dyn HostDriver> = Arc::new(UnreachableDriver);
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));

        let proxy = ClientProxy::start(
            "node-a".to_string(),
            driver,
            Arc::clone(&store) as Arc<dyn Store>,
            trustee,
            runtime(),
            "http://broker.local".to_string(),
            test_agent_binary_path(),
        )
        .await
        .unwrap();

        assert!(proxy.is_none());
        let mirror = store.get_node_mirror("node-a").await.unwrap().unwrap();
        assert_eq!(mirror.state, Some(agency_core::model::NodeState::Offline));
    }

    #[tokio::test]
    async fn check_for_batches_pulls_creates_and_starts_a_container() {
        let store = Arc::new(InMemoryStore::new());
        let fake = Arc::new(FakeHostDriver::new());
        let driver: Arc<dyn HostDriver> = fake.clone();
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));

        let proxy = ClientProxy::start(
            "node-a".to_string(),
            driver,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&trustee),
            runtime(),
            "http://broker.local".to_string(),
            test_agent_binary_path(),
        )
        .await
        .unwrap()
        .unwrap();

        let exp = experiment(1024);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, "node-a", BatchState::Scheduled);
        store.insert_batch(b.clone()).await.unwrap();

        proxy.check_for_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Processing);

        let running = fake.list(ContainerFilter::Running).await.unwrap();
        assert!(running.iter().any(|c| c.name == b._id.to_hex()));
    }

    #[tokio::test]
    async fn check_for_batches_fails_batch_on_pull_error() {
        let store = Arc::new(InMemoryStore::new());
        let fake = Arc::new(FakeHostDriver::new());
        fake.fail_pull("busybox", "manifest unknown");
        let driver: Arc<dyn HostDriver> = fake.clone();
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));

        let proxy = ClientProxy::start(
            "node-a".to_string(),
            driver,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&trustee),
            runtime(),
            "http://broker.local".to_string(),
            test_agent_binary_path(),
        )
        .await
        .unwrap()
        .unwrap();

        let exp = experiment(1024);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, "node-a", BatchState::Scheduled);
        store.insert_batch(b.clone()).await.unwrap();

        proxy.check_for_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(
            persisted.state,
            BatchState::Failed,
            "experiment has retryIfFailed=false, so even a non-disable_retry failure is terminal"
        );
    }

    #[tokio::test]
    async fn clean_up_force_removes_cancelled_containers() {
        let store = Arc::new(InMemoryStore::new());
        let fake = Arc::new(FakeHostDriver::new());
        let driver: Arc<dyn HostDriver> = fake.clone();
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));

        let proxy = ClientProxy::start(
            "node-a".to_string(),
            driver,
            Arc::clone(&store) as Arc<dyn Store>,
            trustee,
            runtime(),
            "http://broker.local".to_string(),
            test_agent_binary_path(),
        )
        .await
        .unwrap()
        .unwrap();

        let exp = experiment(1024);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id, "node-a", BatchState::Cancelled);
        store.insert_batch(b.clone()).await.unwrap();
        fake.set_container_state(&b._id.to_hex(), ContainerFilter::Running);

        proxy.clean_up().await.unwrap();

        let remaining = fake.list(ContainerFilter::Any).await.unwrap();
        assert!(!remaining.iter().any(|c| c.name == b._id.to_hex()));
    }

    #[tokio::test]
    async fn fail_batches_without_assigned_container_recovers_after_restart() {
        let store = Arc::new(InMemoryStore::new());
        let exp = experiment(1024);
        store.insert_experiment(exp.clone()).await.unwrap();
        let mut orphan = batch(exp._id, "node-a", BatchState::Processing);
        orphan.attempts = 1;
        store.insert_batch(orphan.clone()).await.unwrap();

        // No container exists anywhere for this batch (FakeHostDriver starts empty).
        let fake = Arc::new(FakeHostDriver::new());
        let driver: Arc<dyn HostDriver> = fake;
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));

        ClientProxy::start(
            "node-a".to_string(),
            driver,
            Arc::clone(&store) as Arc<dyn Store>,
            trustee,
            runtime(),
            "http://broker.local".to_string(),
            test_agent_binary_path(),
        )
        .await
        .unwrap();

        let persisted = store.get_batch(&orphan._id).await.unwrap().unwrap();
        assert_ne!(persisted.state, BatchState::Processing, "orphaned batch must not stay processing forever");
    }

    #[test]
    fn blue_archive_carries_both_the_agent_and_the_descriptor() {
        let exp = experiment(1024);
        let mut b = batch(exp._id, "node-a", BatchState::Scheduled);
        let agent_path = test_agent_binary_path();

        let archive_bytes = build_blue_archive(&exp, &mut b, &agent_path).unwrap();

        let mut archive = tar::Archive::new(archive_bytes.as_slice());
        let entries: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(
            entries.iter().any(|p| p == blue::BLUE_AGENT_PATH.trim_start_matches('/')),
            "archive must ship the agent executable the container command invokes"
        );
        assert!(
            entries.iter().any(|p| p == blue::BLUE_DESCRIPTOR_PATH.trim_start_matches('/')),
            "archive must ship the batch's Blue descriptor"
        );
    }
}
