//! Scheduler: owns the node map, the four coalescing signal channels, the
//! periodic ticker, and the FIFO placement algorithm, per spec §4.5.
//! Grounded in the teacher's `agent/pool.rs` registry-of-workers shape,
//! generalized from an agent pool to a client-proxy pool, and in
//! `cluster/state.rs`'s single-owner-of-shared-state pattern.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agency_core::config::{AgencyConfig, GpuHardwareConfig, SchedulingStrategy};
use agency_core::gpu::{match_gpus, GpuDevice};
use agency_core::model::{Batch, BatchState, HistoryEntry};
use agency_core::secrets::{get_batch_secret_keys, get_experiment_secret_keys};
use agency_core::store::Store;
use agency_core::trustee::TrusteeClient;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::client_proxy::{Action, ClientProxy};

const CRON_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    nodes: HashMap<String, Arc<ClientProxy>>,
    store: Arc<dyn Store>,
    trustee: Arc<TrusteeClient>,
    node_hardware: HashMap<String, Vec<GpuHardwareConfig>>,
    scheduling_strategy: SchedulingStrategy,
    allow_insecure_capabilities: bool,
    notification_hooks: Vec<agency_core::config::NotificationHookConfig>,
    scheduling_tx: mpsc::Sender<()>,
    inspection_tx: mpsc::Sender<()>,
    voiding_tx: mpsc::Sender<()>,
    notification_tx: mpsc::Sender<()>,
}

impl Scheduler {
    pub fn new(
        nodes: HashMap<String, Arc<ClientProxy>>,
        store: Arc<dyn Store>,
        trustee: Arc<TrusteeClient>,
        config: &AgencyConfig,
    ) -> (Arc<Self>, SchedulerLoops) {
        let node_hardware = config
            .controller
            .docker
            .nodes
            .iter()
            .map(|(name, node)| {
                let gpus = node.hardware.as_ref().map(|h| h.gpus.clone()).unwrap_or_default();
                (name.clone(), gpus)
            })
            .collect();

        let (scheduling_tx, scheduling_rx) = mpsc::channel(1);
        let (inspection_tx, inspection_rx) = mpsc::channel(1);
        let (voiding_tx, voiding_rx) = mpsc::channel(1);
        let (notification_tx, notification_rx) = mpsc::channel(1);

        let scheduler = Arc::new(Self {
            nodes,
            store,
            trustee,
            node_hardware,
            scheduling_strategy: config.controller.scheduling_strategy,
            allow_insecure_capabilities: config.controller.docker.allow_insecure_capabilities,
            notification_hooks: config.controller.notification_hooks.clone(),
            scheduling_tx,
            inspection_tx,
            voiding_tx,
            notification_tx,
        });

        let loops = SchedulerLoops { scheduling_rx, inspection_rx, voiding_rx, notification_rx };
        (scheduler, loops)
    }

    /// Non-blocking, best-effort wake-up; additional calls while one is
    /// already pending are dropped (coalescing).
    pub fn schedule(&self) {
        let _ = self.scheduling_tx.try_send(());
    }

    fn signal_inspection(&self) {
        let _ = self.inspection_tx.try_send(());
    }

    fn signal_voiding(&self) {
        let _ = self.voiding_tx.try_send(());
    }

    fn signal_notification(&self) {
        let _ = self.notification_tx.try_send(());
    }

    pub async fn run_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CRON_INTERVAL);
        loop {
            ticker.tick().await;
            match self.store.any_pending_work().await {
                Ok(true) => self.schedule(),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "ticker failed to query pending work"),
            }
        }
    }

    pub async fn run_scheduling_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            self.signal_inspection();
            self.signal_voiding();
            self.signal_notification();

            if let Err(e) = self.trustee.inspect().await {
                warn!(error = %e, "trustee unreachable, deferring scheduling pass");
                tokio::time::sleep(CRON_INTERVAL).await;
                self.schedule();
                continue;
            }

            if let Err(e) = self.schedule_batches().await {
                warn!(error = %e, "scheduling pass failed");
            }
        }
    }

    pub async fn run_inspection_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            let offline = match self.store.offline_nodes().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(error = %e, "failed to list offline nodes");
                    continue;
                }
            };

            let mut handles = Vec::new();
            for mirror in offline {
                if let Some(proxy) = self.nodes.get(&mirror.node_name) {
                    let proxy = Arc::clone(proxy);
                    handles.push(tokio::spawn(async move { proxy.inspect_offline_node().await }));
                }
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    pub async fn run_voiding_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            if let Err(e) = self.void_terminal_batches().await {
                warn!(error = %e, "voiding pass failed");
            }
        }
    }

    async fn void_terminal_batches(&self) -> Result<(), agency_core::StoreError> {
        for batch in self.store.terminal_unvoided_batches().await? {
            let keys = get_batch_secret_keys(&batch);
            if !keys.is_empty() {
                if let Err(e) = self.trustee.delete(keys).await {
                    warn!(batch = %batch._id, error = %e, "failed to void batch secrets");
                    continue;
                }
            }
            self.store.set_batch_protected_keys_voided(&batch._id).await?;
        }

        for experiment in self.store.unvoided_experiments().await? {
            if !self.store.all_batches_terminal_for_experiment(&experiment._id).await? {
                continue;
            }
            let keys = get_experiment_secret_keys(&experiment);
            if !keys.is_empty() {
                if let Err(e) = self.trustee.delete(keys).await {
                    warn!(experiment = %experiment._id, error = %e, "failed to void experiment secrets");
                    continue;
                }
            }
            self.store.set_experiment_protected_keys_voided(&experiment._id).await?;
        }
        Ok(())
    }

    pub async fn run_notification_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            if let Err(e) = self.notify_terminal_batches().await {
                warn!(error = %e, "notification pass failed");
            }
        }
    }

    async fn notify_terminal_batches(&self) -> Result<(), agency_core::StoreError> {
        let mut to_notify = Vec::new();
        for batch in self.store.terminal_unnotified_batches().await? {
            if self.store.mark_notification_sent(&batch._id).await? {
                to_notify.push(batch);
            }
        }
        if to_notify.is_empty() || self.notification_hooks.is_empty() {
            return Ok(());
        }

        let payload = json!({
            "batches": to_notify.iter().map(|b| json!({
                "batchId": b._id.to_hex(),
                "state": b.state,
            })).collect::<Vec<_>>(),
        });

        let client = reqwest::Client::new();
        for hook in &self.notification_hooks {
            let mut request = client.post(&hook.url).json(&payload);
            if let Some(auth) = &hook.auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }
            match request.send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(url = %hook.url, status = %resp.status(), "notification hook returned non-2xx");
                }
                Err(e) => warn!(url = %hook.url, error = %e, "notification hook request failed"),
                _ => {}
            }
        }
        Ok(())
    }

    async fn schedule_batches(&self) -> Result<(), agency_core::StoreError> {
        let mut snapshot = self.build_snapshot().await?;
        let structural_capacity = self.build_structural_capacity().await?;
        let candidates = self.store.fifo_registered_batches().await?;
        let mut touched_nodes: HashSet<String> = HashSet::new();

        for mut batch in candidates {
            let Some(mut experiment) = self.store.get_experiment(&batch.experiment_id).await? else {
                continue;
            };

            let keys = get_experiment_secret_keys(&experiment);
            if !keys.is_empty() {
                match self.trustee.collect(keys).await {
                    Ok(collected) => {
                        if agency_core::secrets::fill_experiment_secrets(&mut experiment, &collected).is_err() {
                            self.fail(&batch, "failed to fill experiment secrets", true).await?;
                            continue;
                        }
                    }
                    Err(e) => {
                        if e.inspect() {
                            break;
                        }
                        let disable_retry = e.disable_retry();
                        self.fail(&batch, &e.to_string(), disable_retry).await?;
                        continue;
                    }
                }
            }

            if batch.mount && !self.allow_insecure_capabilities {
                self.fail(&batch, "batch requires a FUSE mount, which this cluster disallows", true).await?;
                continue;
            }

            let active = self.store.count_active_batches_for_experiment(&batch.experiment_id).await?;
            if active >= experiment.batch_concurrency_limit() as u64 {
                continue;
            }

            let requirements = experiment.container.settings.gpus.clone().unwrap_or_default();
            let required_ram = experiment.container.settings.ram;

            if !structural_capacity.iter().any(|n| n.possibly_sufficient(required_ram, &requirements)) {
                self.fail(&batch, "no node in the cluster can ever satisfy this experiment's resource requirements", true).await?;
                continue;
            }

            let Some(node_name) = self.pick_node(&snapshot, required_ram, &requirements) else {
                continue;
            };

            let node = snapshot.get_mut(&node_name).unwrap();
            let matched_gpus = match match_gpus(&node.gpus_available, &requirements) {
                Ok(gpus) => gpus,
                Err(_) => continue,
            };

            let history = HistoryEntry {
                state: BatchState::Scheduled,
                time: Utc::now(),
                debug_info: None,
                node: Some(node_name.clone()),
                ccagent: None,
            };
            let gpu_ids: Vec<i64> = matched_gpus.iter().map(|g| g.device_id).collect();
            let transitioned = self
                .store
                .apply_batch_transition(
                    &batch._id,
                    BatchState::Registered,
                    BatchState::Scheduled,
                    Some(node_name.clone()),
                    Some(gpu_ids.clone()),
                    Some(batch.mount),
                    true,
                    history,
                )
                .await?;
            if !transitioned {
                continue;
            }

            node.ram_available -= required_ram;
            node.num_batches_running += 1;
            node.gpus_available.retain(|g| !matched_gpus.contains(g));
            touched_nodes.insert(node_name.clone());
            batch.state = BatchState::Scheduled;
        }

        for (name, proxy) in &self.nodes {
            if !proxy.put_action(Action::CleanUp) {
                warn!(node = %name, "clean_up action dropped, node's action queue is torn down");
            }
        }
        for name in &touched_nodes {
            if let Some(proxy) = self.nodes.get(name) {
                if !proxy.put_action(Action::CheckForBatches) {
                    warn!(node = %name, "check_for_batches action dropped, failing its freshly placed batches");
                    self.fail_batches_assigned_to(name).await?;
                }
            }
        }

        Ok(())
    }

    async fn fail_batches_assigned_to(&self, node: &str) -> Result<(), agency_core::StoreError> {
        for batch in self.store.batches_assigned_to_node(node, &[BatchState::Scheduled]).await? {
            self.fail(&batch, "node's action queue is torn down", false).await?;
        }
        Ok(())
    }

    async fn fail(&self, batch: &Batch, debug_info: &str, disable_retry: bool) -> Result<(), agency_core::StoreError> {
        agency_core::failure::batch_failure(
            self.store.as_ref(),
            agency_core::failure::FailureArgs {
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

    /// Steps 7a/7b (GPU hosts last, fewest running batches) are fixed ordering
    /// rules; step 7c's RAM tie-break direction is the configurable part, per
    /// `controller.scheduling_strategy`: `binpack` favors the busiest-fitting
    /// node (smallest `ram_available`), `spread` favors the emptiest one.
    fn pick_node(
        &self,
        snapshot: &HashMap<String, NodeSnapshot>,
        required_ram: u64,
        requirements: &[agency_core::model::GpuRequirement],
    ) -> Option<String> {
        let ram_key = |n: &NodeSnapshot| match self.scheduling_strategy {
            SchedulingStrategy::Binpack => n.ram_available,
            SchedulingStrategy::Spread => u64::MAX - n.ram_available,
        };
        snapshot
            .iter()
            .filter(|(_, n)| n.ram_available >= required_ram && match_gpus(&n.gpus_available, requirements).is_ok())
            .min_by_key(|(_, n)| (!n.gpus_total.is_empty(), n.num_batches_running, ram_key(n)))
            .map(|(name, _)| name.clone())
    }

    async fn build_snapshot(&self) -> Result<HashMap<String, NodeSnapshot>, agency_core::StoreError> {
        let mut snapshot = HashMap::new();
        for mirror in self.store.online_nodes().await? {
            let active = self.store.active_batches_for_node(&mirror.node_name).await?;
            let mut ram_used = 0u64;
            let mut busy_gpus: HashSet<i64> = HashSet::new();
            for batch in &active {
                if let Some(experiment) = self.store.get_experiment(&batch.experiment_id).await? {
                    ram_used += experiment.container.settings.ram;
                }
                if let Some(gpus) = &batch.used_gpus {
                    busy_gpus.extend(gpus.iter().copied());
                }
            }

            let hardware = self.node_hardware.get(&mirror.node_name).cloned().unwrap_or_default();
            let gpus_total: Vec<GpuDevice> = hardware
                .iter()
                .map(|g| GpuDevice { device_id: g.id, vram: g.vram })
                .collect();
            let gpus_available: Vec<GpuDevice> = gpus_total
                .iter()
                .filter(|g| !busy_gpus.contains(&g.device_id))
                .copied()
                .collect();
            let ram_total = mirror.ram.unwrap_or(0);

            snapshot.insert(
                mirror.node_name.clone(),
                NodeSnapshot {
                    ram_total,
                    ram_available: ram_total.saturating_sub(ram_used),
                    gpus_available,
                    gpus_total,
                    num_batches_running: active.len(),
                },
            );
        }
        Ok(snapshot)
    }

    /// Total hardware across every node the cluster has ever seen (online
    /// and offline), used only for the structural-feasibility filter — a
    /// node that is merely offline right now can still come back, so the
    /// "can this batch ever be scheduled anywhere" question must not be
    /// answered from the online-only snapshot.
    async fn build_structural_capacity(&self) -> Result<Vec<NodeSnapshot>, agency_core::StoreError> {
        let mut mirrors = self.store.online_nodes().await?;
        mirrors.extend(self.store.offline_nodes().await?);

        Ok(mirrors
            .into_iter()
            .map(|mirror| {
                let hardware = self.node_hardware.get(&mirror.node_name).cloned().unwrap_or_default();
                let gpus_total: Vec<GpuDevice> =
                    hardware.iter().map(|g| GpuDevice { device_id: g.id, vram: g.vram }).collect();
                let ram_total = mirror.ram.unwrap_or(0);
                NodeSnapshot {
                    ram_total,
                    ram_available: 0,
                    gpus_available: Vec::new(),
                    gpus_total,
                    num_batches_running: 0,
                }
            })
            .collect())
    }
}

pub struct SchedulerLoops {
    pub scheduling_rx: mpsc::Receiver<()>,
    pub inspection_rx: mpsc::Receiver<()>,
    pub voiding_rx: mpsc::Receiver<()>,
    pub notification_rx: mpsc::Receiver<()>,
}

#[derive(Debug, Clone)]
struct NodeSnapshot {
    ram_total: u64,
    ram_available: u64,
    gpus_available: Vec<GpuDevice>,
    gpus_total: Vec<GpuDevice>,
    num_batches_running: usize,
}

impl NodeSnapshot {
    /// Whether this node could ever satisfy the requirement set, ignoring
    /// current load — used for the structurally-unschedulable check.
    fn possibly_sufficient(&self, required_ram: u64, requirements: &[agency_core::model::GpuRequirement]) -> bool {
        self.ram_total >= required_ram && match_gpus(&self.gpus_total, requirements).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_core::config::{DockerFleetConfig, DockerNodeConfig};
    use agency_core::model::{
        ContainerSpec, Engine, ExecutionSettings, ExecutionSettingsInner, Experiment, GpuRequirement, ImageSpec,
    };
    use agency_core::store::InMemoryStore;
    use bson::oid::ObjectId;

    fn experiment(ram: u64, gpus: Option<Vec<GpuRequirement>>, concurrency_limit: u32) -> Experiment {
        Experiment {
            _id: ObjectId::new(),
            username: "alice".to_string(),
            registration_time: Utc::now(),
            container: ContainerSpec {
                engine: Engine::Docker,
                settings: agency_core::model::ContainerSettings {
                    image: ImageSpec { url: "busybox".to_string(), auth: None },
                    ram,
                    gpus,
                },
            },
            cli: json!({}),
            execution: Some(ExecutionSettings {
                engine: "ccagency".to_string(),
                settings: ExecutionSettingsInner {
                    batch_concurrency_limit: concurrency_limit,
                    retry_if_failed: false,
                    disable_pull: false,
                },
            }),
            protected_keys_voided: false,
        }
    }

    fn batch(experiment_id: agency_core::model::Id) -> Batch {
        Batch {
            _id: ObjectId::new(),
            experiment_id,
            username: "alice".to_string(),
            registration_time: Utc::now(),
            state: BatchState::Registered,
            node: None,
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

    fn config_with_nodes(nodes: Vec<(&str, Option<Vec<GpuHardwareConfig>>)>) -> AgencyConfig {
        let mut config = AgencyConfig::default();
        let mut map = HashMap::new();
        for (name, gpus) in nodes {
            map.insert(
                name.to_string(),
                DockerNodeConfig {
                    base_url: "tcp://unused:2376".to_string(),
                    tls: None,
                    environment: HashMap::new(),
                    network: None,
                    hardware: gpus.map(|gpus| agency_core::config::NodeHardwareConfig { gpus }),
                },
            );
        }
        config.controller.docker = DockerFleetConfig { nodes: map, allow_insecure_capabilities: false };
        config
    }

    async fn online_node(store: &InMemoryStore, name: &str, ram: u64) {
        store.insert_node_mirror(name).await.unwrap();
        store.set_node_online(name, ram, 4, Utc::now()).await.unwrap();
    }

    fn scheduler_with(store: Arc<InMemoryStore>, config: &AgencyConfig) -> (Arc<Scheduler>, SchedulerLoops) {
        let trustee = Arc::new(TrusteeClient::new("/nonexistent".to_string()));
        Scheduler::new(HashMap::new(), store, trustee, config)
    }

    #[tokio::test]
    async fn places_batch_on_least_loaded_node_within_ram() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "node-a", 1024).await;
        online_node(&store, "node-b", 4096).await;
        let config = config_with_nodes(vec![("node-a", None), ("node-b", None)]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(2048, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Scheduled);
        assert_eq!(persisted.node.as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn zero_gpu_node_preferred_over_gpu_node_when_both_fit() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "cpu-node", 4096).await;
        online_node(&store, "gpu-node", 4096).await;
        let config = config_with_nodes(vec![
            ("cpu-node", None),
            ("gpu-node", Some(vec![GpuHardwareConfig { id: 0, vram: 16_000 }])),
        ]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(1024, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Scheduled);
        assert_eq!(persisted.node.as_deref(), Some("cpu-node"));
    }

    #[tokio::test]
    async fn structurally_unsatisfiable_batch_fails_without_retry() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "node-a", 512).await;
        let config = config_with_nodes(vec![("node-a", None)]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(4096, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Failed);
        assert_eq!(persisted.attempts, 0);
        assert!(!persisted.history.last().unwrap().debug_info.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_additional_placement() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "node-a", 8192).await;
        let config = config_with_nodes(vec![("node-a", None)]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(1024, None, 1);
        store.insert_experiment(exp.clone()).await.unwrap();

        let already_running = batch(exp._id);
        let mut already_running = already_running.clone();
        already_running.state = BatchState::Processing;
        store.insert_batch(already_running).await.unwrap();

        let pending = batch(exp._id);
        store.insert_batch(pending.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&pending._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Registered, "cap of 1 already saturated, batch stays registered");
    }

    #[tokio::test]
    async fn gpu_requirement_matched_against_available_vram() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "gpu-node", 4096).await;
        let config = config_with_nodes(vec![(
            "gpu-node",
            Some(vec![GpuHardwareConfig { id: 7, vram: 16_000 }]),
        )]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(1024, Some(vec![GpuRequirement { vram: 8_000 }]), 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Scheduled);
        assert_eq!(persisted.used_gpus.as_deref(), Some(&[7i64][..]));
    }

    #[tokio::test]
    async fn offline_node_is_not_a_placement_candidate_but_keeps_batch_retriable() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_node_mirror("node-a").await.unwrap();
        store.set_node_online("node-a", 2048, 4, Utc::now()).await.unwrap();
        store.set_node_offline("node-a", Utc::now(), Some("unreachable".to_string())).await.unwrap();
        let config = config_with_nodes(vec![("node-a", None)]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(512, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(
            persisted.state,
            BatchState::Registered,
            "node is only offline, not structurally incapable; batch must stay pending for a later tick"
        );
    }

    #[tokio::test]
    async fn no_node_ever_capable_fails_without_retry() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_node_mirror("node-a").await.unwrap();
        store.set_node_online("node-a", 512, 4, Utc::now()).await.unwrap();
        store.set_node_offline("node-a", Utc::now(), Some("unreachable".to_string())).await.unwrap();
        let config = config_with_nodes(vec![("node-a", None)]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(4096, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.state, BatchState::Failed, "no node, online or offline, has enough ram");
    }

    #[tokio::test]
    async fn binpack_prefers_busiest_node_that_still_fits() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "roomy", 8192).await;
        online_node(&store, "snug", 4096).await;
        let mut config = config_with_nodes(vec![("roomy", None), ("snug", None)]);
        config.controller.scheduling_strategy = agency_core::config::SchedulingStrategy::Binpack;
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(2048, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.node.as_deref(), Some("snug"), "binpack fills the tighter-fitting node first");
    }

    #[tokio::test]
    async fn spread_prefers_emptiest_node_that_fits() {
        let store = Arc::new(InMemoryStore::new());
        online_node(&store, "roomy", 8192).await;
        online_node(&store, "snug", 4096).await;
        let mut config = config_with_nodes(vec![("roomy", None), ("snug", None)]);
        config.controller.scheduling_strategy = agency_core::config::SchedulingStrategy::Spread;
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);

        let exp = experiment(2048, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let b = batch(exp._id);
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.schedule_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert_eq!(persisted.node.as_deref(), Some("roomy"), "spread leaves the most headroom free");
    }

    #[tokio::test]
    async fn notify_terminal_batches_marks_flag_even_with_no_hooks() {
        let store = Arc::new(InMemoryStore::new());
        let config = config_with_nodes(vec![]);
        let (scheduler, _loops) = scheduler_with(Arc::clone(&store), &config);
        assert!(config.controller.notification_hooks.is_empty());

        let exp = experiment(1024, None, 64);
        store.insert_experiment(exp.clone()).await.unwrap();
        let mut b = batch(exp._id);
        b.state = BatchState::Succeeded;
        store.insert_batch(b.clone()).await.unwrap();

        scheduler.notify_terminal_batches().await.unwrap();

        let persisted = store.get_batch(&b._id).await.unwrap().unwrap();
        assert!(
            persisted.notifications_sent,
            "the empty hook set is vacuously satisfied; the flag must still flip so the ticker can quiesce"
        );
    }
}
