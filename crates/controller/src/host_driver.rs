//! Host driver — the abstract per-node container engine capability set the
//! rest of the controller is allowed to depend on. The real implementation
//! talks to a node's Docker daemon remotely over TLS via `bollard`, grounded
//! in the teacher's `docker/{client,container,image}.rs`; the trait split
//! (real vs. fake) is grounded in the teacher's `client/docker.rs`
//! `DockerOps` abstraction.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use thiserror::Error;

use agency_core::model::Engine;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0}")]
    Diagnostic(String),
}

impl DriverError {
    pub fn diagnostic(&self) -> &str {
        match self {
            DriverError::Diagnostic(s) => s,
        }
    }
}

impl From<bollard::errors::Error> for DriverError {
    fn from(e: bollard::errors::Error) -> Self {
        DriverError::Diagnostic(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFilter {
    Running,
    Exited,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Both,
}

/// Mirrors the driver contract's declared `list` fields; `status` is part of
/// that contract even where today's only caller already knows it from the
/// filter it passed in.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub name: String,
    #[allow(dead_code)]
    pub status: ContainerFilter,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ram_mib: u64,
    pub cpus: u32,
}

/// Everything needed to create a container for one batch, per spec §4.2.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub user: String,
    pub mem_limit_mib: u64,
    pub memswap_limit_mib: u64,
    pub runtime: &'static str,
    pub env: HashMap<String, String>,
    pub network: Option<String>,
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
}

pub fn engine_to_runtime(engine: Engine) -> &'static str {
    engine.runtime()
}

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[async_trait]
pub trait HostDriver: Send + Sync {
    async fn info(&self) -> Result<NodeInfo, DriverError>;
    async fn pull(&self, image_url: &str, auth: Option<RegistryAuth>) -> Result<(), DriverError>;
    async fn create(&self, spec: CreateSpec) -> Result<String, DriverError>;
    async fn start(&self, container: &str) -> Result<(), DriverError>;
    async fn put_archive(&self, container: &str, path: &str, tar_bytes: Vec<u8>) -> Result<(), DriverError>;
    async fn list(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, DriverError>;
    async fn logs(&self, container: &str, stream: LogStream) -> Result<Vec<u8>, DriverError>;
    async fn remove(&self, container: &str, force: bool) -> Result<(), DriverError>;
    async fn run_one_shot(
        &self,
        image: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        network: Option<String>,
    ) -> Result<(), DriverError>;
}

/// Real, bollard-backed driver connected to one node's Docker daemon. When
/// `tls` is set the connection is TCP + client TLS (the standard remote
/// Docker Engine API); otherwise a plain TCP/unix connection per `base_url`.
pub struct BollardHostDriver {
    client: Docker,
}

#[derive(Debug, Clone)]
pub struct NodeTls {
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
}

impl BollardHostDriver {
    pub fn connect(base_url: &str, tls: Option<&NodeTls>) -> Result<Self, DriverError> {
        let client = match tls {
            Some(tls) => Docker::connect_with_ssl(
                base_url,
                Path::new(&tls.client_key),
                Path::new(&tls.client_cert),
                Path::new(&tls.ca_cert),
                120,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_http(base_url, 120, bollard::API_DEFAULT_VERSION)?,
        };
        Ok(Self { client })
    }
}

#[async_trait]
impl HostDriver for BollardHostDriver {
    async fn info(&self) -> Result<NodeInfo, DriverError> {
        let info = self.client.info().await?;
        let ram_mib = (info.mem_total.unwrap_or(0) / (1024 * 1024)) as u64;
        let cpus = info.ncpu.unwrap_or(0) as u32;
        Ok(NodeInfo { ram_mib, cpus })
    }

    async fn pull(&self, image_url: &str, auth: Option<RegistryAuth>) -> Result<(), DriverError> {
        use bollard::auth::DockerCredentials;
        use bollard::query_parameters::CreateImageOptions;
        use futures::StreamExt;

        let options = Some(CreateImageOptions {
            from_image: Some(image_url.to_string()),
            ..Default::default()
        });
        let credentials = auth.map(|a| DockerCredentials {
            username: a.username,
            password: a.password,
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, credentials);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DriverError::Diagnostic(format!("pull {image_url} failed: {e}")))?;
        }
        Ok(())
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, DriverError> {
        use bollard::models::{ContainerCreateBody, HostConfig};
        use bollard::query_parameters::CreateContainerOptions;

        let env: Vec<String> = spec.env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        let host_config = HostConfig {
            memory: Some((spec.mem_limit_mib * 1024 * 1024) as i64),
            memory_swap: Some((spec.memswap_limit_mib * 1024 * 1024) as i64),
            runtime: Some(spec.runtime.to_string()),
            network_mode: spec.network.clone(),
            devices: Some(
                spec.devices
                    .into_iter()
                    .map(|d| bollard::models::DeviceMapping {
                        path_on_host: Some(d.clone()),
                        path_in_container: Some(d),
                        cgroup_permissions: Some("rwm".to_string()),
                    })
                    .collect(),
            ),
            cap_add: Some(spec.cap_add),
            security_opt: Some(spec.security_opt),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image),
            cmd: Some(spec.command),
            user: Some(spec.user),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name),
            ..Default::default()
        });

        let response = self.client.create_container(options, body).await?;
        Ok(response.id)
    }

    async fn start(&self, container: &str) -> Result<(), DriverError> {
        self.client.start_container(container, None::<bollard::query_parameters::StartContainerOptions>).await?;
        Ok(())
    }

    async fn put_archive(&self, container: &str, path: &str, tar_bytes: Vec<u8>) -> Result<(), DriverError> {
        use bollard::query_parameters::UploadToContainerOptions;

        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(container, Some(options), bollard::body_full(tar_bytes.into()))
            .await?;
        Ok(())
    }

    async fn list(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, DriverError> {
        use bollard::query_parameters::ListContainersOptions;

        let mut status_filter = HashMap::new();
        match filter {
            ContainerFilter::Running => {
                status_filter.insert("status".to_string(), vec!["running".to_string()]);
            }
            ContainerFilter::Exited => {
                status_filter.insert("status".to_string(), vec!["exited".to_string()]);
            }
            ContainerFilter::Any => {}
        }

        let options = Some(ListContainersOptions {
            all: true,
            filters: Some(status_filter),
            ..Default::default()
        });

        let containers = self.client.list_containers(options).await?;
        Ok(containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string();
                let status = match c.state {
                    Some(bollard::models::ContainerSummaryStateEnum::RUNNING) => ContainerFilter::Running,
                    Some(bollard::models::ContainerSummaryStateEnum::EXITED) => ContainerFilter::Exited,
                    _ => ContainerFilter::Any,
                };
                ContainerSummary { name, status }
            })
            .collect())
    }

    async fn logs(&self, container: &str, stream: LogStream) -> Result<Vec<u8>, DriverError> {
        use bollard::query_parameters::LogsOptions;
        use futures::StreamExt;

        let options = Some(LogsOptions {
            stdout: matches!(stream, LogStream::Stdout | LogStream::Both),
            stderr: matches!(stream, LogStream::Stderr | LogStream::Both),
            ..Default::default()
        });

        let mut out = Vec::new();
        let mut logs = self.client.logs(container, options);
        while let Some(chunk) = logs.next().await {
            let chunk = chunk?;
            out.extend_from_slice(&chunk.into_bytes());
        }
        Ok(out)
    }

    async fn remove(&self, container: &str, force: bool) -> Result<(), DriverError> {
        use bollard::query_parameters::RemoveContainerOptions;

        let options = Some(RemoveContainerOptions { force, ..Default::default() });
        match self.client.remove_container(container, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn run_one_shot(
        &self,
        image: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        network: Option<String>,
    ) -> Result<(), DriverError> {
        let spec = CreateSpec {
            image: image.to_string(),
            name: format!("agency-probe-{}", uuid::Uuid::new_v4()),
            command,
            user: "0:0".to_string(),
            mem_limit_mib: 64,
            memswap_limit_mib: 64,
            runtime: "runc",
            env,
            network,
            devices: Vec::new(),
            cap_add: Vec::new(),
            security_opt: Vec::new(),
        };
        let id = self.create(spec).await?;
        self.start(&id).await?;

        loop {
            let summaries = self.list(ContainerFilter::Any).await?;
            if !summaries.iter().any(|c| c.name == id || c.name.starts_with("agency-probe")) {
                break;
            }
            let running = self.list(ContainerFilter::Running).await?;
            if !running.iter().any(|c| c.name == id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        self.remove(&id, true).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct Inner {
        containers: Map<String, ContainerFilter>,
        pull_failures: Map<String, String>,
    }

    /// Deterministic test double — grounded in the teacher's `client/fake.rs` split.
    #[derive(Default)]
    pub struct FakeHostDriver {
        inner: Mutex<Inner>,
    }

    impl FakeHostDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_pull(&self, image: &str, diagnostic: &str) {
            self.inner.lock().pull_failures.insert(image.to_string(), diagnostic.to_string());
        }

        pub fn set_container_state(&self, name: &str, state: ContainerFilter) {
            self.inner.lock().containers.insert(name.to_string(), state);
        }
    }

    #[async_trait]
    impl HostDriver for FakeHostDriver {
        async fn info(&self) -> Result<NodeInfo, DriverError> {
            Ok(NodeInfo { ram_mib: 8192, cpus: 4 })
        }

        async fn pull(&self, image_url: &str, _auth: Option<RegistryAuth>) -> Result<(), DriverError> {
            if let Some(diag) = self.inner.lock().pull_failures.get(image_url) {
                return Err(DriverError::Diagnostic(diag.clone()));
            }
            Ok(())
        }

        async fn create(&self, spec: CreateSpec) -> Result<String, DriverError> {
            self.inner.lock().containers.insert(spec.name.clone(), ContainerFilter::Running);
            Ok(spec.name)
        }

        async fn start(&self, _container: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn put_archive(&self, _container: &str, _path: &str, _tar_bytes: Vec<u8>) -> Result<(), DriverError> {
            Ok(())
        }

        async fn list(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, DriverError> {
            let inner = self.inner.lock();
            Ok(inner
                .containers
                .iter()
                .filter(|(_, status)| filter == ContainerFilter::Any || **status == filter)
                .map(|(name, status)| ContainerSummary { name: name.clone(), status: *status })
                .collect())
        }

        async fn logs(&self, _container: &str, _stream: LogStream) -> Result<Vec<u8>, DriverError> {
            Ok(br#"{"state":"succeeded"}"#.to_vec())
        }

        async fn remove(&self, container: &str, _force: bool) -> Result<(), DriverError> {
            self.inner.lock().containers.remove(container);
            Ok(())
        }

        async fn run_one_shot(
            &self,
            _image: &str,
            _command: Vec<String>,
            _env: HashMap<String, String>,
            _network: Option<String>,
        ) -> Result<(), DriverError> {
            Ok(())
        }
    }
}
