//! Shared configuration, layered file → environment → in-code defaults,
//! the way the teacher's cluster binary does it. `trustee` and `controller`
//! each load this once and read only the sections they need.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgencyConfig {
    pub broker: BrokerConfig,
    pub controller: ControllerConfig,
    pub trustee: TrusteeConfig,
    pub mongo: MongoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub external_url: String,
    #[serde(default)]
    pub auth: BrokerAuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerAuthConfig {
    pub num_login_attempts: u32,
    pub block_for_seconds: u64,
    pub tokens_valid_for_seconds: u64,
}

impl Default for BrokerAuthConfig {
    fn default() -> Self {
        Self {
            num_login_attempts: 3,
            block_for_seconds: 300,
            tokens_valid_for_seconds: 604_800,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationHookConfig {
    pub url: String,
    #[serde(default)]
    pub auth: Option<BasicAuthConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GpuHardwareConfig {
    pub id: i64,
    pub vram: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeHardwareConfig {
    #[serde(default)]
    pub gpus: Vec<GpuHardwareConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerNodeConfig {
    pub base_url: String,
    #[serde(default)]
    pub tls: Option<NodeTlsConfig>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub hardware: Option<NodeHardwareConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeTlsConfig {
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerFleetConfig {
    #[serde(default)]
    pub nodes: HashMap<String, DockerNodeConfig>,
    #[serde(default)]
    pub allow_insecure_capabilities: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub bind_socket_path: String,
    #[serde(default)]
    pub notification_hooks: Vec<NotificationHookConfig>,
    pub docker: DockerFleetConfig,
    #[serde(default = "default_scheduling_strategy")]
    pub scheduling_strategy: SchedulingStrategy,
    /// Path, on the controller's own filesystem, of the in-container agent
    /// executable shipped into every batch's container alongside its Blue
    /// descriptor (spec §4.4 step 9 / §4.6 step 5). Built and placed here by
    /// the deployment's build step; the controller only reads and ships it.
    pub agent_binary_path: String,
}

fn default_scheduling_strategy() -> SchedulingStrategy {
    SchedulingStrategy::Binpack
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    Spread,
    Binpack,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrusteeConfig {
    pub bind_socket_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MongoConfig {
    #[serde(default = "default_mongo_host")]
    pub host: String,
    #[serde(default = "default_mongo_port")]
    pub port: u16,
    pub db: String,
    pub username: String,
    pub password: String,
}

fn default_mongo_host() -> String {
    "localhost".to_string()
}

fn default_mongo_port() -> u16 {
    27017
}

impl MongoConfig {
    pub fn connection_uri(&self) -> String {
        format!(
            "mongodb://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.db
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig {
                external_url: "http://localhost:8080".to_string(),
                auth: BrokerAuthConfig::default(),
            },
            controller: ControllerConfig {
                bind_socket_path: "/var/run/agency/controller.sock".to_string(),
                notification_hooks: Vec::new(),
                docker: DockerFleetConfig {
                    nodes: HashMap::new(),
                    allow_insecure_capabilities: false,
                },
                scheduling_strategy: SchedulingStrategy::Binpack,
                agent_binary_path: "/opt/agency/blue_agent.py".to_string(),
            },
            trustee: TrusteeConfig {
                bind_socket_path: "/var/run/agency/trustee.sock".to_string(),
            },
            mongo: MongoConfig {
                host: default_mongo_host(),
                port: default_mongo_port(),
                db: "agency".to_string(),
                username: String::new(),
                password: String::new(),
            },
            logging: LoggingConfig {
                level: "info,agency=debug".to_string(),
                format: LogFormat::Pretty,
                output: LogOutput::Stdout,
            },
        }
    }
}

impl AgencyConfig {
    /// Load `agency.{toml,yaml,...}` layered with `AGENCY__`-prefixed
    /// environment overrides, falling back to compiled-in defaults.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&AgencyConfig::default())
            .context("failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        for path in ["/etc/agency/agency", "config/agency"] {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AGENCY")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.mongo.db.is_empty() {
            anyhow::bail!("mongo.db must not be empty");
        }
        if self.controller.docker.nodes.is_empty() {
            anyhow::bail!("controller.docker.nodes must configure at least one node");
        }
        if self.controller.agent_binary_path.is_empty() {
            anyhow::bail!("controller.agent_binary_path must not be empty");
        }
        Ok(())
    }
}
