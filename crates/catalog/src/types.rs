//! Core types for resource and certificate declarations

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Numeric resource identifier (CTID / VMID), stable across runs
pub type ResourceId = u32;

/// What kind of guest a resource is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// LXC container
    #[default]
    #[serde(alias = "lxc")]
    Container,
    /// QEMU virtual machine
    #[serde(alias = "vm")]
    VirtualMachine,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::VirtualMachine => write!(f, "vm"),
        }
    }
}

/// How a resource comes into existence. Exactly one is declared per resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CreationMethod {
    /// Create from a named OS template available to the hypervisor
    BaseTemplate { name: String },
    /// Create from an archive produced from another resource
    ArchiveTemplate { file: String, source_id: ResourceId },
    /// Clone an existing resource
    CloneFrom { source_id: ResourceId },
}

impl CreationMethod {
    /// The resource this method needs to exist first, if any
    pub fn source_id(&self) -> Option<ResourceId> {
        match self {
            Self::BaseTemplate { .. } => None,
            Self::ArchiveTemplate { source_id, .. } | Self::CloneFrom { source_id } => {
                Some(*source_id)
            }
        }
    }

    /// The clone source, only for `CloneFrom`
    pub fn clone_source(&self) -> Option<ResourceId> {
        match self {
            Self::CloneFrom { source_id } => Some(*source_id),
            _ => None,
        }
    }

    /// Short label used in documents and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::BaseTemplate { .. } => "base_template",
            Self::ArchiveTemplate { .. } => "archive_template",
            Self::CloneFrom { .. } => "clone",
        }
    }
}

impl fmt::Display for CreationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaseTemplate { name } => write!(f, "base template {name}"),
            Self::ArchiveTemplate { file, source_id } => {
                write!(f, "archive {file} (from {source_id})")
            }
            Self::CloneFrom { source_id } => write!(f, "clone of {source_id}"),
        }
    }
}

/// Storage allocation for the root disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default = "default_storage_pool")]
    pub pool: String,
    #[serde(default = "default_storage_size")]
    pub size_gb: u32,
}

fn default_storage_pool() -> String {
    "local-lvm".to_string()
}

fn default_storage_size() -> u32 {
    32
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            pool: default_storage_pool(),
            size_gb: default_storage_size(),
        }
    }
}

/// Compute allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory", rename = "memoryMB")]
    pub memory_mb: u64,
    #[serde(default)]
    pub storage: StorageSpec,
}

fn default_cores() -> u32 {
    2
}

fn default_memory() -> u64 {
    2048
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            memory_mb: default_memory(),
            storage: StorageSpec::default(),
        }
    }
}

/// Primary network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default = "default_interface")]
    pub name: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// CIDR address, e.g. `10.0.0.103/24`; `None` means DHCP
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, alias = "gw")]
    pub gateway: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            name: default_interface(),
            bridge: default_bridge(),
            ip: None,
            gateway: None,
            mac: None,
        }
    }
}

/// A feature to apply, with handler-specific arguments
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSpec {
    pub name: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl FeatureSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: serde_json::Map::new(),
        }
    }

    /// Look up a string argument
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Readiness probe executed inside the resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub command: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

fn default_retries() -> u32 {
    10
}

fn default_interval() -> u64 {
    5
}

impl HealthCheck {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Bind mount from the host into the resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Traffic direction for a firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// A single per-resource firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(rename = "type")]
    pub direction: Direction,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub dest: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_action() -> String {
    "ACCEPT".to_string()
}

/// Per-resource firewall configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

/// One provisionable unit, validated and immutable after load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDefinition {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Hostname; defaults to `phoenix-<id>`
    pub name: String,
    pub creation_method: CreationMethod,
    pub resources: ResourceSpec,
    pub network: NetworkSpec,
    pub features: Vec<FeatureSpec>,
    pub application_script: Option<String>,
    pub health_check: Option<HealthCheck>,
    pub mount_points: Vec<MountPoint>,
    pub firewall: FirewallSpec,
    pub explicit_dependencies: BTreeSet<ResourceId>,
}

impl ResourceDefinition {
    /// Every id this resource needs before it can be created
    pub fn prerequisites(&self) -> BTreeSet<ResourceId> {
        let mut ids = self.explicit_dependencies.clone();
        if let Some(source) = self.creation_method.source_id() {
            ids.insert(source);
        }
        ids
    }
}

/// A certificate under automated lifecycle management
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    pub common_name: String,
    pub subject_alt_names: Vec<String>,
    pub owning_resource_id: ResourceId,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// `user:group`, names or numeric ids
    pub owner: Option<String>,
    pub renewal_threshold_hours: u64,
    pub post_renewal_command: Option<String>,
}

impl CertificateRecord {
    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_hours.saturating_mul(3600))
    }
}
