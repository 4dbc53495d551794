//! `phoenix.toml` - operator settings
//!
//! Every section is optional; a missing file yields the defaults below.

use anyhow::{Context, Result};
use converge::{EngineOptions, Timeouts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub documents: DocumentSettings,
    pub timeouts: TimeoutSettings,
    pub health: HealthSettings,
    pub snapshot: SnapshotSettings,
    pub execution: ExecutionSettings,
    pub features: FeatureSettings,
    pub proxmox: ProxmoxSettings,
    pub ca: CaSettings,
    pub locks: LockSettings,

    /// Directory relative document and script paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSettings {
    pub resources: String,
    pub certificates: Option<String>,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            resources: "phoenix_lxc_configs.json".to_string(),
            certificates: Some("certificate-manifest.json".to_string()),
        }
    }
}

/// Per-call timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub control: u64,
    pub feature: u64,
    pub script: u64,
    pub ca: u64,
    pub hook: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            control: 300,
            feature: 1800,
            script: 3600,
            ca: 120,
            hook: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Upper bound on any single health or readiness wait
    pub deadline_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub label: String,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            label: "phoenix-template".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// 1 converges strictly sequentially
    pub jobs: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self { jobs: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    /// Directory holding feature and application scripts
    pub script_dir: String,
    /// Feature name -> script file, run once inside the resource
    pub scripts: BTreeMap<String, String>,
    /// Hardware passthrough features
    pub passthrough: BTreeMap<String, PassthroughSettings>,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        let scripts = [
            ("base_setup", "phoenix_hypervisor_feature_install_base_setup.sh"),
            ("docker", "phoenix_hypervisor_feature_install_docker.sh"),
            ("ollama", "phoenix_hypervisor_feature_install_ollama.sh"),
            ("vllm", "phoenix_hypervisor_feature_install_vllm.sh"),
        ]
        .into_iter()
        .map(|(name, script)| (name.to_string(), script.to_string()))
        .collect();

        let passthrough = BTreeMap::from([(
            "nvidia".to_string(),
            PassthroughSettings {
                devices: vec![
                    "/dev/nvidia0".to_string(),
                    "/dev/nvidiactl".to_string(),
                    "/dev/nvidia-uvm".to_string(),
                    "/dev/nvidia-uvm-tools".to_string(),
                ],
                readiness: "nvidia-smi".to_string(),
                attempts: 10,
                interval_seconds: 3,
            },
        )]);

        Self {
            script_dir: "/usr/local/phoenix_hypervisor/bin/lxc_setup".to_string(),
            scripts,
            passthrough,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughSettings {
    /// Host device nodes, written as `dev0`, `dev1`, ...
    pub devices: Vec<String>,
    /// Command that succeeds inside the resource once the device is usable
    pub readiness: String,
    pub attempts: u32,
    pub interval_seconds: u64,
}

impl Default for PassthroughSettings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            readiness: "true".to_string(),
            attempts: 10,
            interval_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxSettings {
    pub pct: String,
    pub qm: String,
    /// Where completion markers live inside resources
    pub marker_dir: String,
    pub firewall_dir: String,
    /// Storage for base-template volumes (`<storage>:vztmpl/<name>`)
    pub template_storage: String,
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            pct: "pct".to_string(),
            qm: "qm".to_string(),
            marker_dir: "/var/lib/phoenix/markers".to_string(),
            firewall_dir: "/etc/pve/firewall".to_string(),
            template_storage: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaSettings {
    pub step: String,
    pub openssl: String,
    pub ca_url: Option<String>,
    pub root: Option<String>,
    pub provisioner: Option<String>,
    pub password_file: Option<String>,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            step: "step".to_string(),
            openssl: "openssl".to_string(),
            ca_url: None,
            root: None,
            provisioner: None,
            password_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Renewal run-lock; defaults to `renew-certs.lock` in the state dir
    pub renew: Option<String>,
}

impl Settings {
    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(paths::config_dir);

        if !path.exists() {
            log::debug!("{} not found, using defaults", path.display());
            return Ok(Self {
                base_dir,
                ..Self::default()
            });
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file: {}", path.display()))?;
        let mut settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        settings.base_dir = base_dir;
        Ok(settings)
    }

    pub fn resources_path(&self) -> PathBuf {
        paths::resolve_against(&self.base_dir, &self.documents.resources)
    }

    pub fn certificates_path(&self) -> Option<PathBuf> {
        self.documents
            .certificates
            .as_deref()
            .map(|p| paths::resolve_against(&self.base_dir, p))
    }

    pub fn script_dir(&self) -> PathBuf {
        paths::resolve_against(&self.base_dir, &self.features.script_dir)
    }

    pub fn lock_path(&self) -> PathBuf {
        match &self.locks.renew {
            Some(path) => paths::expand(path),
            None => paths::state_dir().join("renew-certs.lock"),
        }
    }

    pub fn engine_options(&self, jobs: Option<usize>) -> EngineOptions {
        EngineOptions {
            timeouts: Timeouts {
                control: Duration::from_secs(self.timeouts.control),
                feature: Duration::from_secs(self.timeouts.feature),
                script: Duration::from_secs(self.timeouts.script),
            },
            snapshot_label: self.snapshot.label.clone(),
            health_deadline: self.health.deadline_seconds.map(Duration::from_secs),
            jobs: jobs.unwrap_or(self.execution.jobs).max(1),
            script_dir: self.script_dir(),
        }
    }

    pub fn renew_options(&self, dry_run: bool) -> certkit::RenewOptions {
        certkit::RenewOptions {
            ca_timeout: Duration::from_secs(self.timeouts.ca),
            hook_timeout: Duration::from_secs(self.timeouts.hook),
            dry_run,
        }
    }
}
