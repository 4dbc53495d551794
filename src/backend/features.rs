//! Feature handlers
//!
//! Two kinds:
//!
//! - script features run an install script once inside the resource and
//!   leave a `feature-<name>` marker
//! - passthrough features write `devN` device entries and require a
//!   restart; they are present once their readiness command succeeds

use anyhow::{Result, bail};
use catalog::{FeatureSpec, ResourceId};
use converge::{ControlPlane, FeatureEffect, FeatureHandler, FeatureRegistry, Readiness};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::{PassthroughSettings, Settings};

pub fn feature_marker(name: &str) -> String {
    format!("feature-{name}")
}

/// Runs `<script_dir>/<script>` once; a `script` argument overrides the file
pub struct ScriptFeature {
    name: String,
    script: PathBuf,
}

impl ScriptFeature {
    pub fn new(name: &str, script: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            script,
        }
    }

    fn script_for(&self, feature: &FeatureSpec) -> PathBuf {
        match feature.arg_str("script") {
            Some(file) => self
                .script
                .parent()
                .map_or_else(|| PathBuf::from(file), |dir| dir.join(file)),
            None => self.script.clone(),
        }
    }
}

impl FeatureHandler for ScriptFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_present(
        &self,
        control: &dyn ControlPlane,
        id: ResourceId,
        _feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<bool> {
        control.has_marker(id, &feature_marker(&self.name), timeout)
    }

    fn apply(
        &self,
        control: &dyn ControlPlane,
        id: ResourceId,
        feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<FeatureEffect> {
        let script = self.script_for(feature);
        log::info!("{id}: installing {} via {}", self.name, script.display());

        let output = control.run_script(id, &script, timeout)?;
        if !output.success() {
            bail!(
                "{} exited with status {}: {}",
                script.display(),
                output.exit_code,
                output.tail(5)
            );
        }
        control.set_marker(id, &feature_marker(&self.name), timeout)?;
        Ok(FeatureEffect::Applied)
    }
}

/// Host device passthrough
pub struct PassthroughFeature {
    name: String,
    settings: PassthroughSettings,
}

impl PassthroughFeature {
    pub fn new(name: &str, settings: PassthroughSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
        }
    }

    fn readiness(&self) -> Readiness {
        Readiness {
            command: self.settings.readiness.clone(),
            attempts: self.settings.attempts,
            interval: Duration::from_secs(self.settings.interval_seconds),
        }
    }
}

impl FeatureHandler for PassthroughFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_present(
        &self,
        control: &dyn ControlPlane,
        id: ResourceId,
        _feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<bool> {
        // A stopped resource or a missing binary both read as absent
        match control.exec(id, &self.settings.readiness, timeout) {
            Ok(output) => Ok(output.success()),
            Err(e) => {
                log::debug!("{id}: {} readiness probe failed: {e:#}", self.name);
                Ok(false)
            }
        }
    }

    fn apply(
        &self,
        control: &dyn ControlPlane,
        id: ResourceId,
        _feature: &FeatureSpec,
        timeout: Duration,
    ) -> Result<FeatureEffect> {
        for (i, device) in self.settings.devices.iter().enumerate() {
            control.set_option(id, &format!("dev{i}"), device, timeout)?;
        }
        Ok(FeatureEffect::RestartRequired {
            readiness: self.readiness(),
        })
    }
}

/// Registry with every feature `settings` declares
pub fn registry(settings: &Settings, control: Arc<dyn ControlPlane>) -> FeatureRegistry {
    let script_dir = settings.script_dir();
    let mut registry = FeatureRegistry::new(control);

    for (name, script) in &settings.features.scripts {
        registry.register(Box::new(ScriptFeature::new(name, script_dir.join(script))));
    }
    for (name, passthrough) in &settings.features.passthrough {
        registry.register(Box::new(PassthroughFeature::new(name, passthrough.clone())));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::ResourceDefinition;
    use converge::{ExecOutput, FeatureRunner};
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Fake {
        markers: Mutex<BTreeSet<String>>,
        options: Mutex<Vec<(String, String)>>,
        scripts: Mutex<Vec<PathBuf>>,
        script_exit: i32,
        ready: bool,
    }

    impl ControlPlane for Fake {
        fn exists(&self, _id: ResourceId, _t: Duration) -> Result<bool> {
            Ok(true)
        }
        fn create(&self, _d: &ResourceDefinition, _t: Duration) -> Result<()> {
            Ok(())
        }
        fn is_configured(&self, _d: &ResourceDefinition, _t: Duration) -> Result<bool> {
            Ok(true)
        }
        fn configure(&self, _d: &ResourceDefinition, _t: Duration) -> Result<()> {
            Ok(())
        }
        fn is_running(&self, _id: ResourceId, _t: Duration) -> Result<bool> {
            Ok(true)
        }
        fn start(&self, _id: ResourceId, _t: Duration) -> Result<()> {
            Ok(())
        }
        fn stop(&self, _id: ResourceId, _t: Duration) -> Result<()> {
            Ok(())
        }
        fn set_option(&self, _id: ResourceId, key: &str, value: &str, _t: Duration) -> Result<()> {
            self.options
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(())
        }
        fn exec(&self, _id: ResourceId, command: &str, _t: Duration) -> Result<ExecOutput> {
            if command == "missing" {
                bail!("pct exec failed: CT is not running");
            }
            Ok(ExecOutput {
                exit_code: i32::from(!self.ready),
                ..ExecOutput::default()
            })
        }
        fn run_script(&self, _id: ResourceId, script: &Path, _t: Duration) -> Result<ExecOutput> {
            self.scripts.lock().unwrap().push(script.to_path_buf());
            Ok(ExecOutput {
                stderr: "E: Unable to locate package docker-ce".to_string(),
                exit_code: self.script_exit,
                ..ExecOutput::default()
            })
        }
        fn has_marker(&self, id: ResourceId, marker: &str, _t: Duration) -> Result<bool> {
            Ok(self.markers.lock().unwrap().contains(&format!("{id}/{marker}")))
        }
        fn set_marker(&self, id: ResourceId, marker: &str, _t: Duration) -> Result<()> {
            self.markers.lock().unwrap().insert(format!("{id}/{marker}"));
            Ok(())
        }
        fn has_snapshot(&self, _id: ResourceId, _l: &str, _t: Duration) -> Result<bool> {
            Ok(false)
        }
        fn snapshot(&self, _id: ResourceId, _l: &str, _t: Duration) -> Result<()> {
            Ok(())
        }
    }

    const T: Duration = Duration::from_secs(1);

    fn docker() -> ScriptFeature {
        ScriptFeature::new("docker", PathBuf::from("/opt/setup/install_docker.sh"))
    }

    #[test]
    fn test_script_feature_runs_once_and_marks() {
        let control = Fake::default();
        let spec = FeatureSpec::new("docker");
        let feature = docker();

        assert!(!feature.is_present(&control, 103, &spec, T).unwrap());
        assert_eq!(feature.apply(&control, 103, &spec, T).unwrap(), FeatureEffect::Applied);
        assert!(feature.is_present(&control, 103, &spec, T).unwrap());
        assert!(!feature.is_present(&control, 104, &spec, T).unwrap());
        assert_eq!(
            *control.scripts.lock().unwrap(),
            vec![PathBuf::from("/opt/setup/install_docker.sh")]
        );
    }

    #[test]
    fn test_script_argument_overrides_file() {
        let mut spec = FeatureSpec::new("docker");
        spec.args
            .insert("script".to_string(), serde_json::json!("install_docker_rootless.sh"));
        assert_eq!(
            docker().script_for(&spec),
            PathBuf::from("/opt/setup/install_docker_rootless.sh")
        );
    }

    #[test]
    fn test_failed_script_leaves_no_marker() {
        let control = Fake {
            script_exit: 100,
            ..Fake::default()
        };
        let spec = FeatureSpec::new("docker");
        let err = docker().apply(&control, 103, &spec, T).unwrap_err();

        assert!(err.to_string().contains("status 100"));
        assert!(err.to_string().contains("docker-ce"));
        assert!(control.markers.lock().unwrap().is_empty());
    }

    fn nvidia() -> PassthroughFeature {
        PassthroughFeature::new(
            "nvidia",
            PassthroughSettings {
                devices: vec!["/dev/nvidia0".to_string(), "/dev/nvidiactl".to_string()],
                readiness: "nvidia-smi".to_string(),
                attempts: 5,
                interval_seconds: 2,
            },
        )
    }

    #[test]
    fn test_passthrough_writes_devices_and_requires_restart() {
        let control = Fake::default();
        let effect = nvidia()
            .apply(&control, 950, &FeatureSpec::new("nvidia"), T)
            .unwrap();

        assert_eq!(
            effect,
            FeatureEffect::RestartRequired {
                readiness: Readiness {
                    command: "nvidia-smi".to_string(),
                    attempts: 5,
                    interval: Duration::from_secs(2),
                }
            }
        );
        assert_eq!(
            *control.options.lock().unwrap(),
            vec![
                ("dev0".to_string(), "/dev/nvidia0".to_string()),
                ("dev1".to_string(), "/dev/nvidiactl".to_string()),
            ]
        );
    }

    #[test]
    fn test_passthrough_presence_follows_readiness() {
        let spec = FeatureSpec::new("nvidia");
        let ready = Fake {
            ready: true,
            ..Fake::default()
        };
        assert!(nvidia().is_present(&ready, 950, &spec, T).unwrap());
        assert!(!nvidia().is_present(&Fake::default(), 950, &spec, T).unwrap());

        let unreachable = PassthroughFeature::new(
            "nvidia",
            PassthroughSettings {
                readiness: "missing".to_string(),
                ..PassthroughSettings::default()
            },
        );
        assert!(!unreachable.is_present(&ready, 950, &spec, T).unwrap());
    }

    #[test]
    fn test_registry_from_settings() {
        let registry = registry(&Settings::default(), Arc::new(Fake::default()));
        for name in ["base_setup", "docker", "ollama", "vllm", "nvidia"] {
            assert!(registry.knows(name), "{name}");
        }
        assert!(!registry.knows("portainer"));
    }
}
