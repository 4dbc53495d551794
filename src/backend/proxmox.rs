//! `pct` / `qm` control plane
//!
//! Containers are driven through `pct`, virtual machines through `qm`.
//! Query methods only read (`status`, `config`, `listsnapshot`, `test -f`);
//! everything else is a single CLI call that Proxmox itself treats as
//! idempotent or that is only issued after a query said it is needed.

use anyhow::{Context, Result, bail};
use catalog::{
    Catalog, CreationMethod, Direction, FirewallSpec, ResourceDefinition, ResourceId,
    ResourceKind,
};
use converge::{ControlPlane, ExecOutput};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::runner::{self, shell_quote};
use crate::settings::ProxmoxSettings;

static CONFIG_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([a-z][a-z0-9_-]*):\s*(.*)$").ok());

/// Where pushed scripts land inside a container
const GUEST_SCRIPT_DIR: &str = "/tmp";

pub struct Proxmox {
    catalog: Arc<Catalog>,
    settings: ProxmoxSettings,
    snapshot_label: String,
}

impl Proxmox {
    pub fn new(catalog: Arc<Catalog>, settings: ProxmoxSettings, snapshot_label: &str) -> Self {
        Self {
            catalog,
            settings,
            snapshot_label: snapshot_label.to_string(),
        }
    }

    fn kind(&self, id: ResourceId) -> ResourceKind {
        self.catalog.get(id).map(|d| d.kind).unwrap_or_default()
    }

    fn tool(&self, kind: ResourceKind) -> &str {
        match kind {
            ResourceKind::Container => &self.settings.pct,
            ResourceKind::VirtualMachine => &self.settings.qm,
        }
    }

    fn call(&self, kind: ResourceKind, args: &[&str], timeout: Duration) -> Result<String> {
        runner::run_checked(self.tool(kind), args, timeout)
    }

    fn status(&self, id: ResourceId, timeout: Duration) -> Result<ExecOutput> {
        runner::run_capture(self.tool(self.kind(id)), &["status", &id.to_string()], timeout)
    }

    /// Current `pct config` / `qm config` as key/value pairs
    fn config(&self, id: ResourceId, timeout: Duration) -> Result<BTreeMap<String, String>> {
        let out = self.call(self.kind(id), &["config", &id.to_string()], timeout)?;
        Ok(parse_config(&out))
    }

    /// Template volume: bare names live on the template storage
    fn volume(&self, name: &str) -> String {
        if name.contains(':') || name.starts_with('/') {
            name.to_string()
        } else {
            format!("{}:vztmpl/{}", self.settings.template_storage, name)
        }
    }

    fn firewall_path(&self, id: ResourceId) -> PathBuf {
        Path::new(&self.settings.firewall_dir).join(format!("{id}.fw"))
    }

    fn marker_path(&self, marker: &str) -> String {
        format!("{}/{}", self.settings.marker_dir.trim_end_matches('/'), marker)
    }

    fn firewall_matches(&self, definition: &ResourceDefinition) -> Result<bool> {
        let Some(desired) = render_firewall(&definition.firewall) else {
            return Ok(true);
        };
        let path = self.firewall_path(definition.id);
        match fs::read_to_string(&path) {
            Ok(current) => Ok(current == desired),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn create_args(&self, definition: &ResourceDefinition) -> Vec<String> {
        let id = definition.id.to_string();
        let pool = &definition.resources.storage.pool;
        let vm = definition.kind == ResourceKind::VirtualMachine;

        let mut args: Vec<String> = match &definition.creation_method {
            CreationMethod::BaseTemplate { name } if vm => vec![
                "create".into(),
                id,
                "--name".into(),
                definition.name.clone(),
                "--scsi0".into(),
                format!("{pool}:0,import-from={}", self.volume(name)),
            ],
            CreationMethod::BaseTemplate { name } => vec![
                "create".into(),
                id,
                self.volume(name),
                "--hostname".into(),
                definition.name.clone(),
                "--rootfs".into(),
                format!("{pool}:{}", definition.resources.storage.size_gb),
            ],
            CreationMethod::ArchiveTemplate { file, .. } if vm => {
                return vec![file.clone(), id, "--storage".into(), pool.clone()];
            }
            CreationMethod::ArchiveTemplate { file, .. } => vec![
                "restore".into(),
                id,
                self.volume(file),
                "--storage".into(),
                pool.clone(),
            ],
            CreationMethod::CloneFrom { source_id } => vec![
                "clone".into(),
                source_id.to_string(),
                id,
                if vm { "--name" } else { "--hostname" }.into(),
                definition.name.clone(),
                "--full".into(),
                "1".into(),
            ],
        };

        if let CreationMethod::BaseTemplate { .. } = definition.creation_method {
            for (key, value) in desired_options(definition) {
                if key != "hostname" && key != "name" {
                    args.push(format!("--{key}"));
                    args.push(value);
                }
            }
        }
        args
    }
}

/// Parse `pct config` / `qm config` output; snapshot sections are ignored
pub fn parse_config(output: &str) -> BTreeMap<String, String> {
    let Some(re) = CONFIG_LINE.as_ref() else {
        return BTreeMap::new();
    };
    output
        .lines()
        .take_while(|line| !line.trim_start().starts_with('['))
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| (caps[1].to_string(), caps[2].trim().to_string()))
        .collect()
}

/// Snapshot names from `pct listsnapshot` / `qm listsnapshot`
pub fn parse_snapshots(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            line.trim_start_matches(|c: char| c.is_whitespace() || "`->".contains(c))
                .split_whitespace()
                .next()
        })
        .filter(|name| *name != "current")
        .map(str::to_string)
        .collect()
}

/// Options that must be present in the resource config
pub fn desired_options(definition: &ResourceDefinition) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    let spec = &definition.resources;
    let net = &definition.network;
    options.insert("cores".to_string(), spec.cores.to_string());
    options.insert("memory".to_string(), spec.memory_mb.to_string());

    match definition.kind {
        ResourceKind::Container => {
            options.insert("hostname".to_string(), definition.name.clone());

            let mut net0 = vec![format!("name={}", net.name), format!("bridge={}", net.bridge)];
            if let Some(mac) = &net.mac {
                net0.push(format!("hwaddr={mac}"));
            }
            net0.push(format!("ip={}", net.ip.as_deref().unwrap_or("dhcp")));
            if let Some(gw) = &net.gateway {
                net0.push(format!("gw={gw}"));
            }
            if definition.firewall.enabled {
                net0.push("firewall=1".to_string());
            }
            options.insert("net0".to_string(), net0.join(","));

            for (i, mount) in definition.mount_points.iter().enumerate() {
                let mut value = format!("{},mp={}", mount.host_path, mount.container_path);
                if mount.read_only {
                    value.push_str(",ro=1");
                }
                options.insert(format!("mp{i}"), value);
            }
        }
        ResourceKind::VirtualMachine => {
            options.insert("name".to_string(), definition.name.clone());

            let model = match &net.mac {
                Some(mac) => format!("virtio={mac}"),
                None => "virtio".to_string(),
            };
            let mut net0 = vec![model, format!("bridge={}", net.bridge)];
            if definition.firewall.enabled {
                net0.push("firewall=1".to_string());
            }
            options.insert("net0".to_string(), net0.join(","));

            let mut ipconfig = vec![format!("ip={}", net.ip.as_deref().unwrap_or("dhcp"))];
            if let Some(gw) = &net.gateway {
                ipconfig.push(format!("gw={gw}"));
            }
            options.insert("ipconfig0".to_string(), ipconfig.join(","));
        }
    }
    options
}

/// Whether every comma-separated item of `desired` appears in `current`.
///
/// A bare item (`virtio`) matches any `virtio=...` in `current`, since
/// Proxmox fills in generated values such as MAC addresses.
pub fn option_matches(desired: &str, current: &str) -> bool {
    let items: Vec<&str> = current.split(',').map(str::trim).collect();
    desired.split(',').map(str::trim).all(|want| {
        items.iter().any(|have| {
            *have == want
                || (!want.contains('=') && have.split_once('=').is_some_and(|(k, _)| k == want))
        })
    })
}

/// Keys whose current value does not satisfy the desired one
pub fn drifted(
    desired: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<String> {
    desired
        .iter()
        .filter(|(key, value)| {
            current
                .get(*key)
                .is_none_or(|have| !option_matches(value, have))
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Proxmox `<id>.fw` content, or `None` when no firewall is declared
pub fn render_firewall(firewall: &FirewallSpec) -> Option<String> {
    if !firewall.enabled && firewall.rules.is_empty() {
        return None;
    }

    let mut out = String::from("[OPTIONS]\n");
    out.push_str(&format!("enable: {}\n", u8::from(firewall.enabled)));
    out.push_str("\n[RULES]\n");
    for rule in &firewall.rules {
        let direction = match rule.direction {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        let mut line = format!("{direction} {}", rule.action.to_uppercase());
        if let Some(proto) = &rule.proto {
            line.push_str(&format!(" -p {proto}"));
        }
        if let Some(source) = &rule.source {
            line.push_str(&format!(" -source {source}"));
        }
        if let Some(dest) = &rule.dest {
            line.push_str(&format!(" -dest {dest}"));
        }
        if let Some(port) = &rule.port {
            line.push_str(&format!(" -dport {port}"));
        }
        if let Some(comment) = &rule.comment {
            line.push_str(&format!(" # {comment}"));
        }
        out.push_str(&line);
        out.push('\n');
    }
    Some(out)
}

#[derive(Deserialize)]
struct GuestExec {
    #[serde(default)]
    exitcode: i32,
    #[serde(default, rename = "out-data")]
    out_data: String,
    #[serde(default, rename = "err-data")]
    err_data: String,
}

/// Parse the JSON `qm guest exec` prints
pub fn parse_guest_exec(output: &str) -> Result<ExecOutput> {
    let parsed: GuestExec =
        serde_json::from_str(output.trim()).context("Unexpected `qm guest exec` output")?;
    Ok(ExecOutput {
        stdout: parsed.out_data,
        stderr: parsed.err_data,
        exit_code: parsed.exitcode,
    })
}

impl ControlPlane for Proxmox {
    fn exists(&self, id: ResourceId, timeout: Duration) -> Result<bool> {
        let out = self.status(id, timeout)?;
        if out.success() {
            return Ok(true);
        }
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("does not exist") || stderr.contains("no such") {
            return Ok(false);
        }
        bail!("Could not query status of {id}: {}", out.tail(3))
    }

    fn create(&self, definition: &ResourceDefinition, timeout: Duration) -> Result<()> {
        let mut args = self.create_args(definition);

        if let CreationMethod::CloneFrom { source_id } = definition.creation_method
            && self.has_snapshot(source_id, &self.snapshot_label, timeout)?
        {
            args.push("--snapname".to_string());
            args.push(self.snapshot_label.clone());
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        log::info!("creating {} ({})", definition.id, definition.creation_method);

        let vm_restore = definition.kind == ResourceKind::VirtualMachine
            && matches!(definition.creation_method, CreationMethod::ArchiveTemplate { .. });
        if vm_restore {
            runner::run_checked("qmrestore", &args, timeout)?;
        } else {
            self.call(definition.kind, &args, timeout)?;
        }
        Ok(())
    }

    fn is_configured(&self, definition: &ResourceDefinition, timeout: Duration) -> Result<bool> {
        let current = self.config(definition.id, timeout)?;
        let drift = drifted(&desired_options(definition), &current);
        if !drift.is_empty() {
            log::debug!("{}: options differ: {}", definition.id, drift.join(", "));
            return Ok(false);
        }
        self.firewall_matches(definition)
    }

    fn configure(&self, definition: &ResourceDefinition, timeout: Duration) -> Result<()> {
        let desired = desired_options(definition);
        let current = self.config(definition.id, timeout)?;
        let drift = drifted(&desired, &current);

        if !drift.is_empty() {
            let id = definition.id.to_string();
            let mut args = vec!["set".to_string(), id];
            for key in &drift {
                args.push(format!("--{key}"));
                args.push(desired[key].clone());
            }
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.call(definition.kind, &args, timeout)?;
        }

        if let Some(content) = render_firewall(&definition.firewall) {
            let path = self.firewall_path(definition.id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }

    fn is_running(&self, id: ResourceId, timeout: Duration) -> Result<bool> {
        let out = self.status(id, timeout)?;
        if !out.success() {
            bail!("Could not query status of {id}: {}", out.tail(3));
        }
        Ok(out.stdout.contains("status: running"))
    }

    fn start(&self, id: ResourceId, timeout: Duration) -> Result<()> {
        self.call(self.kind(id), &["start", &id.to_string()], timeout)?;
        Ok(())
    }

    fn stop(&self, id: ResourceId, timeout: Duration) -> Result<()> {
        self.call(self.kind(id), &["stop", &id.to_string()], timeout)?;
        Ok(())
    }

    fn set_option(&self, id: ResourceId, key: &str, value: &str, timeout: Duration) -> Result<()> {
        let flag = format!("--{key}");
        self.call(self.kind(id), &["set", &id.to_string(), &flag, value], timeout)?;
        Ok(())
    }

    fn exec(&self, id: ResourceId, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let id_arg = id.to_string();
        match self.kind(id) {
            ResourceKind::Container => runner::run_capture(
                &self.settings.pct,
                &["exec", &id_arg, "--", "sh", "-c", command],
                timeout,
            ),
            ResourceKind::VirtualMachine => {
                let secs = timeout.as_secs().max(1).to_string();
                let out = runner::run_checked(
                    &self.settings.qm,
                    &["guest", "exec", &id_arg, "--timeout", &secs, "--", "sh", "-c", command],
                    timeout,
                )?;
                parse_guest_exec(&out)
            }
        }
    }

    fn run_script(&self, id: ResourceId, script: &Path, timeout: Duration) -> Result<ExecOutput> {
        let id_arg = id.to_string();
        match self.kind(id) {
            ResourceKind::Container => {
                let file = script
                    .file_name()
                    .with_context(|| format!("Not a script file: {}", script.display()))?;
                let guest = format!("{GUEST_SCRIPT_DIR}/{}", file.to_string_lossy());
                let host = script.to_string_lossy();
                runner::run_checked(
                    &self.settings.pct,
                    &["push", &id_arg, &host, &guest, "--perms", "0755"],
                    timeout,
                )?;
                self.exec(id, &format!("sh {}", shell_quote(&guest)), timeout)
            }
            ResourceKind::VirtualMachine => {
                let body = fs::read(script)
                    .with_context(|| format!("Failed to read {}", script.display()))?;
                let secs = timeout.as_secs().max(1).to_string();
                let out = runner::run_input(
                    &self.settings.qm,
                    &["guest", "exec", &id_arg, "--pass-stdin", "1", "--timeout", &secs, "--", "sh", "-s"],
                    Some(&body),
                    timeout,
                )?;
                if !out.success() {
                    bail!("`qm guest exec` failed on {id}: {}", out.tail(3));
                }
                parse_guest_exec(&out.stdout)
            }
        }
    }

    fn has_marker(&self, id: ResourceId, marker: &str, timeout: Duration) -> Result<bool> {
        let command = format!("test -f {}", shell_quote(&self.marker_path(marker)));
        let out = self.exec(id, &command, timeout)?;
        Ok(out.success())
    }

    fn set_marker(&self, id: ResourceId, marker: &str, timeout: Duration) -> Result<()> {
        let command = format!(
            "mkdir -p {} && touch {}",
            shell_quote(&self.settings.marker_dir),
            shell_quote(&self.marker_path(marker))
        );
        let out = self.exec(id, &command, timeout)?;
        if !out.success() {
            bail!("Could not write marker {marker} on {id}: {}", out.tail(3));
        }
        Ok(())
    }

    fn has_snapshot(&self, id: ResourceId, label: &str, timeout: Duration) -> Result<bool> {
        let out = self.call(self.kind(id), &["listsnapshot", &id.to_string()], timeout)?;
        Ok(parse_snapshots(&out).iter().any(|name| name == label))
    }

    fn snapshot(&self, id: ResourceId, label: &str, timeout: Duration) -> Result<()> {
        self.call(self.kind(id), &["snapshot", &id.to_string(), label], timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<Catalog> {
        let resources = r#"{"resources": [
            {"id": 900, "name": "ubuntu-template",
             "creationMethod": {"type": "base_template", "ref": "ubuntu-24.04-standard_24.04-2_amd64.tar.zst"},
             "resources": {"cores": 4, "memoryMB": 8192, "storage": {"pool": "local-lvm", "sizeGb": 64}},
             "network": {"bridge": "vmbr0", "ip": "10.0.0.90/24", "gateway": "10.0.0.1"},
             "mountPoints": [{"hostPath": "/mnt/models", "containerPath": "/models", "readOnly": true}],
             "firewall": {"enabled": true, "rules": [
                {"type": "in", "proto": "tcp", "port": "22", "source": "10.0.0.0/24", "comment": "ssh"}
             ]}},
            {"id": 103, "name": "docker-base", "creationMethod": {"type": "clone", "ref": 900}},
            {"id": 8001, "kind": "vm", "name": "builder",
             "creationMethod": {"type": "base_template", "ref": "local:iso/noble.img"}}
        ]}"#;
        Arc::new(Catalog::from_documents(resources, None).unwrap())
    }

    fn proxmox() -> Proxmox {
        Proxmox::new(catalog(), ProxmoxSettings::default(), "phoenix-template")
    }

    #[test]
    fn test_parse_config_skips_snapshot_sections() {
        let out = "arch: amd64\ncores: 4\nhostname: ubuntu-template\nmemory: 8192\n\
                   net0: name=eth0,bridge=vmbr0,hwaddr=BC:24:11:AA:BB:CC,ip=dhcp,type=veth\n\
                   \n[phoenix-template]\ncores: 2\n";
        let config = parse_config(out);
        assert_eq!(config["cores"], "4");
        assert_eq!(config["hostname"], "ubuntu-template");
        assert!(config["net0"].contains("hwaddr="));
    }

    #[test]
    fn test_parse_snapshots() {
        let out = "`-> phoenix-template    2026-01-10 11:00:00     no-description\n \
                   `-> current                                    You are here!\n";
        assert_eq!(parse_snapshots(out), vec!["phoenix-template"]);
        assert!(parse_snapshots("").is_empty());
    }

    #[test]
    fn test_desired_options_container() {
        let catalog = catalog();
        let options = desired_options(catalog.get(900).unwrap());
        assert_eq!(options["cores"], "4");
        assert_eq!(options["memory"], "8192");
        assert_eq!(
            options["net0"],
            "name=eth0,bridge=vmbr0,ip=10.0.0.90/24,gw=10.0.0.1,firewall=1"
        );
        assert_eq!(options["mp0"], "/mnt/models,mp=/models,ro=1");
    }

    #[test]
    fn test_desired_options_vm() {
        let catalog = catalog();
        let options = desired_options(catalog.get(8001).unwrap());
        assert_eq!(options["name"], "builder");
        assert_eq!(options["net0"], "virtio,bridge=vmbr0");
        assert_eq!(options["ipconfig0"], "ip=dhcp");
        assert!(!options.contains_key("hostname"));
    }

    #[test]
    fn test_option_matches_generated_values() {
        assert!(option_matches(
            "name=eth0,bridge=vmbr0,ip=dhcp",
            "name=eth0,bridge=vmbr0,hwaddr=BC:24:11:AA:BB:CC,ip=dhcp,type=veth"
        ));
        assert!(option_matches("virtio,bridge=vmbr0", "virtio=BC:24:11:00:00:01,bridge=vmbr0"));
        assert!(!option_matches("name=eth0,bridge=vmbr1", "name=eth0,bridge=vmbr0"));
    }

    #[test]
    fn test_drifted_lists_missing_and_changed_keys() {
        let desired = BTreeMap::from([
            ("cores".to_string(), "4".to_string()),
            ("memory".to_string(), "8192".to_string()),
            ("mp0".to_string(), "/mnt/models,mp=/models".to_string()),
        ]);
        let current = parse_config("cores: 4\nmemory: 2048\n");
        assert_eq!(drifted(&desired, &current), vec!["memory", "mp0"]);
    }

    #[test]
    fn test_render_firewall() {
        let catalog = catalog();
        let rendered = render_firewall(&catalog.get(900).unwrap().firewall).unwrap();
        assert_eq!(
            rendered,
            "[OPTIONS]\nenable: 1\n\n[RULES]\nIN ACCEPT -p tcp -source 10.0.0.0/24 -dport 22 # ssh\n"
        );
        assert!(render_firewall(&FirewallSpec::default()).is_none());
    }

    #[test]
    fn test_parse_guest_exec() {
        let out = r#"{"exitcode": 1, "exited": 1, "err-data": "nvidia-smi: not found\n"}"#;
        let parsed = parse_guest_exec(out).unwrap();
        assert_eq!(parsed.exit_code, 1);
        assert_eq!(parsed.stderr.trim(), "nvidia-smi: not found");
        assert!(parse_guest_exec("not json").is_err());
    }

    #[test]
    fn test_create_args() {
        let px = proxmox();
        let base = px.create_args(px.catalog.get(900).unwrap());
        assert_eq!(
            &base[..7],
            &[
                "create",
                "900",
                "local:vztmpl/ubuntu-24.04-standard_24.04-2_amd64.tar.zst",
                "--hostname",
                "ubuntu-template",
                "--rootfs",
                "local-lvm:64",
            ]
        );
        assert!(base.windows(2).any(|w| w[0] == "--cores" && w[1] == "4"));

        let clone = px.create_args(px.catalog.get(103).unwrap());
        assert_eq!(
            clone,
            vec!["clone", "900", "103", "--hostname", "docker-base", "--full", "1"]
        );
    }

    #[test]
    fn test_volume_and_marker_paths() {
        let px = proxmox();
        assert_eq!(px.volume("debian.tar.zst"), "local:vztmpl/debian.tar.zst");
        assert_eq!(px.volume("nas:vztmpl/debian.tar.zst"), "nas:vztmpl/debian.tar.zst");
        assert_eq!(
            px.marker_path("feature-docker"),
            "/var/lib/phoenix/markers/feature-docker"
        );
        assert_eq!(px.firewall_path(900), PathBuf::from("/etc/pve/firewall/900.fw"));
    }
}
