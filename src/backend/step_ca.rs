//! step-ca certificate authority via the `step` and `openssl` CLIs

use anyhow::{Context, Result, bail};
use catalog::CertificateRecord;
use certkit::{CertificateAuthority, IssuedCertificate};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner;
use crate::settings::CaSettings;

pub struct StepCa {
    settings: CaSettings,
    /// Scratch directory for freshly issued files before certkit installs them
    work_dir: PathBuf,
}

impl StepCa {
    pub fn new(settings: CaSettings, work_dir: PathBuf) -> Self {
        Self { settings, work_dir }
    }

    fn issue_args(&self, common_name: &str, sans: &[String], crt: &str, key: &str) -> Vec<String> {
        let mut args = vec![
            "ca".to_string(),
            "certificate".to_string(),
            common_name.to_string(),
            crt.to_string(),
            key.to_string(),
        ];
        for san in sans {
            args.push("--san".to_string());
            args.push(san.clone());
        }
        let optional = [
            ("--ca-url", &self.settings.ca_url),
            ("--root", &self.settings.root),
            ("--provisioner", &self.settings.provisioner),
            ("--provisioner-password-file", &self.settings.password_file),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        args.push("--force".to_string());
        args
    }
}

/// Parse `notAfter=Mar  1 12:00:00 2026 GMT` as printed by `openssl x509 -enddate`
pub fn parse_enddate(output: &str) -> Result<DateTime<Utc>> {
    let value = output
        .trim()
        .strip_prefix("notAfter=")
        .with_context(|| format!("Unexpected openssl output: {}", output.trim()))?;
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let parsed = NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .with_context(|| format!("Unparseable expiry date: {value}"))?;
    Ok(parsed.and_utc())
}

fn file_stem(common_name: &str) -> String {
    common_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

impl CertificateAuthority for StepCa {
    fn get_expiry(
        &self,
        record: &CertificateRecord,
        timeout: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        if !record.cert_path.exists() {
            return Ok(None);
        }
        let path = record.cert_path.to_string_lossy();
        let out = runner::run_checked(
            &self.settings.openssl,
            &["x509", "-enddate", "-noout", "-in", &path],
            timeout,
        )?;
        parse_enddate(&out).map(Some)
    }

    fn issue_certificate(
        &self,
        common_name: &str,
        subject_alt_names: &[String],
        timeout: Duration,
    ) -> Result<IssuedCertificate> {
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;

        let stem = file_stem(common_name);
        let crt = self.work_dir.join(format!("{stem}.crt"));
        let key = self.work_dir.join(format!("{stem}.key"));
        let args = self.issue_args(
            common_name,
            subject_alt_names,
            &crt.to_string_lossy(),
            &key.to_string_lossy(),
        );
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let issued = runner::run_capture(&self.settings.step, &args, timeout).and_then(|output| {
            if !output.success() {
                bail!(
                    "step ca certificate {common_name} failed with status {}: {}",
                    output.exit_code,
                    output.tail(5)
                );
            }
            Ok(IssuedCertificate {
                certificate: read(&crt)?,
                private_key: read(&key)?,
            })
        });

        // Scratch copies never outlive the call
        for path in [&crt, &key] {
            let _ = fs::remove_file(path);
        }
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_parse_enddate() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_enddate("notAfter=Mar  1 12:00:00 2026 GMT\n").unwrap(), expected);
        assert_eq!(parse_enddate("notAfter=Mar 01 12:00:00 2026 GMT").unwrap(), expected);
        assert!(parse_enddate("unable to load certificate").is_err());
        assert!(parse_enddate("notAfter=sometime").is_err());
    }

    #[test]
    fn test_issue_args() {
        let ca = StepCa::new(
            CaSettings {
                ca_url: Some("https://ca.internal.thinkheads.ai:9000".to_string()),
                provisioner: Some("admin@thinkheads.ai".to_string()),
                ..CaSettings::default()
            },
            PathBuf::from("/tmp"),
        );
        let args = ca.issue_args(
            "portainer.internal.thinkheads.ai",
            &["10.0.0.101".to_string()],
            "/tmp/p.crt",
            "/tmp/p.key",
        );
        assert_eq!(
            args,
            vec![
                "ca",
                "certificate",
                "portainer.internal.thinkheads.ai",
                "/tmp/p.crt",
                "/tmp/p.key",
                "--san",
                "10.0.0.101",
                "--ca-url",
                "https://ca.internal.thinkheads.ai:9000",
                "--provisioner",
                "admin@thinkheads.ai",
                "--force",
            ]
        );
    }

    #[test]
    fn test_missing_certificate_has_no_expiry() {
        let dir = TempDir::new().unwrap();
        let ca = StepCa::new(CaSettings::default(), dir.path().join("ca"));
        let record = CertificateRecord {
            common_name: "traefik.internal".to_string(),
            subject_alt_names: Vec::new(),
            owning_resource_id: 102,
            cert_path: dir.path().join("traefik.crt"),
            key_path: dir.path().join("traefik.key"),
            owner: None,
            renewal_threshold_hours: 168,
            post_renewal_command: None,
        };
        assert_eq!(ca.get_expiry(&record, Duration::from_secs(5)).unwrap(), None);
    }

    fn fake_step(dir: &TempDir, status: i32) -> StepCa {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.path().join("step");
        fs::write(
            &script,
            format!("#!/bin/sh\necho CERT > \"$4\"\necho KEY > \"$5\"\necho 'token expired' >&2\nexit {status}\n"),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        StepCa::new(
            CaSettings {
                step: script.to_string_lossy().into_owned(),
                ..CaSettings::default()
            },
            dir.path().join("work"),
        )
    }

    #[test]
    fn test_failed_issue_removes_scratch_files() {
        let dir = TempDir::new().unwrap();
        let ca = fake_step(&dir, 1);

        let err = ca
            .issue_certificate("nginx.internal", &[], Duration::from_secs(5))
            .unwrap_err();

        assert!(err.to_string().contains("failed with status 1"));
        assert_eq!(fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[test]
    fn test_issue_reads_and_removes_scratch_files() {
        let dir = TempDir::new().unwrap();
        let ca = fake_step(&dir, 0);

        let issued = ca
            .issue_certificate("nginx.internal", &[], Duration::from_secs(5))
            .unwrap();

        assert_eq!(issued.certificate, b"CERT\n");
        assert_eq!(issued.private_key, b"KEY\n");
        assert_eq!(fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("*.internal.thinkheads.ai"), "_.internal.thinkheads.ai");
    }
}
