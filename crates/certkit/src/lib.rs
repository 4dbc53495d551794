//! # Certkit
//!
//! Certificate lifecycle manager: renews certificates that are close to
//! expiry and reloads the services that consume them.
//!
//! For each record of the certificate manifest the expiry is looked up;
//! when `expiry - now <= threshold` a new certificate is issued by the CA,
//! written atomically with the record's ownership, and the record's
//! post-renewal command is run against its owning resource. A failing hook
//! is reported separately from a failed renewal: the new certificate stays
//! installed.
//!
//! Runs are serialised system-wide with a [`RunLock`].

pub mod error;
pub mod lock;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use lock::RunLock;
pub use store::{CERT_MODE, KEY_MODE, Ownership, Staged, stage, write_atomic};
pub use types::{IssuedCertificate, RenewOptions, RenewalOutcome, RenewalResult, exit_code};

use catalog::{CertificateRecord, ResourceId};
use chrono::{DateTime, TimeDelta, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External certificate authority
pub trait CertificateAuthority: Send + Sync {
    /// Current expiry of the installed certificate; `None` when there is none
    fn get_expiry(
        &self,
        record: &CertificateRecord,
        timeout: Duration,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;

    fn issue_certificate(
        &self,
        common_name: &str,
        subject_alt_names: &[String],
        timeout: Duration,
    ) -> anyhow::Result<IssuedCertificate>;
}

/// Runs post-renewal commands against a resource
pub trait HookRunner: Send + Sync {
    /// A non-zero exit status is an error
    fn run_hook(&self, id: ResourceId, command: &str, timeout: Duration) -> anyhow::Result<()>;
}

/// Whether a certificate expiring at `expires_at` must be renewed at `now`
pub fn is_due(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold_hours: u64) -> bool {
    let Some(expires_at) = expires_at else {
        return true;
    };
    let threshold = i64::try_from(threshold_hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .unwrap_or(TimeDelta::MAX);
    expires_at.signed_duration_since(now) <= threshold
}

/// Renew every record that is due at `now`
pub fn renew_due(
    records: &[CertificateRecord],
    now: DateTime<Utc>,
    ca: &dyn CertificateAuthority,
    hooks: &dyn HookRunner,
    options: &RenewOptions,
) -> Vec<RenewalResult> {
    records
        .iter()
        .map(|record| RenewalResult {
            common_name: record.common_name.clone(),
            resource_id: record.owning_resource_id,
            outcome: renew_one(record, now, ca, hooks, options),
        })
        .collect()
}

/// [`renew_due`] under the system-wide run lock at `lock_path`
pub fn renew_locked(
    lock_path: &Path,
    records: &[CertificateRecord],
    now: DateTime<Utc>,
    ca: &dyn CertificateAuthority,
    hooks: &dyn HookRunner,
    options: &RenewOptions,
) -> Result<Vec<RenewalResult>> {
    let _lock = RunLock::acquire(lock_path)?;
    Ok(renew_due(records, now, ca, hooks, options))
}

fn renew_one(
    record: &CertificateRecord,
    now: DateTime<Utc>,
    ca: &dyn CertificateAuthority,
    hooks: &dyn HookRunner,
    options: &RenewOptions,
) -> RenewalOutcome {
    let name = &record.common_name;

    let expires_at = match ca.get_expiry(record, options.ca_timeout) {
        Ok(expiry) => expiry,
        Err(e) => {
            return RenewalOutcome::Failed {
                error: Error::Expiry {
                    common_name: name.clone(),
                    source: e.into(),
                },
            };
        }
    };

    if let Some(at) = expires_at
        && !is_due(expires_at, now, record.renewal_threshold_hours)
    {
        log::trace!("{name}: not due (expires {at})");
        return RenewalOutcome::NotDue { expires_at: at };
    }

    if options.dry_run {
        log::info!("{name}: due for renewal (dry run)");
        return RenewalOutcome::Due { expires_at };
    }

    let ownership = match record.owner.as_deref().map(Ownership::parse).transpose() {
        Ok(ownership) => ownership,
        Err(reason) => {
            return RenewalOutcome::Failed {
                error: Error::Owner {
                    common_name: name.clone(),
                    owner: record.owner.clone().unwrap_or_default(),
                    reason,
                },
            };
        }
    };

    log::info!("{name}: requesting new certificate");
    let issued = match ca.issue_certificate(name, &record.subject_alt_names, options.ca_timeout) {
        Ok(issued) => issued,
        Err(e) => {
            return RenewalOutcome::Failed {
                error: Error::Issuance {
                    common_name: name.clone(),
                    source: e.into(),
                },
            };
        }
    };

    if let Err((path, source)) = install(record, &issued, ownership) {
        return RenewalOutcome::Failed {
            error: Error::Install {
                common_name: name.clone(),
                path,
                source,
            },
        };
    }
    log::info!("{name}: installed {}", record.cert_path.display());

    if let Some(command) = &record.post_renewal_command {
        log::info!(
            "{name}: running post-renewal hook on resource {}",
            record.owning_resource_id
        );
        if let Err(e) = hooks.run_hook(record.owning_resource_id, command, options.hook_timeout) {
            let error = Error::Hook {
                common_name: name.clone(),
                id: record.owning_resource_id,
                source: e.into(),
            };
            log::error!("{error}");
            return RenewalOutcome::HookFailed { error };
        }
    }

    RenewalOutcome::Renewed {
        previous_expiry: expires_at,
    }
}

/// Put the key and certificate in place as a pair
///
/// Both are staged before either is renamed, so a failed write leaves the
/// previous pair on disk.
fn install(
    record: &CertificateRecord,
    issued: &IssuedCertificate,
    ownership: Option<Ownership>,
) -> std::result::Result<(), (PathBuf, std::io::Error)> {
    let stage_one = |path: &PathBuf, contents: &[u8], mode| {
        stage(path, contents, mode, ownership).map_err(|e| (path.clone(), e))
    };
    let key = stage_one(&record.key_path, &issued.private_key, KEY_MODE)?;
    let cert = stage_one(&record.cert_path, &issued.certificate, CERT_MODE)?;

    for staged in [key, cert] {
        let path = staged.target().to_path_buf();
        staged.commit().map_err(|e| (path, e))?;
    }
    Ok(())
}
