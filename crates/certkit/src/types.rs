//! Core types for certificate renewal

use crate::error::Error;
use chrono::{DateTime, Utc};
use catalog::ResourceId;
use std::time::Duration;

/// Certificate and key material returned by the CA
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM certificate chain
    pub certificate: Vec<u8>,
    /// PEM private key
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// What happened to one certificate record
#[derive(Debug)]
pub enum RenewalOutcome {
    /// Expiry is further away than the threshold; nothing done
    NotDue { expires_at: DateTime<Utc> },
    /// Would be renewed; only produced in dry-run mode
    Due { expires_at: Option<DateTime<Utc>> },
    /// New certificate installed and its consumer reloaded
    Renewed { previous_expiry: Option<DateTime<Utc>> },
    /// New certificate installed, but the post-renewal hook failed.
    /// The certificate is kept.
    HookFailed { error: Error },
    /// Nothing was installed
    Failed { error: Error },
}

/// Per-record renewal result
#[derive(Debug)]
pub struct RenewalResult {
    pub common_name: String,
    pub resource_id: ResourceId,
    pub outcome: RenewalOutcome,
}

impl RenewalResult {
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            RenewalOutcome::HookFailed { error } | RenewalOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// A new certificate is on disk after this run
    pub fn installed(&self) -> bool {
        matches!(
            self.outcome,
            RenewalOutcome::Renewed { .. } | RenewalOutcome::HookFailed { .. }
        )
    }
}

/// Exit code of the first failed record, 0 when every record succeeded
pub fn exit_code(results: &[RenewalResult]) -> i32 {
    results
        .iter()
        .find_map(RenewalResult::error)
        .map_or(0, Error::code)
}

/// Options for a renewal run
#[derive(Debug, Clone)]
pub struct RenewOptions {
    /// Per-call timeout for CA operations
    pub ca_timeout: Duration,
    /// Timeout for a single post-renewal hook
    pub hook_timeout: Duration,
    /// Report due records without issuing anything
    pub dry_run: bool,
}

impl Default for RenewOptions {
    fn default() -> Self {
        Self {
            ca_timeout: Duration::from_secs(120),
            hook_timeout: Duration::from_secs(300),
            dry_run: false,
        }
    }
}
