//! Error types for certificate renewal

use catalog::ResourceId;
use std::path::PathBuf;
use thiserror::Error;

/// Collaborator errors are carried boxed so the chain survives
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the certificate lifecycle manager
#[derive(Error, Debug)]
pub enum Error {
    /// Another renewal run currently holds the lock
    #[error("another renewal run is in progress (lock held on {})", path.display())]
    RunLockHeld { path: PathBuf },

    #[error("failed to open run lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{common_name}: expiry lookup failed: {source}")]
    Expiry {
        common_name: String,
        #[source]
        source: BoxError,
    },

    #[error("{common_name}: certificate issuance failed: {source}")]
    Issuance {
        common_name: String,
        #[source]
        source: BoxError,
    },

    #[error("{common_name}: invalid owner `{owner}`: {reason}")]
    Owner {
        common_name: String,
        owner: String,
        reason: String,
    },

    #[error("{common_name}: failed to install {}: {source}", path.display())]
    Install {
        common_name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The certificate was installed, but its consumer did not reload
    #[error("{common_name}: post-renewal hook on resource {id} failed: {source}")]
    Hook {
        common_name: String,
        id: ResourceId,
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Process exit code for this error class
    pub fn code(&self) -> i32 {
        match self {
            Self::Expiry { .. }
            | Self::Issuance { .. }
            | Self::Owner { .. }
            | Self::Install { .. } => 20,
            Self::Hook { .. } => 21,
            Self::RunLockHeld { .. } => 22,
            Self::Lock { .. } => 1,
        }
    }

    /// Short taxonomy name, as shown to operators
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Expiry { .. }
            | Self::Issuance { .. }
            | Self::Owner { .. }
            | Self::Install { .. } => "CertificateIssuanceError",
            Self::Hook { .. } => "PostRenewalHookError",
            Self::RunLockHeld { .. } => "RunLockHeld",
            Self::Lock { .. } => "IoError",
        }
    }
}

/// Result type for renewal operations
pub type Result<T> = std::result::Result<T, Error>;
