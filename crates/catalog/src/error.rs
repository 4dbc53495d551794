//! Error types for the catalog crate
//!
//! Every variant is a configuration error: the declarative documents are
//! malformed, ambiguous, or reference something that does not exist. These
//! are raised at load time, before any infrastructure is touched.

use crate::types::ResourceId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or querying the catalog
#[derive(Error, Debug)]
pub enum Error {
    /// Document could not be read from disk
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid JSON or has the wrong top-level shape
    #[error("malformed {document} document: {reason}")]
    Document {
        document: &'static str,
        reason: String,
    },

    /// A resource definition has an invalid field
    #[error("resource {id}: invalid `{field}`: {reason}")]
    InvalidResource {
        id: ResourceId,
        field: &'static str,
        reason: String,
    },

    /// Two definitions share the same numeric id
    #[error("resource {id}: duplicate id")]
    DuplicateId { id: ResourceId },

    /// A requested or referenced id is not defined in the catalog
    #[error("resource {id} is not defined in the catalog")]
    UnknownResource { id: ResourceId },

    /// A certificate record has an invalid field
    #[error("certificate `{common_name}`: invalid `{field}`: {reason}")]
    InvalidCertificate {
        common_name: String,
        field: &'static str,
        reason: String,
    },
}

impl Error {
    pub(crate) fn resource(id: ResourceId, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            id,
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn certificate(
        common_name: &str,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidCertificate {
            common_name: common_name.to_string(),
            field,
            reason: reason.into(),
        }
    }

    /// The resource id this error is about, if any
    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            Self::InvalidResource { id, .. }
            | Self::DuplicateId { id }
            | Self::UnknownResource { id } => Some(*id),
            _ => None,
        }
    }
}

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, Error>;
