//! Raw document shapes and their conversion into validated types
//!
//! Documents are parsed entry by entry so that a malformed entry is
//! reported against its resource id instead of a byte offset.

use crate::error::{Error, Result};
use crate::types::{
    CertificateRecord, CreationMethod, FeatureSpec, FirewallSpec, HealthCheck, MountPoint,
    NetworkSpec, ResourceDefinition, ResourceId, ResourceKind, ResourceSpec,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    id: ResourceId,
    #[serde(default)]
    kind: ResourceKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    creation_method: Option<RawCreationMethod>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default, rename = "template_file")]
    template_file: Option<String>,
    #[serde(default, rename = "clone_from_ctid")]
    clone_from_ctid: Option<ResourceId>,
    #[serde(default)]
    resources: ResourceSpec,
    #[serde(default)]
    network: NetworkSpec,
    #[serde(default)]
    features: Vec<RawFeature>,
    #[serde(default)]
    application_script: Option<String>,
    #[serde(default)]
    health_check: Option<HealthCheck>,
    #[serde(default)]
    mount_points: Vec<MountPoint>,
    #[serde(default)]
    firewall: FirewallSpec,
    #[serde(default)]
    explicit_dependencies: Vec<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCreationMethod {
    #[serde(rename = "type")]
    method: String,
    #[serde(default, rename = "ref")]
    reference: Option<Value>,
    #[serde(default)]
    source_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFeature {
    Name(String),
    WithArgs {
        name: String,
        #[serde(default)]
        args: serde_json::Map<String, Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertificate {
    common_name: String,
    #[serde(default)]
    sans: Vec<String>,
    resource_id: ResourceId,
    cert_path: PathBuf,
    key_path: PathBuf,
    #[serde(default)]
    owner: Option<String>,
    renewal_threshold_hours: u64,
    #[serde(default)]
    post_renewal_command: Option<String>,
}

/// Split a document into entries: a bare array, or an object holding the
/// collection under one of `keys`. With `keyed`, the collection may also be
/// an object mapping ids to entries, as in `{"lxc_configs": {"900": {..}}}`.
fn entries(json: &str, document: &'static str, keys: &[&str], keyed: bool) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(json).map_err(|e| Error::Document {
        document,
        reason: e.to_string(),
    })?;
    let shape_error = || Error::Document {
        document,
        reason: format!(
            "expected an array or an object with a `{}` collection",
            keys.join("` or `")
        ),
    };

    let collection = match value {
        items @ Value::Array(_) => items,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| map.remove(*key))
            .ok_or_else(shape_error)?,
        _ => return Err(shape_error()),
    };

    match collection {
        Value::Array(items) => Ok(items),
        Value::Object(map) if keyed => map
            .into_iter()
            .map(|(key, entry)| keyed_entry(document, &key, entry))
            .collect(),
        _ => Err(shape_error()),
    }
}

/// Give an entry of a keyed collection the id it is filed under
fn keyed_entry(document: &'static str, key: &str, entry: Value) -> Result<Value> {
    let id: u64 = key.parse().map_err(|_| Error::Document {
        document,
        reason: format!("key `{key}` is not a numeric id"),
    })?;
    let Value::Object(mut fields) = entry else {
        return Err(Error::Document {
            document,
            reason: format!("entry `{key}` is not an object"),
        });
    };

    match fields.get("id").map(Value::as_u64) {
        None => {
            fields.insert("id".to_string(), Value::from(id));
        }
        Some(Some(declared)) if declared == id => {}
        Some(_) => {
            return Err(Error::Document {
                document,
                reason: format!("entry `{key}` declares a different `id`"),
            });
        }
    }
    Ok(Value::Object(fields))
}

/// Parse the resource document into definitions (per-entry checks only)
pub(crate) fn parse_resources(json: &str) -> Result<Vec<ResourceDefinition>> {
    entries(json, "resource", &["resources", "lxc_configs"], true)?
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let id = entry
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| ResourceId::try_from(id).ok())
                .ok_or_else(|| Error::Document {
                    document: "resource",
                    reason: format!("entry {index} has no numeric `id`"),
                })?;
            let raw: RawResource = serde_json::from_value(entry)
                .map_err(|e| Error::resource(id, "document", e.to_string()))?;
            raw.into_definition()
        })
        .collect()
}

/// Parse the certificate manifest (per-entry checks only)
pub(crate) fn parse_certificates(json: &str) -> Result<Vec<CertificateRecord>> {
    entries(json, "certificate manifest", &["certificates"], false)?
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let label = entry
                .get("commonName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("entry {index}"));
            let raw: RawCertificate = serde_json::from_value(entry)
                .map_err(|e| Error::certificate(&label, "document", e.to_string()))?;
            raw.into_record()
        })
        .collect()
}

impl RawResource {
    fn into_definition(self) -> Result<ResourceDefinition> {
        let id = self.id;
        let creation_method = self.creation_method()?;

        let features = self
            .features
            .into_iter()
            .map(|f| match f {
                RawFeature::Name(name) => FeatureSpec::new(&name),
                RawFeature::WithArgs { name, args } => FeatureSpec { name, args },
            })
            .collect::<Vec<_>>();

        let mut seen = BTreeSet::new();
        for feature in &features {
            if feature.name.trim().is_empty() {
                return Err(Error::resource(id, "features", "empty feature name"));
            }
            if !seen.insert(feature.name.as_str()) {
                return Err(Error::resource(
                    id,
                    "features",
                    format!("feature `{}` listed twice", feature.name),
                ));
            }
        }

        if let Some(check) = &self.health_check {
            if check.command.trim().is_empty() {
                return Err(Error::resource(id, "healthCheck", "empty command"));
            }
            if check.retries == 0 {
                return Err(Error::resource(id, "healthCheck", "retries must be at least 1"));
            }
        }

        if self.resources.cores == 0 {
            return Err(Error::resource(id, "resources", "cores must be at least 1"));
        }

        if matches!(&self.application_script, Some(s) if s.trim().is_empty()) {
            return Err(Error::resource(id, "applicationScript", "empty script path"));
        }

        Ok(ResourceDefinition {
            id,
            kind: self.kind,
            name: self.name.unwrap_or_else(|| format!("phoenix-{id}")),
            creation_method,
            resources: self.resources,
            network: self.network,
            features,
            application_script: self.application_script,
            health_check: self.health_check,
            mount_points: self.mount_points,
            firewall: self.firewall,
            explicit_dependencies: self.explicit_dependencies.into_iter().collect(),
        })
    }

    /// Resolve the single declared creation method.
    ///
    /// The typed `creationMethod` object and the legacy keys are counted
    /// together; anything other than exactly one declaration is rejected.
    fn creation_method(&self) -> Result<CreationMethod> {
        let id = self.id;
        let mut declared = Vec::new();

        if let Some(raw) = &self.creation_method {
            declared.push(raw.to_method(id)?);
        }
        if let Some(name) = &self.template {
            declared.push(CreationMethod::BaseTemplate { name: name.clone() });
        }
        match (&self.template_file, self.clone_from_ctid) {
            (Some(file), Some(source_id)) => declared.push(CreationMethod::ArchiveTemplate {
                file: file.clone(),
                source_id,
            }),
            (Some(_), None) => {
                return Err(Error::resource(
                    id,
                    "template_file",
                    "archive template needs `clone_from_ctid` naming the source resource",
                ));
            }
            (None, Some(source_id)) => declared.push(CreationMethod::CloneFrom { source_id }),
            (None, None) => {}
        }

        match declared.len() {
            0 => Err(Error::resource(
                id,
                "creationMethod",
                "missing creation method",
            )),
            1 => Ok(declared.remove(0)),
            _ => Err(Error::resource(
                id,
                "creationMethod",
                format!(
                    "ambiguous creation method: {} declared ({})",
                    declared.len(),
                    declared
                        .iter()
                        .map(CreationMethod::label)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }
}

impl RawCreationMethod {
    fn to_method(&self, id: ResourceId) -> Result<CreationMethod> {
        let reference = self.reference.as_ref();
        match self.method.as_str() {
            "base_template" => {
                let name = reference
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| {
                        Error::resource(id, "creationMethod.ref", "base template needs a name")
                    })?;
                Ok(CreationMethod::BaseTemplate {
                    name: name.to_string(),
                })
            }
            "archive_template" => {
                let file = reference
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| {
                        Error::resource(id, "creationMethod.ref", "archive template needs a file")
                    })?;
                let source_id = self.source_id.ok_or_else(|| {
                    Error::resource(
                        id,
                        "creationMethod.sourceId",
                        "archive template needs a source resource id",
                    )
                })?;
                Ok(CreationMethod::ArchiveTemplate {
                    file: file.to_string(),
                    source_id,
                })
            }
            "clone" => {
                let source_id = reference
                    .and_then(reference_id)
                    .or(self.source_id)
                    .ok_or_else(|| {
                        Error::resource(id, "creationMethod.ref", "clone needs a source resource id")
                    })?;
                Ok(CreationMethod::CloneFrom { source_id })
            }
            other => Err(Error::resource(
                id,
                "creationMethod.type",
                format!("unknown method `{other}`"),
            )),
        }
    }
}

/// Accept ids as numbers or numeric strings
fn reference_id(value: &Value) -> Option<ResourceId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| ResourceId::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RawCertificate {
    fn into_record(self) -> Result<CertificateRecord> {
        let cn = self.common_name.trim();
        if cn.is_empty() {
            return Err(Error::certificate(&self.common_name, "commonName", "empty"));
        }
        if self.cert_path.as_os_str().is_empty() {
            return Err(Error::certificate(cn, "certPath", "empty path"));
        }
        if self.key_path.as_os_str().is_empty() {
            return Err(Error::certificate(cn, "keyPath", "empty path"));
        }
        if self.cert_path == self.key_path {
            return Err(Error::certificate(
                cn,
                "keyPath",
                "certificate and key must be written to different files",
            ));
        }
        if self.renewal_threshold_hours == 0 {
            return Err(Error::certificate(
                cn,
                "renewalThresholdHours",
                "must be greater than zero",
            ));
        }
        if let Some(owner) = &self.owner
            && owner.split(':').any(|part| part.trim().is_empty())
        {
            return Err(Error::certificate(cn, "owner", "expected `user:group`"));
        }

        Ok(CertificateRecord {
            common_name: cn.to_string(),
            subject_alt_names: self.sans,
            owning_resource_id: self.resource_id,
            cert_path: self.cert_path,
            key_path: self.key_path,
            owner: self.owner,
            renewal_threshold_hours: self.renewal_threshold_hours,
            post_renewal_command: self.post_renewal_command.filter(|c| !c.trim().is_empty()),
        })
    }
}
