//! # catalog
//!
//! Declarative resource and certificate documents for phoenix.
//!
//! The catalog is loaded once at process start and is immutable afterwards.
//! Loading validates every cross-reference so later stages never see a
//! dangling id:
//!
//! - every resource declares exactly one creation method
//! - resource ids are unique
//! - clone / archive sources and explicit dependencies are defined
//! - certificate records point at a defined resource
//!
//! ## Example
//!
//! ```
//! use catalog::Catalog;
//!
//! let resources = r#"{"resources": [
//!     {"id": 900, "creationMethod": {"type": "base_template", "ref": "ubuntu-24.04"}},
//!     {"id": 103, "creationMethod": {"type": "clone", "ref": 900}}
//! ]}"#;
//!
//! let catalog = Catalog::from_documents(resources, None).unwrap();
//! assert!(catalog.is_template_source(900));
//! assert_eq!(catalog.clone_chain(103), vec![900]);
//! ```

mod document;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    CertificateRecord, CreationMethod, Direction, FeatureSpec, FirewallRule, FirewallSpec,
    HealthCheck, MountPoint, NetworkSpec, ResourceDefinition, ResourceId, ResourceKind,
    ResourceSpec, StorageSpec,
};

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Validated, read-only model of all declared resources and certificates
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    resources: BTreeMap<ResourceId, ResourceDefinition>,
    certificates: Vec<CertificateRecord>,
}

impl Catalog {
    /// Load both documents from disk
    pub fn load(resources: &Path, certificates: Option<&Path>) -> Result<Self> {
        let resources_json = read(resources)?;
        let certificates_json = certificates.map(read).transpose()?;
        Self::from_documents(&resources_json, certificates_json.as_deref())
    }

    /// Build a catalog from document contents
    pub fn from_documents(resources_json: &str, certificates_json: Option<&str>) -> Result<Self> {
        let mut resources = BTreeMap::new();
        for definition in document::parse_resources(resources_json)? {
            let id = definition.id;
            if resources.insert(id, definition).is_some() {
                return Err(Error::DuplicateId { id });
            }
        }

        let certificates = match certificates_json {
            Some(json) => document::parse_certificates(json)?,
            None => Vec::new(),
        };

        let catalog = Self {
            resources,
            certificates,
        };
        catalog.validate_references()?;
        Ok(catalog)
    }

    /// Every referenced id must be defined
    fn validate_references(&self) -> Result<()> {
        for definition in self.resources.values() {
            if let Some(source) = definition.creation_method.source_id()
                && !self.resources.contains_key(&source)
            {
                let field = match definition.creation_method {
                    CreationMethod::ArchiveTemplate { .. } => "creationMethod.sourceId",
                    _ => "creationMethod.ref",
                };
                return Err(Error::resource(
                    definition.id,
                    field,
                    format!("source resource {source} is not defined"),
                ));
            }

            if let Some(missing) = definition
                .explicit_dependencies
                .iter()
                .find(|dep| !self.resources.contains_key(dep))
            {
                return Err(Error::resource(
                    definition.id,
                    "explicitDependencies",
                    format!("resource {missing} is not defined"),
                ));
            }
        }

        for record in &self.certificates {
            if !self.resources.contains_key(&record.owning_resource_id) {
                return Err(Error::certificate(
                    &record.common_name,
                    "resourceId",
                    format!("resource {} is not defined", record.owning_resource_id),
                ));
            }
        }

        Ok(())
    }

    /// Reject any feature name the caller does not know how to apply
    pub fn validate_features<F>(&self, is_known: F) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        for definition in self.resources.values() {
            if let Some(feature) = definition.features.iter().find(|f| !is_known(&f.name)) {
                return Err(Error::resource(
                    definition.id,
                    "features",
                    format!("unknown feature `{}`", feature.name),
                ));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceDefinition> {
        self.resources.get(&id)
    }

    /// Get a definition or fail with [`Error::UnknownResource`]
    pub fn require(&self, id: ResourceId) -> Result<&ResourceDefinition> {
        self.resources.get(&id).ok_or(Error::UnknownResource { id })
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id)
    }

    /// All definitions in ascending id order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.resources.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn certificates(&self) -> &[CertificateRecord] {
        &self.certificates
    }

    /// `CloneFrom` ancestors of `id`, nearest first, excluding `id` itself.
    ///
    /// Stops at the first repeated id, so a cyclic declaration yields a
    /// finite chain here; the resolver is what reports the cycle.
    pub fn clone_chain(&self, id: ResourceId) -> Vec<ResourceId> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::from([id]);
        let mut current = id;

        while let Some(source) = self
            .resources
            .get(&current)
            .and_then(|d| d.creation_method.clone_source())
        {
            if !seen.insert(source) {
                break;
            }
            chain.push(source);
            current = source;
        }

        chain
    }

    /// Whether any other resource is created from this one
    pub fn is_template_source(&self, id: ResourceId) -> bool {
        self.resources
            .values()
            .any(|d| d.id != id && d.creation_method.source_id() == Some(id))
    }

    /// Resources whose creation method uses `id` as their source
    pub fn dependents_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.resources
            .values()
            .filter(|d| d.creation_method.source_id() == Some(id))
            .map(|d| d.id)
            .collect()
    }

    /// Declared features plus everything declared along the clone chain
    pub fn effective_features(&self, id: ResourceId) -> BTreeSet<String> {
        std::iter::once(id)
            .chain(self.clone_chain(id))
            .filter_map(|i| self.resources.get(&i))
            .flat_map(|d| d.features.iter().map(|f| f.name.clone()))
            .collect()
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(json: &str) -> Result<Catalog> {
        Catalog::from_documents(json, None)
    }

    #[test]
    fn test_parses_all_creation_method_forms() {
        let cat = catalog(
            r#"[
                {"id": 900, "creationMethod": {"type": "base_template", "ref": "ubuntu-24.04"}},
                {"id": 901, "creationMethod": {"type": "archive_template", "ref": "base.tar.zst", "sourceId": 900}},
                {"id": 103, "creationMethod": {"type": "clone", "ref": "900"}},
                {"id": 104, "clone_from_ctid": 103},
                {"id": 105, "template": "debian-12"},
                {"id": 106, "template_file": "gpu.tar.zst", "clone_from_ctid": 901}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            cat.get(901).unwrap().creation_method,
            CreationMethod::ArchiveTemplate {
                file: "base.tar.zst".into(),
                source_id: 900
            }
        );
        assert_eq!(
            cat.get(103).unwrap().creation_method,
            CreationMethod::CloneFrom { source_id: 900 }
        );
        assert_eq!(
            cat.get(104).unwrap().creation_method,
            CreationMethod::CloneFrom { source_id: 103 }
        );
        assert_eq!(
            cat.get(105).unwrap().creation_method,
            CreationMethod::BaseTemplate {
                name: "debian-12".into()
            }
        );
        assert_eq!(
            cat.get(106).unwrap().creation_method.source_id(),
            Some(901)
        );
    }

    #[test]
    fn test_missing_creation_method_names_resource() {
        let err = catalog(r#"[{"id": 120}]"#).unwrap_err();
        assert_eq!(err.resource_id(), Some(120));
        assert!(err.to_string().contains("missing creation method"));
    }

    #[test]
    fn test_ambiguous_creation_method_names_resource() {
        let err = catalog(
            r#"[
                {"id": 900, "template": "ubuntu"},
                {"id": 121, "template": "ubuntu", "clone_from_ctid": 900}
            ]"#,
        )
        .unwrap_err();
        assert_eq!(err.resource_id(), Some(121));
        assert!(err.to_string().contains("ambiguous"));

        let err = catalog(
            r#"[
                {"id": 900, "template": "ubuntu"},
                {"id": 122, "creationMethod": {"type": "clone", "ref": 900}, "template": "ubuntu"}
            ]"#,
        )
        .unwrap_err();
        assert_eq!(err.resource_id(), Some(122));
    }

    #[test]
    fn test_malformed_method_is_config_error() {
        let err = catalog(r#"[{"id": 1, "creationMethod": {"type": "teleport", "ref": "x"}}]"#)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidResource {
                id: 1,
                field: "creationMethod.type",
                ..
            }
        ));

        let err = catalog(r#"[{"id": 1, "creationMethod": {"type": "archive_template", "ref": "a.tar"}}]"#)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidResource {
                field: "creationMethod.sourceId",
                ..
            }
        ));
    }

    #[test]
    fn test_undefined_source_is_config_error() {
        let err = catalog(r#"[{"id": 103, "creationMethod": {"type": "clone", "ref": 900}}]"#)
            .unwrap_err();
        assert_eq!(err.resource_id(), Some(103));
        assert!(err.to_string().contains("900"));
    }

    #[test]
    fn test_undefined_explicit_dependency_is_config_error() {
        let err = catalog(r#"[{"id": 1, "template": "u", "explicitDependencies": [7]}]"#)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidResource {
                id: 1,
                field: "explicitDependencies",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = catalog(r#"[{"id": 5, "template": "a"}, {"id": 5, "template": "b"}]"#)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId { id: 5 }));
    }

    #[test]
    fn test_wrong_field_type_reports_resource() {
        let err = catalog(r#"[{"id": 8, "template": "a", "resources": {"cores": "many"}}]"#)
            .unwrap_err();
        assert_eq!(err.resource_id(), Some(8));
    }

    #[test]
    fn test_features_with_and_without_args() {
        let cat = catalog(
            r#"[{"id": 950, "template": "u", "features": [
                "base_setup",
                {"name": "nvidia", "args": {"devices": ["/dev/nvidia0"]}}
            ]}]"#,
        )
        .unwrap();
        let def = cat.get(950).unwrap();
        assert_eq!(def.features.len(), 2);
        assert_eq!(def.features[0].name, "base_setup");
        assert!(def.features[1].args.contains_key("devices"));

        let err = cat
            .validate_features(|name| name == "base_setup")
            .unwrap_err();
        assert!(err.to_string().contains("nvidia"));
        assert!(cat.validate_features(|_| true).is_ok());
    }

    #[test]
    fn test_clone_chain_and_effective_features() {
        let cat = catalog(
            r#"[
                {"id": 900, "template": "u", "features": ["base_setup"]},
                {"id": 901, "clone_from_ctid": 900, "features": ["nvidia"]},
                {"id": 950, "clone_from_ctid": 901, "features": ["vllm"]}
            ]"#,
        )
        .unwrap();

        assert_eq!(cat.clone_chain(950), vec![901, 900]);
        assert!(cat.clone_chain(900).is_empty());
        let features: Vec<_> = cat.effective_features(950).into_iter().collect();
        assert_eq!(features, vec!["base_setup", "nvidia", "vllm"]);
        assert!(cat.is_template_source(900));
        assert!(!cat.is_template_source(950));
        assert_eq!(cat.dependents_of(900), vec![901]);
    }

    #[test]
    fn test_clone_chain_terminates_on_cycle() {
        let cat = catalog(
            r#"[
                {"id": 1, "clone_from_ctid": 2},
                {"id": 2, "clone_from_ctid": 1}
            ]"#,
        )
        .unwrap();
        assert_eq!(cat.clone_chain(1), vec![2]);
    }

    #[test]
    fn test_certificate_manifest() {
        let resources = r#"[{"id": 101, "template": "u"}]"#;
        let certs = r#"{"certificates": [{
            "commonName": "nginx.internal.thinkheads.ai",
            "sans": ["gateway.internal.thinkheads.ai"],
            "resourceId": 101,
            "certPath": "/etc/nginx/ssl/nginx.crt",
            "keyPath": "/etc/nginx/ssl/nginx.key",
            "owner": "root:root",
            "renewalThresholdHours": 48,
            "postRenewalCommand": "systemctl reload nginx"
        }]}"#;

        let cat = Catalog::from_documents(resources, Some(certs)).unwrap();
        let record = &cat.certificates()[0];
        assert_eq!(record.owning_resource_id, 101);
        assert_eq!(record.renewal_threshold().as_secs(), 48 * 3600);
        assert_eq!(
            record.post_renewal_command.as_deref(),
            Some("systemctl reload nginx")
        );
    }

    #[test]
    fn test_huge_renewal_threshold_saturates() {
        let resources = r#"[{"id": 101, "template": "u"}]"#;
        let certs = format!(
            r#"[{{"commonName": "a", "resourceId": 101, "certPath": "/a.crt",
                "keyPath": "/a.key", "renewalThresholdHours": {}}}]"#,
            u64::MAX
        );

        let cat = Catalog::from_documents(resources, Some(certs.as_str())).unwrap();
        assert_eq!(cat.certificates()[0].renewal_threshold().as_secs(), u64::MAX);
    }

    #[test]
    fn test_certificate_for_undefined_resource_rejected() {
        let certs = r#"[{"commonName": "a", "resourceId": 5, "certPath": "/a.crt",
            "keyPath": "/a.key", "renewalThresholdHours": 1}]"#;
        let err = Catalog::from_documents("[]", Some(certs)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidCertificate {
                field: "resourceId",
                ..
            }
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        std::fs::write(&path, r#"{"resources": [{"id": 1, "template": "u"}]}"#).unwrap();

        let cat = Catalog::load(&path, None).unwrap();
        assert_eq!(cat.len(), 1);

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            Catalog::load(&missing, None),
            Err(Error::Read { .. })
        ));
    }

    #[test]
    fn test_keyed_lxc_configs_document() {
        let cat = catalog(
            r#"{
                "nvidia_driver_version": "580.76.05",
                "lxc_configs": {
                    "900": {"name": "Copy-Base", "template": "ubuntu-24.04", "features": ["base_setup"]},
                    "901": {"name": "Copy-Cuda", "clone_from_ctid": 900, "features": ["nvidia"]},
                    "950": {"id": 950, "clone_from_ctid": 901}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(cat.len(), 3);
        assert_eq!(cat.get(900).unwrap().name, "Copy-Base");
        assert_eq!(cat.clone_chain(950), vec![901, 900]);
        let features: Vec<_> = cat.effective_features(950).into_iter().collect();
        assert_eq!(features, vec!["base_setup", "nvidia"]);

        let resources = catalog(r#"{"resources": {"7": {"template": "u"}}}"#).unwrap();
        assert!(resources.get(7).is_some());
    }

    #[test]
    fn test_keyed_document_rejects_bad_keys() {
        assert!(matches!(
            catalog(r#"{"lxc_configs": {"base": {"template": "u"}}}"#),
            Err(Error::Document { .. })
        ));
        assert!(matches!(
            catalog(r#"{"lxc_configs": {"900": {"id": 901, "template": "u"}}}"#),
            Err(Error::Document { .. })
        ));
        assert!(matches!(
            catalog(r#"{"lxc_configs": {"900": "ubuntu"}}"#),
            Err(Error::Document { .. })
        ));
        assert!(matches!(
            Catalog::from_documents(
                r#"[{"id": 1, "template": "u"}]"#,
                Some(r#"{"certificates": {"1": {}}}"#)
            ),
            Err(Error::Document { .. })
        ));
    }

    #[test]
    fn test_wrong_document_shape() {
        assert!(matches!(
            catalog(r#"{"containers": []}"#),
            Err(Error::Document { .. })
        ));
        assert!(matches!(catalog("not json"), Err(Error::Document { .. })));
    }
}
