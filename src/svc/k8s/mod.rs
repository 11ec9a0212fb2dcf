//! # Kubernetes module
//!
//! This module provides the transport abstraction resources are applied
//! through, its direct kubernetes implementation and the fleet work
//! envelope implementation

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod fleet;
pub mod kubernetes;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to discover api resource for kind '{0}', {1}")]
    Discover(String, kube::Error),
    #[error("failed to parse manifest, {0}")]
    Manifest(serde_json::Error),
    #[error("manifest carries no api version and kind")]
    MissingTypes,
    #[error("failed to parse api version '{0}', {1}")]
    GroupVersion(String, kube::core::gvk::ParseGroupVersionError),
    #[error("manifest of kind '{0}' carries no name")]
    MissingName(String),
    #[error("operation '{0}' was cancelled")]
    Cancelled(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err)
    }
}

// -----------------------------------------------------------------------------
// Transport trait

/// capability resources are reconciled through. The direct implementation
/// talks to the kubernetes api server, the fleet implementation ships work
/// envelopes to a target cluster. Implementations must be safe to share
/// across concurrent pipelines.
#[async_trait]
pub trait Transport: Send + Sync {
    /// direct lookup, a missing object resolves to `None`
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<DynamicObject>, Error>;

    /// label selector lookup
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
        token: &CancellationToken,
    ) -> Result<Vec<DynamicObject>, Error>;

    async fn create(
        &self,
        obj: &DynamicObject,
        token: &CancellationToken,
    ) -> Result<DynamicObject, Error>;

    /// replaces the object, the caller is responsible for carrying over the
    /// server-owned metadata of the live object
    async fn update(
        &self,
        obj: &DynamicObject,
        token: &CancellationToken,
    ) -> Result<DynamicObject, Error>;

    /// removes the object, a missing object is not an error
    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<(), Error>;

    /// wraps the manifests into a single work envelope addressed to the
    /// target cluster
    async fn apply_bundle(
        &self,
        target: &str,
        name: &str,
        manifests: &[DynamicObject],
        token: &CancellationToken,
    ) -> Result<DynamicObject, Error>;
}

// -----------------------------------------------------------------------------
// Helper functions

/// parses a rendered manifest into a dynamic object, requiring type
/// information and a name
pub fn parse_manifest(value: Value) -> Result<DynamicObject, Error> {
    let obj: DynamicObject = serde_json::from_value(value).map_err(Error::Manifest)?;

    let types = obj.types.as_ref().ok_or(Error::MissingTypes)?;
    if types.api_version.is_empty() || types.kind.is_empty() {
        return Err(Error::MissingTypes);
    }

    if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::MissingName(types.kind.to_owned()));
    }

    Ok(obj)
}

/// returns the group version kind carried by the object's type information
pub fn gvk(obj: &DynamicObject) -> Result<GroupVersionKind, Error> {
    use std::str::FromStr;

    let types = obj.types.as_ref().ok_or(Error::MissingTypes)?;

    let group_version = kube::core::GroupVersion::from_str(&types.api_version)
        .map_err(|err| Error::GroupVersion(types.api_version.to_owned(), err))?;

    Ok(group_version.with_kind(&types.kind))
}

/// returns the object as a json tree for the evaluation context
pub fn to_value(obj: &DynamicObject) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(Error::Manifest)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{gvk, parse_manifest, Error};

    #[test]
    fn parse_manifest_requires_types_and_name() {
        let obj = parse_manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cluster-c1", "namespace": "fleet-system"},
            "data": {"region": "us-east-1"},
        }))
        .unwrap();

        assert_eq!(obj.metadata.name.as_deref(), Some("cluster-c1"));

        assert!(matches!(
            parse_manifest(json!({"metadata": {"name": "x"}})).unwrap_err(),
            Error::MissingTypes
        ));

        assert!(matches!(
            parse_manifest(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}}))
                .unwrap_err(),
            Error::MissingName(kind) if kind == "ConfigMap"
        ));
    }

    #[test]
    fn gvk_splits_the_api_version() {
        let obj = parse_manifest(json!({
            "apiVersion": "work.open-cluster-management.io/v1",
            "kind": "ManifestWork",
            "metadata": {"name": "bootstrap"},
        }))
        .unwrap();

        let gvk = gvk(&obj).unwrap();

        assert_eq!(gvk.group, "work.open-cluster-management.io");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ManifestWork");
    }
}
