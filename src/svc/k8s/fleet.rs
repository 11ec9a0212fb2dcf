//! # Fleet module
//!
//! This module provides the work envelope transport, all manifests of a
//! resource are wrapped into a single ManifestWork addressed to a named
//! target cluster which owns their inner reconciliation

use kube::{
    api::PostParams,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Api,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::svc::k8s::Error;

// -----------------------------------------------------------------------------
// Constants

pub const GROUP: &str = "work.open-cluster-management.io";
pub const VERSION: &str = "v1";
pub const KIND: &str = "ManifestWork";

// -----------------------------------------------------------------------------
// Helper functions

fn api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, KIND))
}

/// builds the work envelope wrapping the manifests, namespaced by the
/// target cluster
pub fn envelope(target: &str, name: &str, manifests: &[DynamicObject]) -> Result<DynamicObject, Error> {
    let workload = manifests
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Manifest)?;

    let mut obj = DynamicObject::new(name, &api_resource());
    obj.metadata.namespace = Some(target.to_owned());
    obj.data = serde_json::json!({
        "spec": {
            "workload": {
                "manifests": workload,
            },
        },
    });

    Ok(obj)
}

/// creates or replaces the work envelope on the hub, the envelope is
/// reconciled as a whole so a replace carries the complete workload
pub async fn apply(
    client: &kube::Client,
    target: &str,
    name: &str,
    manifests: &[DynamicObject],
    token: &CancellationToken,
) -> Result<DynamicObject, Error> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.to_owned(), target, &api_resource());

    let mut work = envelope(target, name, manifests)?;

    let existing = tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled(format!("get manifestwork {target}/{name}"))),
        result = api.get_opt(name) => result.map_err(Error::Kube)?,
    };

    match existing {
        None => {
            info!(
                cluster = target,
                name = name,
                manifests = manifests.len(),
                "Create work envelope on hub",
            );

            let params = PostParams::default();
            tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled(format!("create manifestwork {target}/{name}"))),
                result = api.create(&params, &work) => result.map_err(Error::Kube),
            }
        }
        Some(live) => {
            debug!(
                cluster = target,
                name = name,
                "Work envelope already exists, replacing its workload",
            );

            work.metadata.resource_version = live.metadata.resource_version.to_owned();

            let params = PostParams::default();
            tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled(format!("replace manifestwork {target}/{name}"))),
                result = api.replace(name, &params, &work) => result.map_err(Error::Kube),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::envelope;
    use crate::svc::k8s::parse_manifest;

    #[test]
    fn envelope_wraps_all_manifests_for_the_target() {
        let manifests = vec![
            parse_manifest(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "workloads"},
            }))
            .unwrap(),
            parse_manifest(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "settings", "namespace": "workloads"},
            }))
            .unwrap(),
        ];

        let work = envelope("cluster-c1", "bootstrap-c1", &manifests).unwrap();

        assert_eq!(work.metadata.name.as_deref(), Some("bootstrap-c1"));
        assert_eq!(work.metadata.namespace.as_deref(), Some("cluster-c1"));

        let workload = work
            .data
            .pointer("/spec/workload/manifests")
            .and_then(|value| value.as_array())
            .unwrap();

        assert_eq!(workload.len(), 2);
        assert_eq!(workload[0].pointer("/kind"), Some(&json!("Namespace")));
    }
}
