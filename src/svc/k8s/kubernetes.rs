//! # Kubernetes transport module
//!
//! This module provides the production transport, direct operations against
//! the kubernetes api server and fleet work envelopes through the same
//! client

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Api,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::svc::k8s::{fleet, Error, Transport};

// -----------------------------------------------------------------------------
// KubernetesTransport structure

#[derive(Clone)]
pub struct KubernetesTransport {
    client: kube::Client,
}

impl From<kube::Client> for KubernetesTransport {
    fn from(client: kube::Client) -> Self {
        Self { client }
    }
}

impl KubernetesTransport {
    pub fn new(client: kube::Client) -> Self {
        Self::from(client)
    }

    /// resolves the group version kind against the api server and returns
    /// an api bound to the right scope
    async fn api(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, Error> {
        let (resource, capabilities) = discovery::oneshot::pinned_kind(&self.client, gvk)
            .await
            .map_err(|err| Error::Discover(gvk.kind.to_owned(), err))?;

        Ok(match capabilities.scope {
            Scope::Cluster => Api::all_with(self.client.to_owned(), &resource),
            Scope::Namespaced => {
                Api::namespaced_with(self.client.to_owned(), namespace, &resource)
            }
        })
    }
}

#[async_trait]
impl Transport for KubernetesTransport {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.api(gvk, namespace).await?;

        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled(format!("get {}/{}", namespace, name))),
            result = api.get(name) => result,
        };

        match result {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(Error::Kube(err)),
        }
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        selector: &str,
        token: &CancellationToken,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.api(gvk, namespace).await?;
        let params = ListParams::default().labels(selector);

        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled(format!("list {}", gvk.kind))),
            result = api.list(&params) => result,
        };

        Ok(result.map_err(Error::Kube)?.items)
    }

    async fn create(
        &self,
        obj: &DynamicObject,
        token: &CancellationToken,
    ) -> Result<DynamicObject, Error> {
        let gvk = super::gvk(obj)?;
        let namespace = obj.metadata.namespace.to_owned().unwrap_or_default();
        let api = self.api(&gvk, &namespace).await?;

        debug!(
            kind = &gvk.kind,
            namespace = &namespace,
            name = obj.metadata.name.as_deref().unwrap_or_default(),
            "Create resource",
        );

        let params = PostParams::default();
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(format!("create {}", gvk.kind))),
            result = api.create(&params, obj) => result.map_err(Error::Kube),
        }
    }

    async fn update(
        &self,
        obj: &DynamicObject,
        token: &CancellationToken,
    ) -> Result<DynamicObject, Error> {
        let gvk = super::gvk(obj)?;
        let namespace = obj.metadata.namespace.to_owned().unwrap_or_default();
        let name = obj
            .metadata
            .name
            .to_owned()
            .ok_or_else(|| Error::MissingName(gvk.kind.to_owned()))?;

        let api = self.api(&gvk, &namespace).await?;

        debug!(
            kind = &gvk.kind,
            namespace = &namespace,
            name = &name,
            "Update resource",
        );

        let params = PostParams::default();
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(format!("update {}/{}", namespace, name))),
            result = api.replace(&name, &params, obj) => result.map_err(Error::Kube),
        }
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<(), Error> {
        let api = self.api(gvk, namespace).await?;

        debug!(
            kind = &gvk.kind,
            namespace = namespace,
            name = name,
            "Delete resource",
        );

        let params = DeleteParams::default();
        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled(format!("delete {}/{}", namespace, name))),
            result = api.delete(name, &params) => result,
        };

        match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(Error::Kube(err)),
        }
    }

    async fn apply_bundle(
        &self,
        target: &str,
        name: &str,
        manifests: &[DynamicObject],
        token: &CancellationToken,
    ) -> Result<DynamicObject, Error> {
        fleet::apply(&self.client, target, name, manifests, token).await
    }
}
