//! # Resource module
//!
//! This module renders manifests, discovers existing objects and applies
//! the create, update or recreate operation through the configured
//! transport

use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::svc::{
    adapter::{Discovery, Resource, TransportKind},
    context::EvaluationContext,
    k8s::{self, Transport},
    pipeline::result::Operation,
    template::{self, Mode},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to render manifest '{0}', {1}")]
    Template(String, template::Error),
    #[error("failed to parse manifest '{0}' as yaml, {1}")]
    Yaml(String, serde_yaml::Error),
    #[error("failed to parse manifest '{0}', {1}")]
    Manifest(String, k8s::Error),
    #[error("failed to apply manifest '{0}', {1}")]
    Apply(String, k8s::Error),
    #[error("failed to merge manifest '{0}' into the live object, {1}")]
    Merge(String, serde_json::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Apply(_, k8s::Error::Cancelled(_)) | Self::Manifest(_, k8s::Error::Cancelled(_))
        )
    }
}

// -----------------------------------------------------------------------------
// Applied structure

#[derive(Clone, Debug)]
pub struct Applied {
    pub manifest: String,
    pub operation: Operation,
}

// -----------------------------------------------------------------------------
// Reconciler structure

pub struct Reconciler {
    transport: Arc<dyn Transport>,
    default_namespace: Option<String>,
}

impl Reconciler {
    pub fn new(transport: Arc<dyn Transport>, default_namespace: Option<String>) -> Self {
        Self {
            transport,
            default_namespace,
        }
    }

    /// renders and applies every manifest of the resource in declaration
    /// order, registering each materialized object in the context
    pub async fn apply(
        &self,
        resource: &Resource,
        ctx: &mut EvaluationContext,
        token: &CancellationToken,
    ) -> Result<Vec<Applied>, Error> {
        let mut rendered = Vec::with_capacity(resource.manifests.len());

        for manifest in &resource.manifests {
            let buf = template::render(&manifest.template, ctx, Mode::Lenient)
                .map_err(|err| Error::Template(manifest.name.to_owned(), err))?;

            let value: Value = serde_yaml::from_str(&buf)
                .map_err(|err| Error::Yaml(manifest.name.to_owned(), err))?;

            let mut obj = k8s::parse_manifest(value)
                .map_err(|err| Error::Manifest(manifest.name.to_owned(), err))?;

            if obj.metadata.namespace.is_none() {
                obj.metadata.namespace = self.default_namespace.to_owned();
            }

            rendered.push((manifest.name.to_owned(), obj));
        }

        if TransportKind::Fleet == resource.transport_kind() {
            return self.apply_bundle(resource, rendered, ctx, token).await;
        }

        let mut applied = Vec::with_capacity(rendered.len());

        for (index, (name, obj)) in rendered.iter().enumerate() {
            let (operation, materialized) =
                self.reconcile_manifest(resource, name, obj, ctx, token).await?;

            info!(
                resource = &resource.name,
                manifest = name,
                operation = operation.to_string(),
                "Reconciled manifest",
            );

            ctx.insert_resource(
                &resource.name,
                name,
                index == 0,
                k8s::to_value(&materialized)
                    .map_err(|err| Error::Manifest(name.to_owned(), err))?,
            );

            applied.push(Applied {
                manifest: name.to_owned(),
                operation,
            });
        }

        Ok(applied)
    }

    /// decides and executes the operation for one manifest
    async fn reconcile_manifest(
        &self,
        resource: &Resource,
        manifest: &str,
        obj: &DynamicObject,
        ctx: &EvaluationContext,
        token: &CancellationToken,
    ) -> Result<(Operation, DynamicObject), Error> {
        let existing = self.discover(resource, manifest, obj, ctx, token).await?;

        match existing {
            None => {
                let materialized = self
                    .transport
                    .create(obj, token)
                    .await
                    .map_err(|err| Error::Apply(manifest.to_owned(), err))?;

                Ok((Operation::Create, materialized))
            }
            Some(live) if !resource.recreate_on_change => {
                let merged = merge(&live, obj, manifest)?;

                let materialized = self
                    .transport
                    .update(&merged, token)
                    .await
                    .map_err(|err| Error::Apply(manifest.to_owned(), err))?;

                Ok((Operation::Update, materialized))
            }
            Some(live) => {
                let gvk =
                    k8s::gvk(&live).map_err(|err| Error::Manifest(manifest.to_owned(), err))?;
                let namespace = live.metadata.namespace.to_owned().unwrap_or_default();
                let name = live.metadata.name.to_owned().unwrap_or_default();

                self.transport
                    .delete(&gvk, &namespace, &name, token)
                    .await
                    .map_err(|err| Error::Apply(manifest.to_owned(), err))?;

                // the recreated object gets a fresh identity
                let materialized = self
                    .transport
                    .create(obj, token)
                    .await
                    .map_err(|err| Error::Apply(manifest.to_owned(), err))?;

                Ok((Operation::Recreate, materialized))
            }
        }
    }

    /// locates the existing object driving the operation decision, a
    /// resource without discovery always creates
    async fn discover(
        &self,
        resource: &Resource,
        manifest: &str,
        obj: &DynamicObject,
        ctx: &EvaluationContext,
        token: &CancellationToken,
    ) -> Result<Option<DynamicObject>, Error> {
        let discovery = match &resource.discovery {
            None => return Ok(None),
            Some(discovery) => discovery,
        };

        let gvk = k8s::gvk(obj).map_err(|err| Error::Manifest(manifest.to_owned(), err))?;
        let namespace = self.discovery_namespace(discovery, obj, ctx, manifest)?;

        if let Some(by_name) = &discovery.by_name {
            let name = template::render(&by_name.name, ctx, Mode::Lenient)
                .map_err(|err| Error::Template(manifest.to_owned(), err))?;

            debug!(
                resource = &resource.name,
                namespace = &namespace,
                name = &name,
                "Discover existing object by name",
            );

            return self
                .transport
                .get(&gvk, &namespace, &name, token)
                .await
                .map_err(|err| Error::Apply(manifest.to_owned(), err));
        }

        if let Some(by_selectors) = &discovery.by_selectors {
            let mut labels = Vec::with_capacity(by_selectors.labels.len());
            for (key, value) in &by_selectors.labels {
                labels.push(format!(
                    "{}={}",
                    key,
                    template::render(value, ctx, Mode::Lenient)
                        .map_err(|err| Error::Template(manifest.to_owned(), err))?
                ));
            }
            let selector = labels.join(",");

            debug!(
                resource = &resource.name,
                namespace = &namespace,
                selector = &selector,
                "Discover existing objects by selectors",
            );

            let mut items = self
                .transport
                .list(&gvk, &namespace, &selector, token)
                .await
                .map_err(|err| Error::Apply(manifest.to_owned(), err))?;

            // the api gives no ordering guarantee, sort by name so the
            // first match is deterministic across runs
            items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

            return Ok(items.into_iter().next());
        }

        Ok(None)
    }

    fn discovery_namespace(
        &self,
        discovery: &Discovery,
        obj: &DynamicObject,
        ctx: &EvaluationContext,
        manifest: &str,
    ) -> Result<String, Error> {
        let configured = discovery
            .by_name
            .as_ref()
            .and_then(|by_name| by_name.namespace.as_deref())
            .or_else(|| {
                discovery
                    .by_selectors
                    .as_ref()
                    .and_then(|by_selectors| by_selectors.namespace.as_deref())
            });

        match configured {
            Some(namespace) => template::render(namespace, ctx, Mode::Lenient)
                .map_err(|err| Error::Template(manifest.to_owned(), err)),
            None => Ok(obj.metadata.namespace.to_owned().unwrap_or_default()),
        }
    }

    /// ships all manifests of the resource as a single work envelope, the
    /// target cluster owns their inner reconciliation so discovery is
    /// bypassed
    async fn apply_bundle(
        &self,
        resource: &Resource,
        rendered: Vec<(String, DynamicObject)>,
        ctx: &mut EvaluationContext,
        token: &CancellationToken,
    ) -> Result<Vec<Applied>, Error> {
        let transport_ref = resource
            .transport
            .as_ref()
            .expect("fleet resources to carry a transport, the document validation enforces it");

        let cluster = template::render(
            transport_ref.cluster.as_deref().unwrap_or_default(),
            ctx,
            Mode::Lenient,
        )
        .map_err(|err| Error::Template(resource.name.to_owned(), err))?;

        let work_name = match &transport_ref.manifest_work {
            Some(work) => template::render(&work.name, ctx, Mode::Lenient)
                .map_err(|err| Error::Template(resource.name.to_owned(), err))?,
            None => format!("{}-{}", resource.name, rendered[0].0),
        };

        let manifests = rendered
            .iter()
            .map(|(_, obj)| obj.to_owned())
            .collect::<Vec<_>>();

        self.transport
            .apply_bundle(&cluster, &work_name, &manifests, token)
            .await
            .map_err(|err| Error::Apply(resource.name.to_owned(), err))?;

        info!(
            resource = &resource.name,
            cluster = &cluster,
            work = &work_name,
            manifests = manifests.len(),
            "Shipped work envelope",
        );

        let mut applied = Vec::with_capacity(rendered.len());

        for (index, (name, obj)) in rendered.iter().enumerate() {
            ctx.insert_resource(
                &resource.name,
                name,
                index == 0,
                k8s::to_value(obj).map_err(|err| Error::Manifest(name.to_owned(), err))?,
            );

            applied.push(Applied {
                manifest: name.to_owned(),
                operation: Operation::Bundle,
            });
        }

        Ok(applied)
    }
}

// -----------------------------------------------------------------------------
// Merge helper

/// merges the rendered manifest into the live object as an rfc 7386 merge
/// patch, the server-owned metadata of the live object survives because the
/// rendered manifest does not carry it
fn merge(
    live: &DynamicObject,
    rendered: &DynamicObject,
    manifest: &str,
) -> Result<DynamicObject, Error> {
    let mut doc =
        serde_json::to_value(live).map_err(|err| Error::Merge(manifest.to_owned(), err))?;
    let patch =
        serde_json::to_value(rendered).map_err(|err| Error::Merge(manifest.to_owned(), err))?;

    json_patch::merge(&mut doc, &patch);

    serde_json::from_value(doc).map_err(|err| Error::Merge(manifest.to_owned(), err))
}
