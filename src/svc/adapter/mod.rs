//! # Adapter module
//!
//! This module provides the declarative adapter document, the single YAML
//! configuration describing parameter extraction, preconditions, resource
//! materialization and post-actions

use std::{collections::BTreeMap, convert::TryFrom, fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::svc::expr::Condition;

// -----------------------------------------------------------------------------
// Constants

pub const API_VERSION: &str = "adapters.io/v1alpha1";
pub const KIND: &str = "Adapter";

pub const PARAM_SOURCE_ENV: &str = "env.";
pub const PARAM_SOURCE_EVENT: &str = "event.";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read adapter document '{0}', {1}")]
    Read(String, std::io::Error),
    #[error("failed to deserialize adapter document, {0}")]
    Deserialize(serde_yaml::Error),
    #[error("failed to serialize adapter document, {0}")]
    Serialize(serde_yaml::Error),
    #[error("unsupported api version '{0}', expected '{API_VERSION}'")]
    ApiVersion(String),
    #[error("unsupported kind '{0}', expected '{KIND}'")]
    Kind(String),
    #[error("parameter '{0}' is declared more than once")]
    DuplicateParameter(String),
    #[error("parameter '{0}' has an unsupported source '{1}', expected an 'env.' or 'event.' prefix")]
    ParameterSource(String, String),
    #[error("precondition '{0}' must carry either conditions or an expression, not {1}")]
    PreconditionGate(String, &'static str),
    #[error("post action '{0}' must not carry conditions nor an expression")]
    PostActionGate(String),
    #[error("action '{0}' carries no log, api call nor capture step")]
    EmptyAction(String),
    #[error("capture '{0}' of action '{1}' must bind either a field or an expression, not {2}")]
    CaptureShape(String, String, &'static str),
    #[error("resource '{0}' is declared more than once")]
    DuplicateResource(String),
    #[error("resource '{0}' declares no manifest")]
    EmptyResource(String),
    #[error("manifest '{0}' of resource '{1}' is declared more than once")]
    DuplicateManifest(String, String),
    #[error("resource '{0}' uses the fleet transport without a target cluster")]
    FleetCluster(String),
    #[error("payload '{0}' is declared more than once")]
    DuplicatePayload(String),
    #[error("field '{0}' of payload '{1}' must carry either a value or an expression, not {2}")]
    PayloadField(String, String, &'static str),
}

// -----------------------------------------------------------------------------
// Metadata structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Metadata {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// Settings structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Settings {
    /// per-pipeline timeout in seconds, unlimited when unset
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// namespace used by manifests and discovery specs that name none
    #[serde(rename = "defaultNamespace", default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
}

// -----------------------------------------------------------------------------
// Client configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Exponential,
    Linear,
    Constant,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Retry {
    #[serde(rename = "attempts", default = "Retry::default_attempts")]
    pub attempts: u32,
    #[serde(rename = "backoff", default)]
    pub backoff: Backoff,
    /// base delay between attempts, in milliseconds
    #[serde(rename = "baseDelay", default = "Retry::default_base_delay")]
    pub base_delay: u64,
    /// upper bound on the delay between attempts, in milliseconds
    #[serde(rename = "maxDelay", default = "Retry::default_max_delay")]
    pub max_delay: u64,
}

impl Retry {
    const fn default_attempts() -> u32 {
        3
    }

    const fn default_base_delay() -> u64 {
        500
    }

    const fn default_max_delay() -> u64 {
        10_000
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            backoff: Backoff::default(),
            base_delay: Self::default_base_delay(),
            max_delay: Self::default_max_delay(),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ApiClient {
    /// base endpoint prefixed to relative api call urls
    #[serde(rename = "endpoint", default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(rename = "headers", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// default request timeout in seconds
    #[serde(rename = "timeout", default = "ApiClient::default_timeout")]
    pub timeout: u64,
    #[serde(rename = "retry", default)]
    pub retry: Retry,
}

impl ApiClient {
    const fn default_timeout() -> u64 {
        30
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self {
            endpoint: None,
            headers: BTreeMap::new(),
            timeout: Self::default_timeout(),
            retry: Retry::default(),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Kubernetes {
    #[serde(rename = "kubeconfig", default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Clients {
    #[serde(rename = "api", default)]
    pub api: ApiClient,
    #[serde(rename = "kubernetes", default)]
    pub kubernetes: Kubernetes,
}

// -----------------------------------------------------------------------------
// Param structure

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Param {
    #[serde(rename = "name")]
    pub name: String,
    /// `env.<VAR>`, `event.<path>` or unset
    #[serde(rename = "source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "default", default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "required", default)]
    pub required: bool,
}

// -----------------------------------------------------------------------------
// Action structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Log {
    #[serde(rename = "level", default)]
    pub level: LogLevel,
    /// templated message
    #[serde(rename = "message")]
    pub message: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ApiCall {
    #[serde(rename = "method")]
    pub method: String,
    /// templated url, relative urls are prefixed with the client endpoint
    #[serde(rename = "url")]
    pub url: String,
    #[serde(rename = "headers", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// templated body
    #[serde(rename = "body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// request timeout in seconds, falls back to the client default
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// context key the response body is stored under
    #[serde(rename = "storeResponseAs", default, skip_serializing_if = "Option::is_none")]
    pub store_response_as: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Capture {
    #[serde(rename = "name")]
    pub name: String,
    /// dotted path into the api call response body
    #[serde(rename = "field", default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// CEL expression over the context extended with the response
    #[serde(rename = "expression", default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// uniform unit executed by preconditions and post-actions, sub-steps run
/// in fixed order, log then api call then capture
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Action {
    #[serde(rename = "name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "log", default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Log>,
    #[serde(rename = "apiCall", default, skip_serializing_if = "Option::is_none")]
    pub api_call: Option<ApiCall>,
    #[serde(rename = "capture", default, skip_serializing_if = "Vec::is_empty")]
    pub capture: Vec<Capture>,
    #[serde(rename = "conditions", default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(rename = "expression", default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl Action {
    /// returns the display name of the action, its declaration index when
    /// unnamed
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .to_owned()
            .unwrap_or_else(|| index.to_string())
    }
}

// -----------------------------------------------------------------------------
// Resource structures

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Manifest {
    #[serde(rename = "name")]
    pub name: String,
    /// templated yaml document
    #[serde(rename = "template")]
    pub template: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ByName {
    #[serde(rename = "namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// templated object name
    #[serde(rename = "name")]
    pub name: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct BySelectors {
    #[serde(rename = "namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "labels")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Discovery {
    #[serde(rename = "byName", default, skip_serializing_if = "Option::is_none")]
    pub by_name: Option<ByName>,
    #[serde(rename = "bySelectors", default, skip_serializing_if = "Option::is_none")]
    pub by_selectors: Option<BySelectors>,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Kubernetes,
    Fleet,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ManifestWork {
    /// templated envelope name
    #[serde(rename = "name")]
    pub name: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct TransportRef {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    /// target cluster of the fleet transport
    #[serde(rename = "cluster", default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(rename = "manifestWork", default, skip_serializing_if = "Option::is_none")]
    pub manifest_work: Option<ManifestWork>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Resource {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "manifests")]
    pub manifests: Vec<Manifest>,
    #[serde(rename = "discovery", default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<Discovery>,
    #[serde(rename = "recreateOnChange", default)]
    pub recreate_on_change: bool,
    #[serde(rename = "transport", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportRef>,
}

impl Resource {
    pub fn transport_kind(&self) -> TransportKind {
        self.transport
            .as_ref()
            .map(|transport| transport.kind)
            .unwrap_or_default()
    }
}

// -----------------------------------------------------------------------------
// Post structures

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct PayloadField {
    /// dotted path of the field inside the built payload
    #[serde(rename = "path")]
    pub path: String,
    /// templated text value
    #[serde(rename = "value", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// CEL expression producing any json value
    #[serde(rename = "expression", default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// a required value field refuses to render from an absent path
    #[serde(rename = "required", default)]
    pub required: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Payload {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "fields")]
    pub fields: Vec<PayloadField>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Post {
    #[serde(rename = "payloads", default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<Payload>,
    #[serde(rename = "postActions", default, skip_serializing_if = "Vec::is_empty")]
    pub post_actions: Vec<Action>,
}

// -----------------------------------------------------------------------------
// Document structures

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Spec {
    #[serde(rename = "adapter", default)]
    pub adapter: Settings,
    #[serde(rename = "clients", default)]
    pub clients: Clients,
    #[serde(rename = "params", default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(rename = "preconditions", default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<Action>,
    #[serde(rename = "resources", default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    #[serde(rename = "post", default)]
    pub post: Post,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Document {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    #[serde(rename = "metadata")]
    pub metadata: Metadata,
    #[serde(rename = "spec")]
    pub spec: Spec,
}

impl TryFrom<PathBuf> for Document {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        let buf = fs::read_to_string(&path)
            .map_err(|err| Error::Read(path.display().to_string(), err))?;

        Self::try_from(buf.as_str())
    }
}

impl TryFrom<&str> for Document {
    type Error = Error;

    fn try_from(buf: &str) -> Result<Self, Self::Error> {
        let document: Self = serde_yaml::from_str(buf).map_err(Error::Deserialize)?;

        document.validate()?;
        Ok(document)
    }
}

impl Document {
    /// checks the structural rules the deserializer cannot express
    pub fn validate(&self) -> Result<(), Error> {
        if self.api_version != API_VERSION {
            return Err(Error::ApiVersion(self.api_version.to_owned()));
        }

        if self.kind != KIND {
            return Err(Error::Kind(self.kind.to_owned()));
        }

        let mut names = std::collections::BTreeSet::new();
        for param in &self.spec.params {
            if !names.insert(&param.name) {
                return Err(Error::DuplicateParameter(param.name.to_owned()));
            }

            if let Some(source) = &param.source {
                if !source.starts_with(PARAM_SOURCE_ENV) && !source.starts_with(PARAM_SOURCE_EVENT)
                {
                    return Err(Error::ParameterSource(
                        param.name.to_owned(),
                        source.to_owned(),
                    ));
                }
            }
        }

        for (index, action) in self.spec.preconditions.iter().enumerate() {
            let name = action.display_name(index);

            match (action.conditions.is_empty(), &action.expression) {
                (false, Some(_)) => return Err(Error::PreconditionGate(name, "both")),
                (true, None) => return Err(Error::PreconditionGate(name, "none")),
                _ => {}
            }

            validate_action(&name, action)?;
        }

        for (index, action) in self.spec.post.post_actions.iter().enumerate() {
            let name = action.display_name(index);

            if !action.conditions.is_empty() || action.expression.is_some() {
                return Err(Error::PostActionGate(name));
            }

            validate_action(&name, action)?;
        }

        let mut names = std::collections::BTreeSet::new();
        for resource in &self.spec.resources {
            if !names.insert(&resource.name) {
                return Err(Error::DuplicateResource(resource.name.to_owned()));
            }

            if resource.manifests.is_empty() {
                return Err(Error::EmptyResource(resource.name.to_owned()));
            }

            let mut manifests = std::collections::BTreeSet::new();
            for manifest in &resource.manifests {
                if !manifests.insert(&manifest.name) {
                    return Err(Error::DuplicateManifest(
                        manifest.name.to_owned(),
                        resource.name.to_owned(),
                    ));
                }
            }

            if let Some(transport) = &resource.transport {
                if TransportKind::Fleet == transport.kind && transport.cluster.is_none() {
                    return Err(Error::FleetCluster(resource.name.to_owned()));
                }
            }
        }

        let mut names = std::collections::BTreeSet::new();
        for payload in &self.spec.post.payloads {
            if !names.insert(&payload.name) {
                return Err(Error::DuplicatePayload(payload.name.to_owned()));
            }

            for field in &payload.fields {
                match (&field.value, &field.expression) {
                    (Some(_), Some(_)) => {
                        return Err(Error::PayloadField(
                            field.path.to_owned(),
                            payload.name.to_owned(),
                            "both",
                        ))
                    }
                    (None, None) => {
                        return Err(Error::PayloadField(
                            field.path.to_owned(),
                            payload.name.to_owned(),
                            "none",
                        ))
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(Error::Serialize)
    }
}

/// rules shared by preconditions and post-actions
fn validate_action(name: &str, action: &Action) -> Result<(), Error> {
    if action.log.is_none()
        && action.api_call.is_none()
        && action.capture.is_empty()
        && action.conditions.is_empty()
        && action.expression.is_none()
    {
        return Err(Error::EmptyAction(name.to_owned()));
    }

    for capture in &action.capture {
        match (&capture.field, &capture.expression) {
            (Some(_), Some(_)) => {
                return Err(Error::CaptureShape(
                    capture.name.to_owned(),
                    name.to_owned(),
                    "both",
                ))
            }
            (None, None) => {
                return Err(Error::CaptureShape(
                    capture.name.to_owned(),
                    name.to_owned(),
                    "none",
                ))
            }
            _ => {}
        }
    }

    Ok(())
}
