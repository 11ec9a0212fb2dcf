//! # Event module
//!
//! This module provides the CloudEvents v1.0 record handed to the pipeline
//! by the broker subscription

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// -----------------------------------------------------------------------------
// Constants

pub const SPEC_VERSION: &str = "1.0";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to validate event, attribute '{0}' is required and must not be empty")]
    MissingAttribute(&'static str),
    #[error("failed to validate event '{0}', the body must be a json object")]
    Body(String),
}

// -----------------------------------------------------------------------------
// Event structure

/// immutable cluster lifecycle event. The body is an unstructured json
/// object addressed through `event.<path>` parameter sources.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Event {
    #[serde(rename = "specversion", default = "spec_version")]
    pub spec_version: String,
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "source")]
    pub source: String,
    #[serde(rename = "time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "datacontenttype", default, skip_serializing_if = "Option::is_none")]
    pub data_content_type: Option<String>,
    #[serde(rename = "data", default)]
    pub data: Value,
}

fn spec_version() -> String {
    SPEC_VERSION.to_owned()
}

impl Event {
    /// checks the conventions required at ingress, identifier, type, source
    /// and a json object body
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::MissingAttribute("id"));
        }

        if self.kind.is_empty() {
            return Err(Error::MissingAttribute("type"));
        }

        if self.source.is_empty() {
            return Err(Error::MissingAttribute("source"));
        }

        match &self.data {
            Value::Object(_) | Value::Null => Ok(()),
            _ => Err(Error::Body(self.id.to_owned())),
        }
    }

    /// returns the event body as a json object, an absent body reads as an
    /// empty one
    pub fn body(&self) -> Option<&Map<String, Value>> {
        self.data.as_object()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Error, Event};

    fn event(data: serde_json::Value) -> Event {
        Event {
            spec_version: super::SPEC_VERSION.to_owned(),
            id: "evt-1".to_owned(),
            kind: "io.cluster.provisioned".to_owned(),
            source: "/clusters/c1".to_owned(),
            time: None,
            data_content_type: Some("application/json".to_owned()),
            data,
        }
    }

    #[test]
    fn deserialize_maps_cloud_events_attributes() {
        let event: Event = serde_json::from_value(json!({
            "specversion": "1.0",
            "id": "evt-1",
            "type": "io.cluster.provisioned",
            "source": "/clusters/c1",
            "time": "2026-01-01T00:00:00Z",
            "data": {"cluster_id": "c1"},
        }))
        .unwrap();

        assert_eq!(event.kind, "io.cluster.provisioned");
        assert_eq!(event.data, json!({"cluster_id": "c1"}));
    }

    #[test]
    fn validate_requires_the_ingress_conventions() {
        assert!(event(json!({"cluster_id": "c1"})).validate().is_ok());
        assert!(event(serde_json::Value::Null).validate().is_ok());

        let mut broken = event(json!({}));
        broken.id = String::new();
        assert!(matches!(
            broken.validate().unwrap_err(),
            Error::MissingAttribute("id")
        ));

        assert!(matches!(
            event(json!("not an object")).validate().unwrap_err(),
            Error::Body(_)
        ));
    }
}
