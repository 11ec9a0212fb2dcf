//! # Result module
//!
//! This module provides the structured record of an event execution, phase
//! outcomes, recorded errors and the final evaluation context

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use serde::Serialize;
use serde_json::{Map, Value};

// -----------------------------------------------------------------------------
// Error reason constants, mirrored into 'adapter.errorReason'

pub const REASON_MISSING_PARAMETER: &str = "MissingParameter";
pub const REASON_MALFORMED_EVENT: &str = "MalformedEvent";
pub const REASON_CONDITION_EVAL: &str = "ConditionEvalError";
pub const REASON_HTTP: &str = "HTTP";
pub const REASON_RESOURCE_APPLY: &str = "ResourceApply";
pub const REASON_PAYLOAD_BUILD: &str = "PayloadBuild";
pub const REASON_CANCELLED: &str = "Cancelled";

// -----------------------------------------------------------------------------
// Status enumeration

#[derive(Serialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// -----------------------------------------------------------------------------
// Phase enumeration

#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ParamExtract,
    Preconditions,
    Resources,
    PostActions,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ParamExtract => write!(f, "param_extract"),
            Self::Preconditions => write!(f, "preconditions"),
            Self::Resources => write!(f, "resources"),
            Self::PostActions => write!(f, "post_actions"),
        }
    }
}

// -----------------------------------------------------------------------------
// Outcome enumeration

#[derive(Serialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    NotMatched,
    Failed,
}

// -----------------------------------------------------------------------------
// Operation enumeration

/// reconciliation operation decided by discovery
#[derive(Serialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Recreate,
    Bundle,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Recreate => write!(f, "recreate"),
            Self::Bundle => write!(f, "bundle"),
        }
    }
}

// -----------------------------------------------------------------------------
// StepResult structure

#[derive(Serialize, Clone, Debug)]
pub struct StepResult {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "outcome")]
    pub outcome: Outcome,
    #[serde(rename = "operation", skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn succeeded(name: String) -> Self {
        Self {
            name,
            outcome: Outcome::Succeeded,
            operation: None,
            error: None,
        }
    }

    pub fn not_matched(name: String) -> Self {
        Self {
            name,
            outcome: Outcome::NotMatched,
            operation: None,
            error: None,
        }
    }

    pub fn failed(name: String, error: String) -> Self {
        Self {
            name,
            outcome: Outcome::Failed,
            operation: None,
            error: Some(error),
        }
    }
}

// -----------------------------------------------------------------------------
// Execution structure

/// record of a single event's trip through the pipeline
#[derive(Serialize, Clone, Debug)]
pub struct Execution {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "status")]
    pub status: Status,
    #[serde(rename = "terminalPhase")]
    pub terminal_phase: Phase,
    #[serde(rename = "params")]
    pub params: Map<String, Value>,
    #[serde(rename = "preconditionResults")]
    pub preconditions: Vec<StepResult>,
    #[serde(rename = "resourceResults")]
    pub resources: Vec<StepResult>,
    #[serde(rename = "postActionResults")]
    pub post_actions: Vec<StepResult>,
    /// first error recorded per phase
    #[serde(rename = "errors")]
    pub errors: BTreeMap<Phase, String>,
    #[serde(rename = "resourcesSkipped")]
    pub resources_skipped: bool,
    /// final evaluation context of the event
    #[serde(rename = "context")]
    pub context: Value,
}

impl Execution {
    pub fn new(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_owned(),
            status: Status::Success,
            terminal_phase: Phase::ParamExtract,
            params: Map::new(),
            preconditions: vec![],
            resources: vec![],
            post_actions: vec![],
            errors: BTreeMap::new(),
            resources_skipped: false,
            context: Value::Null,
        }
    }

    /// records the first error of the phase, later ones for the same phase
    /// are kept out of the map but the status still degrades
    pub fn record_error(&mut self, phase: Phase, message: String) {
        self.errors.entry(phase).or_insert(message);
        self.status = Status::Failed;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
