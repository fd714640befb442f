//! Process definitions as the parser emits them: nested maps of primitives
//! and lists, keyed by element id. Executors extract typed configuration at
//! runtime with explicit key lookups; every extraction has a defined failure
//! mode (`VALIDATION_FAILED` with the offending path).

use crate::error::EngineError;
use crate::graph::ReachabilityIndex;
use crate::types::{DefinitionVersion, Variables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// ─── Element types ────────────────────────────────────────────

pub mod element_type {
    pub const START_EVENT: &str = "startEvent";
    pub const END_EVENT: &str = "endEvent";
    pub const SERVICE_TASK: &str = "serviceTask";
    pub const USER_TASK: &str = "userTask";
    pub const SCRIPT_TASK: &str = "scriptTask";
    pub const CALL_ACTIVITY: &str = "callActivity";
    pub const EXCLUSIVE_GATEWAY: &str = "exclusiveGateway";
    pub const PARALLEL_GATEWAY: &str = "parallelGateway";
    pub const INCLUSIVE_GATEWAY: &str = "inclusiveGateway";
    pub const EVENT_BASED_GATEWAY: &str = "eventBasedGateway";
    pub const INTERMEDIATE_CATCH_EVENT: &str = "intermediateCatchEvent";
    pub const INTERMEDIATE_THROW_EVENT: &str = "intermediateThrowEvent";
    pub const BOUNDARY_EVENT: &str = "boundaryEvent";
    pub const SUB_PROCESS: &str = "subProcess";
    pub const SEQUENCE_FLOW: &str = "sequenceFlow";
}

// ─── Raw definition (persisted) ───────────────────────────────

/// Immutable after registration; identified by a stable `process_key` and a
/// content fingerprint so re-registration never disturbs running instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_key: String,
    pub version: DefinitionVersion,
    /// element id → untyped element map.
    pub elements: Variables,
    pub registered_at: DateTime<Utc>,
}

impl ProcessDefinition {
    pub fn new(process_key: &str, elements: Variables) -> Self {
        let version = fingerprint(&elements);
        Self {
            process_key: process_key.to_string(),
            version,
            elements,
            registered_at: Utc::now(),
        }
    }
}

/// SHA-256 over the canonical JSON of the element maps. `serde_json`'s map
/// is key-ordered, so equal content yields equal fingerprints.
fn fingerprint(elements: &Variables) -> DefinitionVersion {
    let mut hasher = Sha256::new();
    hasher.update(
        serde_json::to_vec(&Value::Object(elements.clone())).unwrap_or_default(),
    );
    hasher.finalize().into()
}

/// Expand one registration into the set of definitions it contains:
/// the process itself plus one lifted definition per embedded `subProcess`
/// (keyed `<processKey>#<elementId>`), recursively.
pub fn build_definitions(
    process_key: &str,
    elements: Variables,
) -> Result<Vec<ProcessDefinition>, EngineError> {
    let mut out = Vec::new();
    out.push(ProcessDefinition::new(process_key, elements.clone()));
    for (element_id, element) in &elements {
        let Some(fields) = element.as_object() else {
            continue;
        };
        if fields.get("type").and_then(Value::as_str) != Some(element_type::SUB_PROCESS) {
            continue;
        }
        let nested = fields
            .get("elements")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                EngineError::validation(
                    format!("{element_id}/elements"),
                    "subProcess requires nested elements",
                )
            })?;
        let child_key = format!("{process_key}#{element_id}");
        out.extend(build_definitions(&child_key, nested.clone())?);
    }
    Ok(out)
}

// ─── Element accessors ────────────────────────────────────────

/// Borrowed view over one untyped element map with path-aware extraction.
#[derive(Clone, Copy)]
pub struct ElementRef<'a> {
    pub id: &'a str,
    pub fields: &'a Variables,
}

impl<'a> ElementRef<'a> {
    pub fn element_type(&self) -> Result<&'a str, EngineError> {
        self.require_string("type")
    }

    pub fn name(&self) -> Option<&'a str> {
        self.string_field("name")
    }

    pub fn string_field(&self, key: &str) -> Option<&'a str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn require_string(&self, key: &str) -> Result<&'a str, EngineError> {
        self.string_field(key).ok_or_else(|| {
            EngineError::validation(format!("{}/{key}", self.id), "missing or not a string")
        })
    }

    pub fn bool_field(&self, key: &str, default: bool) -> bool {
        self.fields
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// `incoming` / `outgoing` may be a list of flow ids or a single id —
    /// both shapes occur in parser output.
    fn string_list(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn outgoing(&self) -> Vec<String> {
        self.string_list("outgoing")
    }

    pub fn incoming(&self) -> Vec<String> {
        self.string_list("incoming")
    }

    /// Executor-specific configuration carried on the element.
    pub fn extension(&self) -> Option<&'a Variables> {
        self.fields.get("extension_elements").and_then(Value::as_object)
    }

    pub fn ext_string(&self, key: &str) -> Option<&'a str> {
        self.extension().and_then(|ext| ext.get(key)).and_then(Value::as_str)
    }

    pub fn require_ext_string(&self, key: &str) -> Result<&'a str, EngineError> {
        self.ext_string(key).ok_or_else(|| {
            EngineError::validation(
                format!("{}/extension_elements/{key}", self.id),
                "missing or not a string",
            )
        })
    }

    pub fn ext_value(&self, key: &str) -> Option<&'a Value> {
        self.extension().and_then(|ext| ext.get(key))
    }
}

// ─── Sequence flows ───────────────────────────────────────────

/// A directed edge of the process graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: Option<String>,
    pub is_default: bool,
}

// ─── Compiled definition ──────────────────────────────────────

/// A validated definition plus the indexes the scheduler needs on every
/// step: flows by id, start events, boundary attachments, and the
/// reachability table for inclusive joins.
#[derive(Debug)]
pub struct CompiledDefinition {
    pub definition: ProcessDefinition,
    pub flows: HashMap<String, SequenceFlow>,
    pub start_events: Vec<String>,
    /// activity element id → boundary event element ids attached to it.
    pub boundary_attachments: HashMap<String, Vec<String>>,
    pub reach: ReachabilityIndex,
}

impl CompiledDefinition {
    pub fn compile(definition: ProcessDefinition) -> Result<Self, EngineError> {
        let elements = &definition.elements;

        let mut flows = HashMap::new();
        let mut start_events = Vec::new();
        let mut boundary_attachments: HashMap<String, Vec<String>> = HashMap::new();

        for (element_id, raw) in elements {
            let fields = raw.as_object().ok_or_else(|| {
                EngineError::validation(element_id.clone(), "element is not a map")
            })?;
            let element = ElementRef {
                id: element_id,
                fields,
            };
            let el_type = element.element_type()?;

            match el_type {
                element_type::SEQUENCE_FLOW => {
                    let source = element.require_string("source")?.to_string();
                    let target = element.require_string("target")?.to_string();
                    for endpoint in [&source, &target] {
                        if !elements.contains_key(endpoint) {
                            return Err(EngineError::validation(
                                format!("{element_id}"),
                                format!("flow references unknown element `{endpoint}`"),
                            ));
                        }
                    }
                    flows.insert(
                        element_id.clone(),
                        SequenceFlow {
                            id: element_id.clone(),
                            source,
                            target,
                            condition: element
                                .string_field("condition_expression")
                                .map(str::to_string),
                            is_default: element.bool_field("is_default", false),
                        },
                    );
                }
                element_type::START_EVENT => start_events.push(element_id.clone()),
                element_type::BOUNDARY_EVENT => {
                    let attached = element.require_string("attached_to")?;
                    if !elements.contains_key(attached) {
                        return Err(EngineError::validation(
                            format!("{element_id}/attached_to"),
                            format!("unknown element `{attached}`"),
                        ));
                    }
                    boundary_attachments
                        .entry(attached.to_string())
                        .or_default()
                        .push(element_id.clone());
                }
                _ => {}
            }
        }

        // Every declared outgoing flow must exist.
        for (element_id, raw) in elements {
            let Some(fields) = raw.as_object() else {
                continue;
            };
            let element = ElementRef {
                id: element_id,
                fields,
            };
            if element.element_type()? == element_type::SEQUENCE_FLOW {
                continue;
            }
            for flow_id in element.outgoing() {
                if !flows.contains_key(&flow_id) {
                    return Err(EngineError::validation(
                        format!("{element_id}/outgoing"),
                        format!("unknown sequence flow `{flow_id}`"),
                    ));
                }
            }
        }

        if start_events.is_empty() {
            return Err(EngineError::validation(
                definition.process_key.clone(),
                "definition has no start event",
            ));
        }
        start_events.sort();

        let reach = ReachabilityIndex::build(flows.values());

        Ok(Self {
            definition,
            flows,
            start_events,
            boundary_attachments,
            reach,
        })
    }

    pub fn process_key(&self) -> &str {
        &self.definition.process_key
    }

    pub fn element<'a>(&'a self, element_id: &'a str) -> Result<ElementRef<'a>, EngineError> {
        self.definition
            .elements
            .get(element_id)
            .and_then(Value::as_object)
            .map(|fields| ElementRef {
                id: element_id,
                fields,
            })
            .ok_or_else(|| EngineError::ElementNotFound {
                process_key: self.definition.process_key.clone(),
                element_id: element_id.to_string(),
            })
    }

    pub fn flow(&self, flow_id: &str) -> Result<&SequenceFlow, EngineError> {
        self.flows
            .get(flow_id)
            .ok_or_else(|| EngineError::ElementNotFound {
                process_key: self.definition.process_key.clone(),
                element_id: flow_id.to_string(),
            })
    }

    /// Boundary events attached to the given activity.
    pub fn boundary_events(&self, activity_id: &str) -> &[String] {
        self.boundary_attachments
            .get(activity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The single start event, or the caller-chosen one for multi-start
    /// definitions.
    pub fn resolve_start_event(&self, requested: Option<&str>) -> Result<&str, EngineError> {
        match requested {
            Some(id) => self
                .start_events
                .iter()
                .find(|s| s.as_str() == id)
                .map(String::as_str)
                .ok_or_else(|| EngineError::validation(id, "not a start event of this process")),
            None if self.start_events.len() == 1 => Ok(&self.start_events[0]),
            None => Err(EngineError::validation(
                self.definition.process_key.clone(),
                "multiple start events; caller must choose one",
            )),
        }
    }
}
