//! The handler registry: a process-wide, write-once
//! `HashMap<String, HandlerDescriptor>` populated before the Client I/O
//! Server starts accepting connections, giving every handler one
//! registration path instead of several parallel ones.
//!
//! The handlers themselves are opaque: they are modelled as opaque child
//! executables invoked by name, with their internal logic out of scope
//! here. `echo` and `graph-stat` below are illustrative registrations
//! exercising the registry's shape — deliberately not named after any real
//! graph algorithm, so as not to claim this crate implements
//! spanner/shortest-path computations it does not.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A required field's scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int,
    Float,
    String,
    Bool,
    Graph,
    Node,
    NodeSet,
}

/// A result field's scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnType {
    Graph,
    NodeSet,
    Value,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub key: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultFieldDescriptor {
    pub key: String,
    pub label: String,
    pub return_type: ReturnType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub name: String,
    pub required_fields: Vec<FieldDescriptor>,
    pub result_fields: Vec<ResultFieldDescriptor>,
}

fn field(key: &str, label: &str, field_type: FieldType, required: bool) -> FieldDescriptor {
    FieldDescriptor {
        key: key.to_owned(),
        label: label.to_owned(),
        field_type,
        required,
    }
}

fn result_field(key: &str, label: &str, return_type: ReturnType) -> ResultFieldDescriptor {
    ResultFieldDescriptor {
        key: key.to_owned(),
        label: label.to_owned(),
        return_type,
    }
}

pub static REGISTRY: Lazy<HashMap<String, HandlerDescriptor>> = Lazy::new(|| {
    let mut map = HashMap::new();

    map.insert(
        "echo".to_owned(),
        HandlerDescriptor {
            name: "echo".to_owned(),
            required_fields: vec![field("graph", "Input graph", FieldType::Graph, true)],
            result_fields: vec![result_field("graph", "Unmodified graph", ReturnType::Graph)],
        },
    );

    map.insert(
        "graph-stat".to_owned(),
        HandlerDescriptor {
            name: "graph-stat".to_owned(),
            required_fields: vec![
                field("graph", "Input graph", FieldType::Graph, true),
                field(
                    "node",
                    "Node to report neighborhood size for",
                    FieldType::Node,
                    false,
                ),
            ],
            result_fields: vec![
                result_field("node_count", "Node count", ReturnType::Value),
                result_field("edge_count", "Edge count", ReturnType::Value),
            ],
        },
    );

    map
});

/// Looks up a registered handler by name.
pub fn lookup(name: &str) -> Option<&'static HandlerDescriptor> {
    REGISTRY.get(name)
}

/// All registered handler descriptors, for `AVAILABLE_HANDLERS`.
pub fn all() -> Vec<HandlerDescriptor> {
    let mut handlers: Vec<HandlerDescriptor> = REGISTRY.values().cloned().collect();
    handlers.sort_by(|a, b| a.name.cmp(&b.name));
    handlers
}

/// Invokes the named handler against an opaque request blob, returning an
/// opaque response blob. Called only by the worker process, which resolves
/// the handler by `meta.handler_type` and dispatches; the blob's internal
/// structure (graphs, attributes, results) is out of scope, so these bodies
/// are illustrative plumbing, not graph algorithms.
/// Returns `None` if `handler_type` is not registered.
pub fn invoke(handler_type: &str, request: &[u8]) -> Option<Vec<u8>> {
    match handler_type {
        "echo" => Some(request.to_vec()),
        "graph-stat" => Some(request.len().to_le_bytes().to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod invoke_tests {
    use super::*;

    #[test]
    fn echo_returns_the_request_unchanged() {
        assert_eq!(invoke("echo", b"payload"), Some(b"payload".to_vec()));
    }

    #[test]
    fn unknown_handler_returns_none() {
        assert_eq!(invoke("does-not-exist", b"x"), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_illustrative_handlers() {
        assert!(lookup("echo").is_some());
        assert!(lookup("graph-stat").is_some());
        assert!(lookup("does-not-exist").is_none());
    }

    #[test]
    fn all_is_sorted_by_name() {
        let names: Vec<String> = all().into_iter().map(|h| h.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
