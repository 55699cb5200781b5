//! Graph model: the element collection the synchers observe and mutate.
//!
//! Stands in for the rendering engine's graph. Every mutation publishes a
//! `GraphEvent` tagged with its `Origin`; synchers propagate only `Local`
//! events, and apply remote changes with `Origin::Remote`, so a remote update
//! can never be mistaken for a local edit.

use crate::document::{Document, Fields};
use crate::events::{EventBus, Subscription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Classes the edge-drawing interaction puts on its temporary elements.
pub const EPHEMERAL_CLASSES: &[&str] = &[
    "eh-preview",
    "eh-ghost",
    "eh-ghost-edge",
    "eh-ghost-node",
    "eh-handle",
];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("Element already exists: {0}")]
    DuplicateElement(String),

    #[error("Unknown element: {0}")]
    UnknownElement(String),

    #[error("Edge {edge} references missing node {node}")]
    DanglingEdge { edge: String, node: String },
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A user or application edit on this client
    Local,
    /// Applied from the store's change feed
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: String,
    pub data: Fields,
    pub position: Option<Position>,
    pub classes: Vec<String>,
}

impl Element {
    pub fn node(id: impl Into<String>, data: Fields, position: Position) -> Self {
        let id = id.into();
        let mut data = data;
        data.insert("id".into(), Value::String(id.clone()));
        Self {
            id,
            data,
            position: Some(position),
            classes: Vec::new(),
        }
    }

    pub fn edge(id: impl Into<String>, source: &str, target: &str, data: Fields) -> Self {
        let id = id.into();
        let mut data = data;
        data.insert("id".into(), Value::String(id.clone()));
        data.insert("source".into(), Value::String(source.into()));
        data.insert("target".into(), Value::String(target.into()));
        Self {
            id,
            data,
            position: None,
            classes: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    /// Edges are recognised by carrying both endpoints.
    pub fn is_edge(&self) -> bool {
        self.endpoints().is_some()
    }

    pub fn endpoints(&self) -> Option<(&str, &str)> {
        let source = self.data.get("source")?.as_str()?;
        let target = self.data.get("target")?.as_str()?;
        Some((source, target))
    }

    /// Interaction artifacts that must never be persisted.
    pub fn is_ephemeral(&self) -> bool {
        self.classes
            .iter()
            .any(|class| EPHEMERAL_CLASSES.contains(&class.as_str()))
    }

    /// Document payload: `{data, position?}`.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("data".into(), Value::Object(self.data.clone()));
        if let Some(position) = self.position {
            fields.insert("position".into(), position_value(position));
        }
        fields
    }

    /// Rebuild an element from its document.
    pub fn from_document(doc: &Document) -> Self {
        let mut data = doc
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        data.insert("id".into(), Value::String(doc.id.clone()));
        Self {
            id: doc.id.clone(),
            data,
            position: doc.get("position").and_then(parse_position),
            classes: Vec::new(),
        }
    }
}

pub fn position_value(position: Position) -> Value {
    serde_json::json!({ "x": position.x, "y": position.y })
}

pub fn parse_position(value: &Value) -> Option<Position> {
    serde_json::from_value(value.clone()).ok()
}

#[derive(Debug, Clone)]
pub enum GraphEvent {
    Added {
        element: Element,
        origin: Origin,
    },
    Removed {
        element: Element,
        origin: Origin,
    },
    /// `data` is the element's full data after the change.
    DataChanged {
        id: String,
        data: Fields,
        origin: Origin,
    },
    PositionChanged {
        id: String,
        position: Position,
        origin: Origin,
    },
    /// `data` is the full network-level data after the change.
    NetworkDataChanged {
        data: Fields,
        origin: Origin,
    },
}

impl GraphEvent {
    pub fn origin(&self) -> Origin {
        match self {
            GraphEvent::Added { origin, .. }
            | GraphEvent::Removed { origin, .. }
            | GraphEvent::DataChanged { origin, .. }
            | GraphEvent::PositionChanged { origin, .. }
            | GraphEvent::NetworkDataChanged { origin, .. } => *origin,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin() == Origin::Local
    }
}

#[derive(Default)]
struct GraphState {
    elements: BTreeMap<String, Element>,
    data: Fields,
}

/// In-process graph of nodes and edges plus network-level data.
pub struct Graph {
    state: RwLock<GraphState>,
    events: Arc<EventBus<GraphEvent>>,
}

impl Graph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(GraphState::default()),
            events: Arc::new(EventBus::new()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, callback: impl Fn(GraphEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn element(&self, id: &str) -> Option<Element> {
        self.read().elements.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().elements.contains_key(id)
    }

    pub fn element_ids(&self) -> Vec<String> {
        self.read().elements.keys().cloned().collect()
    }

    pub fn elements(&self) -> Vec<Element> {
        self.read().elements.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn network_data(&self) -> Fields {
        self.read().data.clone()
    }

    pub fn add(&self, element: Element) -> Result<()> {
        self.add_from(element, Origin::Local)
    }

    pub fn add_from(&self, element: Element, origin: Origin) -> Result<()> {
        {
            let mut state = self.write();
            if state.elements.contains_key(&element.id) {
                return Err(GraphError::DuplicateElement(element.id));
            }
            if let Some((source, target)) = element.endpoints() {
                for node in [source, target] {
                    if !state.elements.contains_key(node) {
                        return Err(GraphError::DanglingEdge {
                            edge: element.id.clone(),
                            node: node.to_string(),
                        });
                    }
                }
            }
            state.elements.insert(element.id.clone(), element.clone());
        }
        self.events.emit(GraphEvent::Added { element, origin });
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.remove_from(id, Origin::Local)
    }

    /// Remove an element; removing a node also removes its connected edges.
    pub fn remove_from(&self, id: &str, origin: Origin) -> Result<()> {
        let removed = {
            let mut state = self.write();
            let element = state
                .elements
                .remove(id)
                .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;

            let mut removed = Vec::new();
            if !element.is_edge() {
                let connected: Vec<String> = state
                    .elements
                    .values()
                    .filter(|e| matches!(e.endpoints(), Some((s, t)) if s == id || t == id))
                    .map(|e| e.id.clone())
                    .collect();
                for edge_id in connected {
                    if let Some(edge) = state.elements.remove(&edge_id) {
                        removed.push(edge);
                    }
                }
            }
            removed.push(element);
            removed
        };

        for element in removed {
            self.events.emit(GraphEvent::Removed { element, origin });
        }
        Ok(())
    }

    /// Merge `patch` into an element's data.
    pub fn set_data(&self, id: &str, patch: Fields) -> Result<()> {
        self.update_data(id, patch, false, Origin::Local)
    }

    /// Replace an element's data wholesale.
    pub fn replace_data(&self, id: &str, data: Fields, origin: Origin) -> Result<()> {
        self.update_data(id, data, true, origin)
    }

    fn update_data(&self, id: &str, patch: Fields, replace: bool, origin: Origin) -> Result<()> {
        let data = {
            let mut state = self.write();
            let element = state
                .elements
                .get_mut(id)
                .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;
            if replace {
                element.data = patch;
            } else {
                element.data.extend(patch);
            }
            element.data.insert("id".into(), Value::String(id.to_string()));
            element.data.clone()
        };
        self.events.emit(GraphEvent::DataChanged {
            id: id.to_string(),
            data,
            origin,
        });
        Ok(())
    }

    pub fn set_position(&self, id: &str, position: Position) -> Result<()> {
        self.set_position_from(id, position, Origin::Local)
    }

    pub fn set_position_from(&self, id: &str, position: Position, origin: Origin) -> Result<()> {
        {
            let mut state = self.write();
            let element = state
                .elements
                .get_mut(id)
                .ok_or_else(|| GraphError::UnknownElement(id.to_string()))?;
            element.position = Some(position);
        }
        self.events.emit(GraphEvent::PositionChanged {
            id: id.to_string(),
            position,
            origin,
        });
        Ok(())
    }

    /// Merge `patch` into the network-level data.
    pub fn set_network_data(&self, patch: Fields) {
        let data = {
            let mut state = self.write();
            state.data.extend(patch);
            state.data.clone()
        };
        self.events.emit(GraphEvent::NetworkDataChanged {
            data,
            origin: Origin::Local,
        });
    }

    /// Replace the network-level data wholesale.
    pub fn replace_network_data(&self, data: Fields, origin: Origin) {
        {
            let mut state = self.write();
            state.data = data.clone();
        }
        self.events.emit(GraphEvent::NetworkDataChanged { data, origin });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn record(graph: &Graph) -> (Subscription, Arc<Mutex<Vec<GraphEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sub = graph.subscribe(move |e| events_clone.lock().unwrap().push(e));
        (sub, events)
    }

    #[test]
    fn test_add_and_remove() {
        let graph = Graph::new();
        let (_sub, events) = record(&graph);

        graph
            .add(Element::node("n1", fields(json!({"label": "A"})), Position { x: 1.0, y: 2.0 }))
            .unwrap();
        assert!(graph.contains("n1"));
        assert_eq!(graph.element("n1").unwrap().data["id"], "n1");

        graph.remove("n1").unwrap();
        assert!(graph.is_empty());

        let events = events.lock().unwrap();
        assert!(matches!(&events[0], GraphEvent::Added { element, origin: Origin::Local } if element.id == "n1"));
        assert!(matches!(&events[1], GraphEvent::Removed { element, .. } if element.id == "n1"));
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let graph = Graph::new();
        graph.add(Element::node("n1", Fields::new(), Position { x: 0.0, y: 0.0 })).unwrap();
        assert_eq!(
            graph.add(Element::node("n1", Fields::new(), Position { x: 0.0, y: 0.0 })),
            Err(GraphError::DuplicateElement("n1".into()))
        );
        assert_eq!(graph.remove("nope"), Err(GraphError::UnknownElement("nope".into())));
        assert!(matches!(
            graph.add(Element::edge("e1", "n1", "n2", Fields::new())),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn test_removing_node_removes_connected_edges() {
        let graph = Graph::new();
        graph.add(Element::node("a", Fields::new(), Position { x: 0.0, y: 0.0 })).unwrap();
        graph.add(Element::node("b", Fields::new(), Position { x: 0.0, y: 0.0 })).unwrap();
        graph.add(Element::edge("ab", "a", "b", Fields::new())).unwrap();
        let (_sub, events) = record(&graph);

        graph.remove("a").unwrap();
        assert_eq!(graph.element_ids(), vec!["b"]);

        let removed: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                GraphEvent::Removed { element, .. } => Some(element.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec!["ab", "a"]);
    }

    #[test]
    fn test_set_data_merges_and_replace_data_replaces() {
        let graph = Graph::new();
        graph
            .add(Element::node("n1", fields(json!({"a": 1})), Position { x: 0.0, y: 0.0 }))
            .unwrap();

        graph.set_data("n1", fields(json!({"b": 2}))).unwrap();
        let data = graph.element("n1").unwrap().data;
        assert_eq!(data["a"], 1);
        assert_eq!(data["b"], 2);

        graph
            .replace_data("n1", fields(json!({"c": 3})), Origin::Remote)
            .unwrap();
        let data = graph.element("n1").unwrap().data;
        assert!(data.get("a").is_none());
        assert_eq!(data["c"], 3);
        assert_eq!(data["id"], "n1");
    }

    #[test]
    fn test_events_carry_origin() {
        let graph = Graph::new();
        graph.add(Element::node("n1", Fields::new(), Position { x: 0.0, y: 0.0 })).unwrap();
        let (_sub, events) = record(&graph);

        graph.set_position("n1", Position { x: 5.0, y: 5.0 }).unwrap();
        graph
            .set_position_from("n1", Position { x: 6.0, y: 6.0 }, Origin::Remote)
            .unwrap();
        graph.replace_network_data(fields(json!({"name": "net"})), Origin::Remote);

        let events = events.lock().unwrap();
        assert!(events[0].is_local());
        assert!(!events[1].is_local());
        assert!(!events[2].is_local());
        assert_eq!(graph.element("n1").unwrap().position, Some(Position { x: 6.0, y: 6.0 }));
        assert_eq!(graph.network_data()["name"], "net");
    }

    #[test]
    fn test_element_document_round_trip_and_ephemeral() {
        let node = Element::node("n1", fields(json!({"label": "A"})), Position { x: 1.0, y: 2.0 });
        let doc = Document::new("n1", node.to_fields());
        assert_eq!(Element::from_document(&doc), node);

        let preview = Element::edge("tmp", "n1", "n2", Fields::new()).with_class("eh-preview");
        assert!(preview.is_edge());
        assert!(preview.is_ephemeral());
        assert!(!node.is_ephemeral());
    }
}
