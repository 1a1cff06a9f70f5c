//! Call-flow graph model

pub mod context;
pub mod engine;
pub mod validate;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use context::FlowContext;
pub use validate::{validate, Severity, ValidationIssue};

/// Node types the engine executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    InboundNumber,
    Extension,
    RingGroup,
    TimeSwitch,
    IvrMenu,
    Voicemail,
    PlayMessage,
    Hangup,
    SetCallerId,
    Transfer,
    Conference,
    /// Reserved; routes to "next" with a warning.
    Webhook,
    /// Reserved; routes to "next" with a warning.
    Queue,
}

impl NodeKind {
    /// The entity type a node of this kind must reference, if any.
    pub fn entity_type(self) -> Option<&'static str> {
        match self {
            NodeKind::InboundNumber => Some("inbound_number"),
            NodeKind::Extension => Some("extension"),
            NodeKind::RingGroup => Some("ring_group"),
            NodeKind::TimeSwitch => Some("time_switch"),
            NodeKind::IvrMenu => Some("ivr_menu"),
            NodeKind::Voicemail => Some("voicemail_box"),
            NodeKind::Conference => Some("conference"),
            _ => None,
        }
    }

    /// Terminal nodes emit no output port.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeKind::Hangup | NodeKind::Transfer)
    }
}

/// A reference from a node to a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: u64,
}

/// One node of a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    /// Free-form per-node configuration.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl FlowNode {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }
}

/// A directed edge: `(source node, source port)` → target node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from_node: String,
    pub from_port: String,
    pub to_node: String,
}

/// A published call flow. Graphs may contain cycles; the engine's step
/// counter bounds execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraph {
    pub id: u64,
    pub name: String,
    pub entry_node: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn entry(&self) -> Option<&FlowNode> {
        self.node(&self.entry_node)
    }

    /// The single edge leaving `(node, port)`.
    pub fn edge_from(&self, node: &str, port: &str) -> Option<&FlowEdge> {
        self.edges
            .iter()
            .find(|e| e.from_node == node && e.from_port == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn sample_flow() -> FlowGraph {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "main",
            "entry_node": "in",
            "nodes": [
                {"id": "in", "kind": "inbound_number", "entity": {"entity_type": "inbound_number", "id": 10}},
                {"id": "hours", "kind": "time_switch", "entity": {"entity_type": "time_switch", "id": 3}},
                {"id": "vm", "kind": "voicemail", "entity": {"entity_type": "voicemail_box", "id": 5}},
                {"id": "bye", "kind": "hangup", "config": {"cause": 200}}
            ],
            "edges": [
                {"from_node": "in", "from_port": "next", "to_node": "hours"},
                {"from_node": "hours", "from_port": "default", "to_node": "vm"},
                {"from_node": "hours", "from_port": "business_hours", "to_node": "vm"},
                {"from_node": "vm", "from_port": "next", "to_node": "bye"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn serde_round_trip_is_stable() {
        let flow = sample_flow();
        let json = serde_json::to_string(&flow).unwrap();
        let reparsed: FlowGraph = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(json, rejson);
    }

    #[test]
    fn edge_lookup() {
        let flow = sample_flow();
        assert_eq!(flow.edge_from("in", "next").unwrap().to_node, "hours");
        assert!(flow.edge_from("in", "missing").is_none());
        assert_eq!(flow.entry().unwrap().kind, NodeKind::InboundNumber);
    }

    #[test]
    fn kind_metadata() {
        assert!(NodeKind::Hangup.is_terminal());
        assert!(NodeKind::Transfer.is_terminal());
        assert!(!NodeKind::IvrMenu.is_terminal());
        assert_eq!(NodeKind::Voicemail.entity_type(), Some("voicemail_box"));
        assert_eq!(NodeKind::PlayMessage.entity_type(), None);
    }
}
