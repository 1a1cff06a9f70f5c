//! Pre-publish flow validation

use std::collections::HashSet;

use crate::flow::{FlowGraph, NodeKind};
use crate::resolver::EntityResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One validation finding. Publishing requires zero errors.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub node_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn error(node_id: Option<&str>, message: impl Into<String>) -> Self {
        ValidationIssue {
            severity: Severity::Error,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(node_id: Option<&str>, message: impl Into<String>) -> Self {
        ValidationIssue {
            severity: Severity::Warning,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Output ports a node is required to wire, given its kind and
/// configuration. Terminal nodes require none.
fn required_ports(graph: &FlowGraph, node_id: &str, kind: NodeKind) -> Vec<String> {
    match kind {
        NodeKind::Hangup | NodeKind::Transfer => Vec::new(),
        NodeKind::Extension | NodeKind::RingGroup => {
            vec!["answered".into(), "no_answer".into()]
        }
        NodeKind::TimeSwitch => {
            // Labels come from the entity at runtime; statically we can
            // only require the fallback.
            vec!["default".into()]
        }
        NodeKind::IvrMenu => {
            let mut ports: Vec<String> = graph
                .node(node_id)
                .and_then(|n| n.config.get("options"))
                .and_then(|v| v.as_object())
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            ports.push("timeout".into());
            ports.push("invalid".into());
            ports
        }
        _ => vec!["next".into()],
    }
}

/// Validate a flow graph against structural rules and the entity store.
pub async fn validate(graph: &FlowGraph, resolver: &dyn EntityResolver) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    // (a) entry node present and existing.
    let entry_ok = graph.entry().is_some();
    if graph.entry_node.is_empty() {
        issues.push(ValidationIssue::error(None, "flow has no entry node"));
    } else if !entry_ok {
        issues.push(ValidationIssue::error(
            None,
            format!("entry node {:?} does not exist", graph.entry_node),
        ));
    }

    let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    if node_ids.len() != graph.nodes.len() {
        issues.push(ValidationIssue::error(None, "duplicate node ids"));
    }

    // (d) edges must reference existing nodes, and (source, port) must be
    // unique for deterministic routing.
    let mut seen_ports = HashSet::new();
    for edge in &graph.edges {
        if !node_ids.contains(edge.from_node.as_str()) {
            issues.push(ValidationIssue::error(
                Some(&edge.from_node),
                format!("edge starts at unknown node {:?}", edge.from_node),
            ));
        }
        if !node_ids.contains(edge.to_node.as_str()) {
            issues.push(ValidationIssue::error(
                Some(&edge.from_node),
                format!("edge targets unknown node {:?}", edge.to_node),
            ));
        }
        if !seen_ports.insert((edge.from_node.clone(), edge.from_port.clone())) {
            issues.push(ValidationIssue::error(
                Some(&edge.from_node),
                format!("port {:?} has more than one outgoing edge", edge.from_port),
            ));
        }
    }

    for node in &graph.nodes {
        // (b) entity references must exist with the right type.
        match (node.kind.entity_type(), &node.entity) {
            (Some(expected), Some(entity_ref)) => {
                if entity_ref.entity_type != expected {
                    issues.push(ValidationIssue::error(
                        Some(&node.id),
                        format!(
                            "node references a {:?} entity, {expected:?} required",
                            entity_ref.entity_type
                        ),
                    ));
                } else if let Err(err) = resolver.resolve(expected, entity_ref.id).await {
                    issues.push(ValidationIssue::error(Some(&node.id), err.to_string()));
                }
            }
            (Some(expected), None) => {
                issues.push(ValidationIssue::error(
                    Some(&node.id),
                    format!("node needs a {expected} entity reference"),
                ));
            }
            (None, Some(_)) => {
                issues.push(ValidationIssue::warning(
                    Some(&node.id),
                    "entity reference is ignored for this node type",
                ));
            }
            (None, None) => {}
        }

        // (c) required ports must be wired on non-terminal nodes.
        for port in required_ports(graph, &node.id, node.kind) {
            if graph.edge_from(&node.id, &port).is_none() {
                issues.push(ValidationIssue::error(
                    Some(&node.id),
                    format!("required output port {port:?} has no edge"),
                ));
            }
        }

        if matches!(node.kind, NodeKind::Webhook | NodeKind::Queue) {
            issues.push(ValidationIssue::warning(
                Some(&node.id),
                "node type is reserved and currently passes through",
            ));
        }
    }

    // Unreachable nodes are legal but suspicious.
    if entry_ok {
        let mut reachable = HashSet::new();
        let mut stack = vec![graph.entry_node.as_str()];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            for edge in graph.edges.iter().filter(|e| e.from_node == id) {
                stack.push(&edge.to_node);
            }
        }
        for node in &graph.nodes {
            if !reachable.contains(node.id.as_str()) {
                issues.push(ValidationIssue::warning(
                    Some(&node.id),
                    "node is unreachable from the entry node",
                ));
            }
        }
    }

    issues
}

/// True when the flow can be published.
pub fn publishable(issues: &[ValidationIssue]) -> bool {
    issues.iter().all(|i| i.severity != Severity::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{EntityRef, FlowEdge, FlowGraph, FlowNode};
    use crate::resolver::{StaticResolver, TimeRule, TimeSwitch, VoicemailBox};

    fn resolver() -> StaticResolver {
        StaticResolver {
            time_switches: vec![TimeSwitch {
                id: 3,
                name: "hours".into(),
                timezone: "Australia/Sydney".into(),
                rules: vec![TimeRule {
                    label: "business_hours".into(),
                    days: vec!["mon".into()],
                    start: "08:30".into(),
                    end: "17:00".into(),
                }],
            }],
            voicemail_boxes: vec![VoicemailBox {
                id: 5,
                name: "main".into(),
                max_messages: 100,
                max_message_secs: 180,
                greeting_type: "default".into(),
                notify_extension: None,
                email: None,
                email_attach_audio: false,
            }],
            ..Default::default()
        }
    }

    fn valid_flow() -> FlowGraph {
        FlowGraph {
            id: 1,
            name: "main".into(),
            entry_node: "ts".into(),
            nodes: vec![
                FlowNode {
                    id: "ts".into(),
                    kind: NodeKind::TimeSwitch,
                    entity: Some(EntityRef {
                        entity_type: "time_switch".into(),
                        id: 3,
                    }),
                    config: Default::default(),
                },
                FlowNode {
                    id: "vm".into(),
                    kind: NodeKind::Voicemail,
                    entity: Some(EntityRef {
                        entity_type: "voicemail_box".into(),
                        id: 5,
                    }),
                    config: Default::default(),
                },
                FlowNode {
                    id: "end".into(),
                    kind: NodeKind::Hangup,
                    entity: None,
                    config: Default::default(),
                },
            ],
            edges: vec![
                FlowEdge {
                    from_node: "ts".into(),
                    from_port: "default".into(),
                    to_node: "vm".into(),
                },
                FlowEdge {
                    from_node: "vm".into(),
                    from_port: "next".into(),
                    to_node: "end".into(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn valid_flow_publishes() {
        let issues = validate(&valid_flow(), &resolver()).await;
        assert!(publishable(&issues), "{issues:?}");
    }

    #[tokio::test]
    async fn missing_entry_is_an_error() {
        let mut flow = valid_flow();
        flow.entry_node = "gone".into();
        let issues = validate(&flow, &resolver()).await;
        assert!(!publishable(&issues));
    }

    #[tokio::test]
    async fn unknown_entity_is_an_error() {
        let mut flow = valid_flow();
        flow.nodes[1].entity = Some(EntityRef {
            entity_type: "voicemail_box".into(),
            id: 999,
        });
        let issues = validate(&flow, &resolver()).await;
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Error && i.node_id.as_deref() == Some("vm")));
    }

    #[tokio::test]
    async fn wrong_entity_type_is_an_error() {
        let mut flow = valid_flow();
        flow.nodes[1].entity = Some(EntityRef {
            entity_type: "time_switch".into(),
            id: 3,
        });
        let issues = validate(&flow, &resolver()).await;
        assert!(!publishable(&issues));
    }

    #[tokio::test]
    async fn missing_required_port_is_an_error() {
        let mut flow = valid_flow();
        flow.edges.remove(1); // vm:next
        let issues = validate(&flow, &resolver()).await;
        assert!(issues.iter().any(|i| {
            i.severity == Severity::Error && i.message.contains("\"next\"")
        }));
    }

    #[tokio::test]
    async fn dangling_edge_target_is_an_error() {
        let mut flow = valid_flow();
        flow.edges.push(FlowEdge {
            from_node: "end".into(),
            from_port: "oops".into(),
            to_node: "nowhere".into(),
        });
        let issues = validate(&flow, &resolver()).await;
        assert!(!publishable(&issues));
    }

    #[tokio::test]
    async fn unreachable_node_is_a_warning() {
        let mut flow = valid_flow();
        flow.nodes.push(FlowNode {
            id: "island".into(),
            kind: NodeKind::Hangup,
            entity: None,
            config: Default::default(),
        });
        let issues = validate(&flow, &resolver()).await;
        assert!(publishable(&issues));
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Warning && i.node_id.as_deref() == Some("island")));
    }
}
