//! Per-call flow state

use std::collections::HashMap;

/// Mutable state a call carries through the flow graph. The traversal path
/// is append-only and lands in the call detail record at teardown.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    pub caller_name: String,
    pub caller_num: String,
    /// Digits collected so far (drained by collecting nodes).
    pub digit_buffer: String,
    /// Free variables set by nodes for downstream nodes.
    pub variables: HashMap<String, String>,
    /// Ids of every node entered, in order.
    pub path: Vec<String>,
}

impl FlowContext {
    pub fn new(caller_name: impl Into<String>, caller_num: impl Into<String>) -> Self {
        FlowContext {
            caller_name: caller_name.into(),
            caller_num: caller_num.into(),
            ..Default::default()
        }
    }

    pub fn enter_node(&mut self, node_id: &str) {
        self.path.push(node_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_append_only_in_order() {
        let mut ctx = FlowContext::new("Alice", "0255501234");
        ctx.enter_node("in");
        ctx.enter_node("ts");
        ctx.enter_node("vm");
        assert_eq!(ctx.path, vec!["in", "ts", "vm"]);
    }
}
