//! Flow execution engine
//!
//! One cooperative task per call walks the graph from the entry node,
//! appending every visited node to the traversal path. Loops are legal;
//! a step counter and per-node deadlines bound execution. The caller's
//! hangup signal unwinds whatever node is in flight.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::call::CallContext;
use crate::cdr::Disposition;
use crate::error::Error;
use crate::flow::FlowGraph;
use crate::nodes::{self, NodeOutcome};

/// How a flow run ended; folded into the call record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEnd {
    pub disposition: Disposition,
    pub cause: String,
}

impl FlowEnd {
    fn failed(cause: impl Into<String>) -> FlowEnd {
        FlowEnd {
            disposition: Disposition::Failed,
            cause: cause.into(),
        }
    }
}

/// Walk the graph until a terminal node, a routing dead-end, cancellation
/// or an error.
pub async fn run_flow(ctx: &mut CallContext, graph: &FlowGraph) -> FlowEnd {
    let mut current = match graph.entry() {
        Some(node) => node,
        None => return FlowEnd::failed("no route"),
    };
    let mut steps = 0usize;

    loop {
        if ctx.cancelled() || ctx.ended {
            return hangup_end(ctx);
        }
        steps += 1;
        if steps > ctx.env.config.max_flow_steps {
            warn!(flow = graph.id, "step limit hit, aborting call");
            return FlowEnd::failed("loop limit exceeded");
        }

        ctx.flow.enter_node(&current.id);
        debug!(flow = graph.id, node = %current.id, kind = ?current.kind, "entering node");

        let deadline = Duration::from_secs(
            current
                .config_u64("deadline_secs")
                .unwrap_or(ctx.env.config.node_deadline_secs),
        );

        let outcome = match tokio::time::timeout(deadline, nodes::execute(ctx, current)).await {
            Err(_) => {
                warn!(node = %current.id, "node deadline exceeded");
                return FlowEnd::failed(format!("node {} timed out", current.id));
            }
            Ok(Err(Error::Cancelled)) => return hangup_end(ctx),
            Ok(Err(err)) => {
                warn!(node = %current.id, %err, "node failed");
                return FlowEnd::failed(err.to_string());
            }
            Ok(Ok(outcome)) => outcome,
        };

        let port = match outcome {
            NodeOutcome::Terminal => {
                return FlowEnd {
                    disposition: final_disposition(ctx),
                    cause: "normal clearing".into(),
                }
            }
            NodeOutcome::Port(port) => port,
        };

        current = match graph.edge_from(&current.id, &port) {
            Some(edge) => match graph.node(&edge.to_node) {
                Some(node) => node,
                None => {
                    warn!(node = %current.id, %port, "edge targets a missing node");
                    return FlowEnd::failed("no route");
                }
            },
            None => {
                // No wiring for this port ends the call gracefully. A call
                // that already did its useful work keeps a normal cause.
                info!(node = %current.id, %port, "no route from port, ending call");
                let disposition = final_disposition(ctx);
                return FlowEnd {
                    cause: if disposition == Disposition::NoAnswer {
                        "no route".into()
                    } else {
                        "normal clearing".into()
                    },
                    disposition,
                };
            }
        };
    }
}

/// Disposition when the call ended mid-flow. Auto-answered media (prompts,
/// IVR) does not count as an answered call; only a bridged callee or a
/// voicemail deposit does.
fn hangup_end(ctx: &CallContext) -> FlowEnd {
    FlowEnd {
        disposition: final_disposition(ctx),
        cause: if ctx.callee.is_some() {
            "normal clearing".into()
        } else {
            "originator cancel".into()
        },
    }
}

fn final_disposition(ctx: &CallContext) -> Disposition {
    ctx.disposition_hint.unwrap_or(if ctx.callee.is_some() {
        Disposition::Answered
    } else {
        Disposition::NoAnswer
    })
}
