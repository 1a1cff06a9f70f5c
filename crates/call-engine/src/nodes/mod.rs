//! Node handlers
//!
//! Every node type shares one contract: `execute(ctx, node)` returns the
//! name of an output port, or marks the node terminal. Dispatch is a flat
//! match on the node kind.

mod conference;
mod extension;
mod ivr;
mod time_switch;
mod transfer;
mod voicemail;

use tracing::warn;

use flowpbx_sip_core::StatusCode;

use crate::call::CallContext;
use crate::error::Result;
use crate::flow::{FlowNode, NodeKind};

pub use time_switch::evaluate_rules;

/// Handler result: where the flow goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Follow the edge from this named output port.
    Port(String),
    /// The node ended the call; the engine stops walking.
    Terminal,
}

impl NodeOutcome {
    pub fn next() -> NodeOutcome {
        NodeOutcome::Port("next".into())
    }
}

/// Execute one node.
pub async fn execute(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    match node.kind {
        NodeKind::InboundNumber => Ok(NodeOutcome::next()),
        NodeKind::Extension => extension::run(ctx, node).await,
        NodeKind::RingGroup => extension::run_group(ctx, node).await,
        NodeKind::TimeSwitch => time_switch::run(ctx, node).await,
        NodeKind::IvrMenu => ivr::run(ctx, node).await,
        NodeKind::Voicemail => voicemail::run(ctx, node).await,
        NodeKind::PlayMessage => play_message(ctx, node).await,
        NodeKind::Hangup => hangup(ctx, node).await,
        NodeKind::SetCallerId => set_caller_id(ctx, node),
        NodeKind::Transfer => transfer::run(ctx, node).await,
        NodeKind::Conference => conference::run(ctx, node).await,
        NodeKind::Webhook | NodeKind::Queue => {
            warn!(node = %node.id, kind = ?node.kind, "reserved node type, passing through");
            Ok(NodeOutcome::next())
        }
    }
}

/// Resolve a prompt reference from node config: absolute paths as-is,
/// otherwise relative to the custom and then system prompt directories.
pub(crate) async fn resolve_prompt(
    ctx: &CallContext,
    file: &str,
) -> Option<std::path::PathBuf> {
    let direct = std::path::Path::new(file);
    if direct.is_absolute() {
        return tokio::fs::try_exists(direct)
            .await
            .unwrap_or(false)
            .then(|| direct.to_path_buf());
    }
    for base in [
        ctx.env.config.data_dir.join("prompts/custom"),
        ctx.env.config.system_prompts_dir(),
    ] {
        let candidate = base.join(file);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

async fn play_message(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    ctx.ensure_answered().await?;
    let path = match node.config_str("file") {
        Some(file) => resolve_prompt(ctx, file).await,
        None => {
            if let Some(text) = node.config_str("text") {
                // Synthesis is an external concern; without a rendered file
                // the node plays silence so the flow timing holds.
                warn!(node = %node.id, "no audio rendered for text {text:?}, playing silence");
            }
            None
        }
    };
    ctx.play_file(path.as_deref()).await?;
    Ok(NodeOutcome::next())
}

async fn hangup(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let cause = node.config_u64("cause").unwrap_or(200) as u16;
    if !ctx.answered && cause >= 400 {
        ctx.call.reject(StatusCode(cause)).await?;
    } else {
        // Normal clearing: answer if needed, then BYE.
        ctx.ensure_answered().await?;
        ctx.call.bye().await?;
    }
    Ok(NodeOutcome::Terminal)
}

fn set_caller_id(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    if let Some(name) = node.config_str("name") {
        ctx.flow.caller_name = name.to_string();
    }
    if let Some(number) = node.config_str("number") {
        ctx.flow.caller_num = number.to_string();
    }
    Ok(NodeOutcome::next())
}
