//! Blind transfer node

use tracing::info;

use flowpbx_sip_core::Uri;

use crate::call::CallContext;
use crate::error::{Error, Result};
use crate::flow::FlowNode;
use crate::nodes::NodeOutcome;

/// REFER the upstream dialog at the configured target. Terminal.
///
/// Internal targets become `sip:<target>@<pbx>`; an external target names
/// its own host via the `target_host` config key (typically a trunk).
pub async fn run(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let target = node
        .config_str("target")
        .ok_or_else(|| Error::NodeConfig(format!("transfer node {} has no target", node.id)))?;

    let host = node
        .config_str("target_host")
        .map(str::to_string)
        .unwrap_or_else(|| ctx.env.media.advertise_ip().to_string());
    let uri = Uri::sip(target, host);

    // REFER needs an established dialog to ride on.
    ctx.ensure_answered().await?;
    ctx.call.refer(&uri).await?;
    info!(call_id = %ctx.record.call_id, %uri, "blind transfer referred");
    Ok(NodeOutcome::Terminal)
}
