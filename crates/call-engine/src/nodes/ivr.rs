//! IVR menu node

use std::time::Duration;

use tracing::{debug, warn};

use flowpbx_media_core::player;

use crate::call::CallContext;
use crate::error::{Error, Result};
use crate::flow::FlowNode;
use crate::nodes::{resolve_prompt, NodeOutcome};
use crate::resolver::Resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Timeout,
    Invalid,
}

/// Play the greeting and collect one digit, retrying on timeout or invalid
/// input. Ports: each configured digit, plus "timeout" and "invalid".
pub async fn run(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let id = node
        .entity
        .as_ref()
        .map(|e| e.id)
        .ok_or_else(|| Error::NodeConfig(format!("node {} has no entity reference", node.id)))?;
    let menu = Resolver::ivr_menu(ctx.env.resolver.as_ref(), id).await?;

    ctx.ensure_answered().await?;

    let greeting = match &menu.greeting_file {
        Some(file) => match resolve_prompt(ctx, file).await {
            Some(path) => player::load_prompt(&path).await.unwrap_or_else(|err| {
                warn!(menu = menu.id, %err, "greeting unreadable, playing silence");
                player::silence(2_000)
            }),
            None => {
                warn!(menu = menu.id, %file, "greeting file missing, playing silence");
                player::silence(2_000)
            }
        },
        None => {
            if let Some(text) = &menu.greeting_text {
                warn!(menu = menu.id, "no audio rendered for greeting text {text:?}");
            }
            player::silence(2_000)
        }
    };

    let inter_digit = Duration::from_secs(menu.timeout_secs);
    let mut saw_invalid = false;

    // One initial attempt plus max_retries replays.
    for attempt in 0..=menu.max_retries {
        ctx.drain_digits();
        let failure = match ctx.play_collecting(&greeting, inter_digit).await? {
            Some(digit) => {
                let key = digit.to_string();
                if menu.options.contains_key(&key) {
                    debug!(menu = menu.id, digit = %key, "menu selection");
                    return Ok(NodeOutcome::Port(key));
                }
                debug!(menu = menu.id, digit = %key, attempt, "invalid selection");
                Failure::Invalid
            }
            None => {
                debug!(menu = menu.id, attempt, "no digit before timeout");
                Failure::Timeout
            }
        };
        saw_invalid |= failure == Failure::Invalid;
    }

    // Out of retries: a cycle that saw any invalid entry leaves through
    // "invalid"; pure silence leaves through "timeout".
    Ok(NodeOutcome::Port(
        if saw_invalid { "invalid" } else { "timeout" }.into(),
    ))
}
