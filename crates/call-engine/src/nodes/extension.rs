//! Extension and ring-group nodes

use std::time::Duration;

use tracing::{debug, info, warn};

use flowpbx_dialog_core::{RingOutcome, RingStrategy};

use crate::call::{CallContext, RingTarget};
use crate::error::{Error, Result};
use crate::flow::FlowNode;
use crate::nodes::NodeOutcome;
use crate::resolver::{Extension, Resolver};

fn entity_id(node: &FlowNode) -> Result<u64> {
    node.entity
        .as_ref()
        .map(|e| e.id)
        .ok_or_else(|| Error::NodeConfig(format!("node {} has no entity reference", node.id)))
}

/// Ring one extension's devices. Ports: "answered" / "no_answer".
pub async fn run(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let extension = Resolver::extension(ctx.env.resolver.as_ref(), entity_id(node)?).await?;

    if extension.dnd {
        debug!(extension = %extension.number, "DND set, skipping ring");
        return Ok(NodeOutcome::Port("no_answer".into()));
    }

    // Ring timeout precedence: node config, extension setting, default.
    let ring_timeout = Duration::from_secs(
        node.config_u64("ring_timeout_secs")
            .or(extension.ring_timeout_secs)
            .unwrap_or(ctx.env.config.ring_timeout_secs),
    );

    let targets = targets_for(ctx, &extension).await;
    if targets.is_empty() {
        debug!(extension = %extension.number, "no bindings to ring");
        return Ok(NodeOutcome::Port("no_answer".into()));
    }

    match ctx.ring_targets(targets, ring_timeout).await? {
        RingOutcome::Answered => {
            ctx.maybe_start_recording(extension.record_calls).await?;
            // The node holds the call while it is bridged.
            ctx.wait_bridged().await;
            Ok(NodeOutcome::Port("answered".into()))
        }
        RingOutcome::Cancelled => Err(Error::Cancelled),
        RingOutcome::Failed => Err(Error::Other("every leg failed to send".into())),
        // Busy, declined and timeout all fall through the no-answer edge.
        _ => Ok(NodeOutcome::Port("no_answer".into())),
    }
}

/// Current ring targets for an extension, waking push-only devices when
/// there is no live binding.
async fn targets_for(ctx: &mut CallContext, extension: &Extension) -> Vec<RingTarget> {
    let mut bindings = ctx.env.bindings.lookup(&extension.number);

    if bindings.is_empty() {
        bindings = push_wake(ctx, extension).await;
    }

    bindings
        .into_iter()
        .map(|binding| RingTarget {
            member: extension.number.clone(),
            binding,
        })
        .collect()
}

/// Fire a push wake-up and hold for a matching REGISTER.
async fn push_wake(
    ctx: &mut CallContext,
    extension: &Extension,
) -> Vec<flowpbx_registrar_core::Binding> {
    let push = match &ctx.env.push {
        Some(push) => push.clone(),
        None => return Vec::new(),
    };
    let tokens = ctx.env.bindings.push_tokens(&extension.number);
    if tokens.is_empty() {
        return Vec::new();
    }

    // Subscribe before the POST so the re-REGISTER cannot race past us.
    let mut registrations = ctx.env.bindings.subscribe_registrations();
    for (token, platform) in &tokens {
        push.wake(
            token,
            platform,
            &ctx.flow.caller_name,
            &ctx.flow.caller_num,
            &ctx.record.call_id,
        )
        .await;
    }
    info!(extension = %extension.number, "push wake-up sent, holding for registration");

    let window = Duration::from_secs(ctx.env.config.push_wait_secs);
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = ctx.cancel.changed() => {
                if changed.is_err() || *ctx.cancel.borrow() {
                    break;
                }
            }
            registered = registrations.recv() => {
                match registered {
                    Ok(number) if number == extension.number => {
                        debug!(extension = %number, "woken device registered");
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
    }
    ctx.env.bindings.lookup(&extension.number)
}

/// Ring-group node. Ports: "answered" / "no_answer".
pub async fn run_group(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let group = Resolver::ring_group(ctx.env.resolver.as_ref(), entity_id(node)?).await?;
    let strategy = RingStrategy::parse(&group.strategy);

    let ring_timeout = Duration::from_secs(
        node.config_u64("ring_timeout_secs")
            .or(group.ring_timeout_secs)
            .unwrap_or(ctx.env.config.ring_timeout_secs),
    );

    // Caller-id mode: "prepend" marks the legs with the group name.
    let original_name = ctx.flow.caller_name.clone();
    if group.caller_id_mode == "prepend" {
        ctx.flow.caller_name = if original_name.is_empty() {
            group.name.clone()
        } else {
            format!("{} {original_name}", group.name)
        };
    }

    let ordered = ctx
        .env
        .ring_state
        .order_members(strategy, group.id, &group.members);

    let outcome = if strategy.is_sequential() {
        ring_sequential(ctx, &ordered, ring_timeout).await
    } else {
        ring_parallel(ctx, &ordered, ring_timeout).await
    };
    ctx.flow.caller_name = original_name;

    match outcome? {
        RingOutcome::Answered => {
            ctx.wait_bridged().await;
            Ok(NodeOutcome::Port("answered".into()))
        }
        RingOutcome::Cancelled => Err(Error::Cancelled),
        _ => Ok(NodeOutcome::Port("no_answer".into())),
    }
}

/// Ring-all: every member's every binding in one race.
async fn ring_parallel(
    ctx: &mut CallContext,
    members: &[String],
    ring_timeout: Duration,
) -> Result<RingOutcome> {
    let mut targets = Vec::new();
    for member in members {
        if let Some(extension) = ctx.env.resolver.extension_by_number(member).await {
            if extension.dnd {
                continue;
            }
            for binding in ctx.env.bindings.lookup(member) {
                targets.push(RingTarget {
                    member: member.clone(),
                    binding,
                });
            }
        } else {
            warn!(%member, "ring group references unknown extension");
        }
    }
    ctx.ring_targets(targets, ring_timeout).await
}

/// Hunt: one member at a time in strategy order, full timeout each.
async fn ring_sequential(
    ctx: &mut CallContext,
    members: &[String],
    ring_timeout: Duration,
) -> Result<RingOutcome> {
    let mut last = RingOutcome::NoAnswer;
    for member in members {
        if ctx.cancelled() {
            return Ok(RingOutcome::Cancelled);
        }
        let extension = match ctx.env.resolver.extension_by_number(member).await {
            Some(extension) if !extension.dnd => extension,
            _ => continue,
        };
        let targets: Vec<RingTarget> = ctx
            .env
            .bindings
            .lookup(&extension.number)
            .into_iter()
            .map(|binding| RingTarget {
                member: member.clone(),
                binding,
            })
            .collect();
        if targets.is_empty() {
            continue;
        }
        match ctx.ring_targets(targets, ring_timeout).await? {
            RingOutcome::Answered => return Ok(RingOutcome::Answered),
            RingOutcome::Cancelled => return Ok(RingOutcome::Cancelled),
            outcome => last = outcome,
        }
    }
    Ok(last)
}
