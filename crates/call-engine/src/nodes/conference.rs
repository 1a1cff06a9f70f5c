//! Conference node

use std::time::Duration;

use tracing::{info, warn};

use flowpbx_media_core::{player, RoomConfig, Recorder};

use crate::call::CallContext;
use crate::error::{Error, Result};
use crate::flow::FlowNode;
use crate::nodes::NodeOutcome;
use crate::resolver::{ConferenceBridge, Resolver};

const PIN_ATTEMPTS: u32 = 3;
const PIN_DIGIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Join the caller to a conference bridge. Blocks until the caller leaves,
/// then continues via "next".
pub async fn run(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let id = node
        .entity
        .as_ref()
        .map(|e| e.id)
        .ok_or_else(|| Error::NodeConfig(format!("node {} has no entity reference", node.id)))?;
    let bridge = Resolver::conference(ctx.env.resolver.as_ref(), id).await?;

    ctx.ensure_answered().await?;

    if let Some(pin) = bridge.pin.clone().filter(|p| !p.is_empty()) {
        if !collect_pin(ctx, &pin).await? {
            warn!(bridge = bridge.id, "PIN attempts exhausted");
            ctx.play_samples(&player::tone(480.0, 400, 6_000)).await?;
            return Ok(NodeOutcome::next());
        }
    }

    join_room(ctx, &bridge).await?;
    Ok(NodeOutcome::next())
}

/// Up to three tries at the room PIN. A `#` submits early.
async fn collect_pin(ctx: &mut CallContext, pin: &str) -> Result<bool> {
    for _ in 0..PIN_ATTEMPTS {
        // Prompt tone, then gather as many digits as the PIN has.
        if !ctx.play_samples(&player::tone(620.0, 300, 6_000)).await? {
            return Err(Error::Cancelled);
        }
        ctx.drain_digits();

        let mut entered = String::new();
        while entered.len() < pin.len() {
            match ctx.collect_digit(PIN_DIGIT_TIMEOUT).await? {
                Some('#') => break,
                Some(digit) => entered.push(digit),
                None => break,
            }
        }
        if entered == pin {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn join_room(ctx: &mut CallContext, bridge: &ConferenceBridge) -> Result<()> {
    let membership = match ctx.env.conferences.join(
        bridge.id,
        RoomConfig {
            max_members: bridge.max_members,
            announce_join: bridge.announce_join,
        },
        ctx.session.clone(),
        bridge.mute_on_join,
    ) {
        Ok(membership) => membership,
        Err(flowpbx_media_core::Error::RoomFull { limit }) => {
            warn!(bridge = bridge.id, limit, "conference full");
            ctx.play_samples(&player::tone(480.0, 400, 6_000)).await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    info!(bridge = bridge.id, member = %membership.member_id(), "joined conference");

    // Room recording: started by the first member that asks for it; the
    // recorder lives with that member and flushes when they leave.
    let mut room_recorder: Option<Recorder> = None;
    if bridge.record && ctx.env.conferences.member_count(bridge.id) == 1 {
        let path = ctx.env.config.recordings_dir().join(format!(
            "conference_{}_{}.wav",
            bridge.id,
            chrono::Utc::now().timestamp()
        ));
        let recorder = Recorder::create(&path).await?;
        ctx.env
            .conferences
            .start_recording(bridge.id, recorder.handle());
        room_recorder = Some(recorder);
    }

    // Block until the caller leaves (hangs up).
    while !ctx.cancelled() {
        if ctx.cancel.changed().await.is_err() {
            break;
        }
    }

    membership.leave().await;
    if let Some(recorder) = room_recorder {
        ctx.env.conferences.stop_recording(bridge.id);
        let _ = recorder.finish().await;
    }
    info!(bridge = bridge.id, "left conference");
    Ok(())
}
