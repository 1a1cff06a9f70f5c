//! Voicemail node

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use flowpbx_media_core::{player, Recorder};

use crate::call::CallContext;
use crate::cdr::Disposition;
use crate::error::{Error, Result};
use crate::flow::FlowNode;
use crate::nodes::NodeOutcome;
use crate::resolver::Resolver;
use crate::voicemail::{greeting_path, message_path, notify_new_message, VoicemailMessage};

/// Record a message into the target box. Port: "next".
pub async fn run(ctx: &mut CallContext, node: &FlowNode) -> Result<NodeOutcome> {
    let id = node
        .entity
        .as_ref()
        .map(|e| e.id)
        .ok_or_else(|| Error::NodeConfig(format!("node {} has no entity reference", node.id)))?;
    let mailbox = Resolver::voicemail_box(ctx.env.resolver.as_ref(), id).await?;

    // A full box refuses the recording outright.
    let stored = ctx.env.voicemail.message_count(mailbox.id).await;
    if stored >= mailbox.max_messages {
        warn!(mailbox = mailbox.id, stored, "mailbox full, refusing message");
        ctx.ensure_answered().await?;
        ctx.play_samples(&player::tone(480.0, 500, 6_000)).await?;
        return Ok(NodeOutcome::next());
    }

    ctx.ensure_answered().await?;

    // Greeting, then the record beep.
    let greeting = greeting_path(&ctx.env.config, &mailbox).await;
    if !ctx.play_file(greeting.as_deref()).await? {
        return Err(Error::Cancelled);
    }
    if !ctx.play_samples(&player::tone(1_000.0, 200, 8_000)).await? {
        return Err(Error::Cancelled);
    }

    // Record until hangup or the per-box cap.
    let path = message_path(&ctx.env.config, mailbox.id);
    let recorder = Recorder::create(&path).await?;
    ctx.session.set_recorder(recorder.handle());

    let cap = Duration::from_secs(mailbox.max_message_secs);
    let deadline = tokio::time::sleep(cap);
    tokio::pin!(deadline);
    let mut hung_up = false;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = ctx.cancel.changed() => {
                if changed.is_err() || *ctx.cancel.borrow() {
                    hung_up = true;
                    break;
                }
            }
        }
    }

    ctx.session.take_recorder();
    let duration_ms = recorder.finish().await?;
    let duration_secs = duration_ms / 1_000;

    let message = VoicemailMessage {
        mailbox_id: mailbox.id,
        caller_id_name: ctx.flow.caller_name.clone(),
        caller_id_num: ctx.flow.caller_num.clone(),
        received_at: Utc::now(),
        duration_secs,
        file: path,
    };
    if let Err(err) = ctx.env.voicemail.store(&message).await {
        // Best-effort persistence: the audio file survives either way.
        warn!(mailbox = mailbox.id, %err, "voicemail metadata write failed");
    }
    info!(
        mailbox = mailbox.id,
        duration_secs,
        caller = %message.caller_id_num,
        "voicemail recorded"
    );

    notify_new_message(
        &ctx.env.config,
        &ctx.env.transports,
        &ctx.env.bindings,
        &ctx.env.contact,
        &ctx.env.voicemail,
        ctx.env.mailer.as_ref(),
        &mailbox,
        &message,
    )
    .await;

    ctx.disposition_hint = Some(Disposition::Voicemail);
    if hung_up {
        return Err(Error::Cancelled);
    }
    Ok(NodeOutcome::next())
}
