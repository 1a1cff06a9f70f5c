//! Per-call context shared by the flow engine and node handlers

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use flowpbx_dialog_core::{
    build_leg_invite, ring_race, ClientDialog, ClientInvite, DialogManager, RingOutcome,
    RingState, ServerCall,
};
use flowpbx_media_core::{
    player, ConferenceManager, DtmfEvent, LegIo, MediaEngine, MediaSession, PlayOutcome,
    Recorder,
};
use flowpbx_registrar_core::{Binding, BindingStore, TrunkManager};
use flowpbx_sip_core::sdp::SessionDescription;
use flowpbx_sip_core::Address;
use flowpbx_sip_transport::TransportManager;

use crate::cdr::{CallRecord, Disposition};
use crate::config::{Config, RecordingPolicy};
use crate::error::{Error, Result};
use crate::flow::FlowContext;
use crate::push::PushClient;
use crate::resolver::EntityResolver;
use crate::voicemail::{Mailer, VoicemailSink};

/// Everything long-lived a call can reach: configuration, stores and the
/// shared subsystems.
pub struct CallEnv {
    pub config: Arc<Config>,
    pub resolver: Arc<dyn EntityResolver>,
    pub bindings: Arc<BindingStore>,
    pub dialog: Arc<DialogManager>,
    pub media: MediaEngine,
    pub conferences: Arc<ConferenceManager>,
    pub ring_state: Arc<RingState>,
    pub trunks: Arc<TrunkManager>,
    pub transports: Arc<TransportManager>,
    /// Contact header the PBX advertises.
    pub contact: Address,
    pub push: Option<PushClient>,
    pub mailer: Option<Mailer>,
    pub voicemail: Arc<dyn VoicemailSink>,
}

/// A ringable device target.
pub struct RingTarget {
    /// Member extension the binding belongs to (for ring-group bookkeeping).
    pub member: String,
    pub binding: Binding,
}

/// Mutable per-call state threaded through the flow engine.
pub struct CallContext {
    pub env: Arc<CallEnv>,
    pub call: Arc<ServerCall>,
    pub session: Arc<MediaSession>,
    pub flow: FlowContext,
    pub record: CallRecord,
    /// Hangup signal: set once when the caller cancels/hangs up or the
    /// session expires.
    pub cancel: watch::Receiver<bool>,
    dtmf: mpsc::Receiver<DtmfEvent>,
    /// The answered downstream leg, for teardown.
    pub callee: Option<ClientDialog>,
    pub answered: bool,
    /// Set when a bridged call finished (either side hung up); the flow
    /// engine stops walking.
    pub ended: bool,
    /// Active call recording, flushed at teardown.
    pub recorder: Option<Recorder>,
    /// Set by the voicemail node so the disposition reads "voicemail".
    pub disposition_hint: Option<Disposition>,
}

impl CallContext {
    pub fn new(
        env: Arc<CallEnv>,
        call: Arc<ServerCall>,
        session: Arc<MediaSession>,
        flow: FlowContext,
        record: CallRecord,
        cancel: watch::Receiver<bool>,
    ) -> CallContext {
        let dtmf = session.take_dtmf().unwrap_or_else(|| {
            // Only reachable if something already claimed the stream.
            let (_tx, rx) = mpsc::channel(1);
            rx
        });
        CallContext {
            env,
            call,
            session,
            flow,
            record,
            cancel,
            dtmf,
            callee: None,
            answered: false,
            ended: false,
            recorder: None,
            disposition_hint: None,
        }
    }

    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// The SDP answer committing the proxy's caller-side media address.
    pub fn caller_answer_sdp(&self) -> Bytes {
        let leg = self.session.caller_leg();
        let sdp = SessionDescription::audio(
            self.env.media.advertise_ip(),
            leg.rtp_port(),
            &[leg.payload_type(), flowpbx_media_core::DTMF_PAYLOAD],
        );
        Bytes::from(sdp.to_string())
    }

    /// Answer the upstream leg if it has not been answered yet.
    pub async fn ensure_answered(&mut self) -> Result<()> {
        if self.answered {
            return Ok(());
        }
        self.call.answer(self.caller_answer_sdp()).await?;
        self.answered = true;
        self.record.mark_answered();
        info!(call_id = %self.record.call_id, "call answered");
        Ok(())
    }

    /// Play a prompt file (or silence when it is missing) to the caller.
    /// Returns false when playback was cancelled by hangup.
    pub async fn play_file(&mut self, path: Option<&std::path::Path>) -> Result<bool> {
        let samples = match path {
            Some(path) => match player::load_prompt(path).await {
                Ok(samples) => samples,
                Err(err) => {
                    warn!(path = %path.display(), %err, "prompt unreadable, playing silence");
                    player::silence(1_000)
                }
            },
            None => player::silence(1_000),
        };
        self.play_samples(&samples).await
    }

    /// Play raw samples to the caller. Returns false on hangup.
    pub async fn play_samples(&mut self, samples: &[i16]) -> Result<bool> {
        let mut streamer = self.session.streamer_for(self.session.caller_leg())?;
        let outcome = player::play(&mut streamer, samples, &mut self.cancel).await?;
        Ok(outcome == PlayOutcome::Completed)
    }

    /// Drop any digits buffered before a fresh collect.
    pub fn drain_digits(&mut self) {
        while self.dtmf.try_recv().is_ok() {}
    }

    /// Play a prompt while listening for a digit (barge-in), then keep
    /// collecting for `timeout_after` once playback ends. `None` means no
    /// digit arrived at all.
    pub async fn play_collecting(
        &mut self,
        samples: &[i16],
        timeout_after: Duration,
    ) -> Result<Option<char>> {
        let mut streamer = self.session.streamer_for(self.session.caller_leg())?;
        let mut play_cancel = self.cancel.clone();
        let play = player::play(&mut streamer, samples, &mut play_cancel);
        tokio::pin!(play);

        loop {
            tokio::select! {
                outcome = &mut play => {
                    match outcome? {
                        PlayOutcome::Cancelled => return Err(Error::Cancelled),
                        PlayOutcome::Completed => break,
                    }
                }
                event = self.dtmf.recv() => {
                    match event {
                        Some(event) => {
                            self.flow.digit_buffer.push(event.digit);
                            return Ok(Some(event.digit));
                        }
                        None => return Err(Error::Cancelled),
                    }
                }
            }
        }
        self.collect_digit(timeout_after).await
    }

    /// Wait for one DTMF digit. `None` on timeout; `Err(Cancelled)` on
    /// hangup.
    pub async fn collect_digit(&mut self, timeout: Duration) -> Result<Option<char>> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(None),
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return Err(Error::Cancelled);
                    }
                }
                event = self.dtmf.recv() => {
                    match event {
                        Some(event) => {
                            self.flow.digit_buffer.push(event.digit);
                            return Ok(Some(event.digit));
                        }
                        None => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }

    /// Ring a set of device bindings in parallel and bridge the winner.
    ///
    /// Sends 180 upstream on the first downstream ringing. On answer the
    /// winning leg is promoted in the media session, the upstream leg is
    /// answered (if not already) and the established dialog is retained
    /// for teardown.
    pub async fn ring_targets(
        &mut self,
        targets: Vec<RingTarget>,
        ring_timeout: Duration,
    ) -> Result<RingOutcome> {
        if targets.is_empty() {
            return Ok(RingOutcome::NoAnswer);
        }

        let caller_payload = self.session.caller_leg().payload_type();
        let mut legs = Vec::with_capacity(targets.len());
        let mut leg_ios: Vec<Arc<LegIo>> = Vec::with_capacity(targets.len());

        for target in &targets {
            let leg = self.session.attach_fork_leg(caller_payload).await?;
            let offer = SessionDescription::audio(
                self.env.media.advertise_ip(),
                leg.rtp_port(),
                &[caller_payload, flowpbx_media_core::DTMF_PAYLOAD],
            );
            let request = build_leg_invite(
                target.binding.contact_uri.clone(),
                &self.flow.caller_name,
                &self.flow.caller_num,
                &self.env.media.advertise_ip().to_string(),
                &self.env.contact,
                Bytes::from(offer.to_string()),
            );
            let handle = self.env.transports.udp_handle(target.binding.source);
            legs.push(ClientInvite::new(&self.env.dialog, request, handle));
            leg_ios.push(leg);
        }

        // Relay the first downstream 180 upstream, unless already answered.
        let (ringing_tx, ringing_rx) = oneshot::channel();
        if !self.answered {
            let call = self.call.clone();
            tokio::spawn(async move {
                if ringing_rx.await.is_ok() {
                    let _ = call.ring().await;
                }
            });
        }

        let result = ring_race(legs, ring_timeout, &mut self.cancel, Some(ringing_tx)).await?;

        match result.winner {
            Some((index, dialog, response)) => {
                let leg = leg_ios[index].clone();
                // Commit the winner's media endpoint from its answer SDP.
                if let Ok(text) = std::str::from_utf8(&response.body) {
                    if let Ok(sdp) = text.parse::<SessionDescription>() {
                        if let Some((ip, port)) = sdp.audio_endpoint() {
                            leg.hint_remote(std::net::SocketAddr::new(ip, port));
                        }
                    }
                }
                self.session.promote_fork_leg(&leg);
                self.env.ring_state.record_answer(&targets[index].member);
                self.callee = Some(dialog);
                self.ensure_answered().await?;
                debug!(member = %targets[index].member, "bridged to winning leg");
            }
            None => {
                self.session.clear_fork_legs();
            }
        }
        Ok(result.outcome)
    }

    /// Block while the call is bridged to the answered callee, until either
    /// side hangs up. A callee-side BYE also clears the caller leg.
    pub async fn wait_bridged(&mut self) {
        let (leg_tx, mut leg_rx) = mpsc::channel(1);
        let _leg_guard = self
            .callee
            .as_ref()
            .map(|dialog| self.env.dialog.register_leg(dialog.call_id(), leg_tx));

        let callee_hung_up = loop {
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break false;
                    }
                }
                _ = leg_rx.recv() => break true,
            }
        };
        self.ended = true;
        if callee_hung_up {
            debug!(call_id = %self.record.call_id, "callee hung up, clearing caller");
            let _ = self.call.bye().await;
        }
    }

    /// Start a call recording when the effective policy asks for one.
    pub async fn maybe_start_recording(&mut self, entity_wants_it: bool) -> Result<()> {
        let record = match self.env.config.recording_policy {
            RecordingPolicy::Off => false,
            RecordingPolicy::Always => true,
            RecordingPolicy::FollowEntity => entity_wants_it,
        };
        if !record || self.recorder.is_some() {
            return Ok(());
        }
        let now = chrono::Utc::now();
        let path = self
            .env
            .config
            .recordings_dir()
            .join(now.format("%Y/%m/%d").to_string())
            .join(format!("{}.wav", sanitise_file_name(&self.record.call_id)));
        let recorder = Recorder::create(&path).await?;
        self.session.set_recorder(recorder.handle());
        self.record.recording_file = Some(path);
        self.recorder = Some(recorder);
        Ok(())
    }
}

/// Keep Call-IDs from escaping the recordings directory.
fn sanitise_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_sanitised() {
        assert_eq!(sanitise_file_name("abc-1@host"), "abc-1@host");
        assert_eq!(sanitise_file_name("../../etc/passwd"), ".._.._etc_passwd");
    }
}
