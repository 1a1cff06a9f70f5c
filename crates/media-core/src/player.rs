//! Prompt playback
//!
//! Streams PCM onto a leg at the 20 ms frame clock. Playback is
//! cancellable between frames, so a caller hangup stops the audio within
//! one tick.

use std::path::Path;

use tokio::sync::watch;
use tracing::debug;

use crate::error::Result;
use crate::rtp::{FRAME_DURATION, FRAME_SAMPLES};
use crate::session::RtpStreamer;
use crate::wav;

/// How a playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Completed,
    Cancelled,
}

/// Load a prompt WAV from disk into PCM.
pub async fn load_prompt(path: impl AsRef<Path>) -> Result<Vec<i16>> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    wav::decode(&bytes)
}

/// `duration_ms` of silence, for record-beep gaps and missing prompts.
pub fn silence(duration_ms: u64) -> Vec<i16> {
    vec![0i16; (duration_ms as usize * FRAME_SAMPLES) / 20]
}

/// A short sine beep, used before voicemail recording and as the
/// conference join announcement.
pub fn tone(frequency_hz: f32, duration_ms: u64, amplitude: i16) -> Vec<i16> {
    let samples = (duration_ms as usize * FRAME_SAMPLES) / 20;
    (0..samples)
        .map(|i| {
            let t = i as f32 / wav::SAMPLE_RATE as f32;
            (amplitude as f32 * (2.0 * std::f32::consts::PI * frequency_hz * t).sin()) as i16
        })
        .collect()
}

/// Play samples to a leg, frame-clocked, until done or cancelled.
///
/// `cancel` is the call's hangup signal: any observed `true` stops playback
/// before the next frame.
pub async fn play(
    streamer: &mut RtpStreamer,
    samples: &[i16],
    cancel: &mut watch::Receiver<bool>,
) -> Result<PlayOutcome> {
    if *cancel.borrow() {
        return Ok(PlayOutcome::Cancelled);
    }
    let mut tick = tokio::time::interval(FRAME_DURATION);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    let mut frame = [0i16; FRAME_SAMPLES];
    for chunk in samples.chunks(FRAME_SAMPLES) {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                // A dropped sender means the call is being torn down.
                if changed.is_err() || *cancel.borrow() {
                    debug!("playback cancelled");
                    return Ok(PlayOutcome::Cancelled);
                }
            }
            _ = tick.tick() => {}
        }
        // Zero-pad the trailing partial frame.
        frame[..chunk.len()].copy_from_slice(chunk);
        frame[chunk.len()..].fill(0);
        streamer.send_frame(&frame).await?;
    }
    Ok(PlayOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortPool;
    use crate::session::MediaEngine;

    #[test]
    fn tone_and_silence_sizes() {
        assert_eq!(silence(100).len(), 800);
        let beep = tone(440.0, 200, 8_000);
        assert_eq!(beep.len(), 1600);
        assert!(beep.iter().any(|&s| s > 4_000));
        assert!(beep.iter().any(|&s| s < -4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_within_a_frame() {
        let engine = MediaEngine::new(
            PortPool::new("127.0.0.1".parse().unwrap(), 42_000, 42_020),
            "127.0.0.1".parse().unwrap(),
        );
        let session = engine.create_session(8).await.unwrap();
        let mut streamer = session.streamer_for(session.caller_leg()).unwrap();

        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
        let samples = silence(10_000);

        let play_task = tokio::spawn(async move {
            play(&mut streamer, &samples, &mut cancel_rx).await.unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();
        assert_eq!(play_task.await.unwrap(), PlayOutcome::Cancelled);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn playback_completes() {
        let engine = MediaEngine::new(
            PortPool::new("127.0.0.1".parse().unwrap(), 42_030, 42_050),
            "127.0.0.1".parse().unwrap(),
        );
        let session = engine.create_session(0).await.unwrap();
        let mut streamer = session.streamer_for(session.caller_leg()).unwrap();
        let (_cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

        // 5 frames, unlearned remote: frames are generated and skipped.
        let outcome = play(&mut streamer, &silence(100), &mut cancel_rx)
            .await
            .unwrap();
        assert_eq!(outcome, PlayOutcome::Completed);
        session.shutdown().await;
    }
}
