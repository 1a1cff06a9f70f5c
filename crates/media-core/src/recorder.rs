//! Asynchronous WAV recorder
//!
//! The relay pushes decoded PCM frames into a bounded queue; a writer task
//! drains it to disk. The queue never back-pressures the media path: when
//! it is full the frame is dropped and counted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::wav;

/// Frames buffered before the recorder starts dropping.
const QUEUE_CAPACITY: usize = 256;

enum Command {
    Samples(Vec<i16>),
    Finish,
}

/// Handle used by the relay/mixer to feed a recording.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
    path: PathBuf,
}

impl RecorderHandle {
    /// Queue a frame of samples. Never blocks; a full queue increments the
    /// loss counter instead.
    pub fn push(&self, samples: Vec<i16>) {
        if self.tx.try_send(Command::Samples(samples)).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!(path = %self.path.display(), dropped, "recorder queue full, dropping audio");
            }
        }
    }

    /// Frames lost to queue overflow so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A recording in progress.
pub struct Recorder {
    handle: RecorderHandle,
    writer: JoinHandle<Result<u64>>,
}

impl Recorder {
    /// Create the target file (and parent directories) and start the
    /// writer task. The WAV header is patched with final sizes on close.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Recorder> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(&wav::header(0)).await?;

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut data_len: u64 = 0;
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Samples(samples) => {
                        let mut bytes = Vec::with_capacity(samples.len() * 2);
                        for sample in &samples {
                            bytes.extend_from_slice(&sample.to_le_bytes());
                        }
                        file.write_all(&bytes).await?;
                        data_len += bytes.len() as u64;
                    }
                    Command::Finish => break,
                }
            }
            // Patch RIFF and data chunk sizes now that the length is known.
            file.seek(SeekFrom::Start(4)).await?;
            file.write_all(&((36 + data_len) as u32).to_le_bytes()).await?;
            file.seek(SeekFrom::Start(40)).await?;
            file.write_all(&(data_len as u32).to_le_bytes()).await?;
            file.flush().await?;
            debug!(path = %writer_path.display(), data_len, "recording closed");
            Ok(data_len)
        });

        Ok(Recorder {
            handle: RecorderHandle {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                path,
            },
            writer,
        })
    }

    pub fn handle(&self) -> RecorderHandle {
        self.handle.clone()
    }

    /// Stop recording, flush, and return the recorded duration in
    /// milliseconds.
    pub async fn finish(self) -> Result<u64> {
        let _ = self.handle.tx.send(Command::Finish).await;
        let data_len = self
            .writer
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        // PCM16 mono 8 kHz: 16 bytes per millisecond.
        Ok(data_len / 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_patches_header() {
        let dir = std::env::temp_dir().join(format!("flowpbx-rec-{}", uuid::Uuid::new_v4()));
        let path = dir.join("2025/01/15/test-call.wav");

        let recorder = Recorder::create(&path).await.unwrap();
        let handle = recorder.handle();
        let frame: Vec<i16> = (0..160).map(|i| i as i16).collect();
        for _ in 0..5 {
            handle.push(frame.clone());
        }
        let duration_ms = recorder.finish().await.unwrap();
        assert_eq!(duration_ms, 100); // 5 frames of 20 ms

        let bytes = std::fs::read(&path).unwrap();
        let samples = wav::decode(&bytes).unwrap();
        assert_eq!(samples.len(), 800);
        assert_eq!(&samples[..160], frame.as_slice());
        assert_eq!(handle.dropped_frames(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
