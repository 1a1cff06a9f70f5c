//! Retention cleanup scans
//!
//! A daily task walks the recordings and voicemail trees and deletes WAV
//! files older than the configured retention. A retention of 0 days
//! disables the scan for that tree.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::config::Config;

const SCAN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the periodic cleanup task.
pub fn spawn(config: Arc<Config>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            run_once(&config).await;
        }
    })
}

/// One full pass over both trees.
pub async fn run_once(config: &Config) {
    if config.recording_retention_days > 0 {
        let removed = sweep(
            &config.recordings_dir(),
            age_cutoff(config.recording_retention_days),
        )
        .await;
        if removed > 0 {
            info!(removed, "recording retention sweep done");
        }
    }
    if config.voicemail_retention_days > 0 {
        let removed = sweep(
            &config.voicemail_dir(),
            age_cutoff(config.voicemail_retention_days),
        )
        .await;
        if removed > 0 {
            info!(removed, "voicemail retention sweep done");
        }
    }
}

fn age_cutoff(days: u32) -> SystemTime {
    SystemTime::now() - Duration::from_secs(u64::from(days) * 24 * 60 * 60)
}

/// Recursively delete WAV files modified before `cutoff`. Returns the
/// number removed. Empty date directories are pruned on the way out.
async fn sweep(root: &Path, cutoff: SystemTime) -> usize {
    let mut removed = 0;
    let mut stack = vec![root.to_path_buf()];
    let mut visited_dirs = Vec::new();

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        visited_dirs.push(dir);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().map(|e| e != "wav").unwrap_or(true) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "expired media file removed");
                        removed += 1;
                    }
                    Err(err) => warn!(path = %path.display(), %err, "could not remove file"),
                }
            }
        }
    }

    // Deepest directories first.
    visited_dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in visited_dirs {
        if dir != root {
            let _ = tokio::fs::remove_dir(&dir).await; // fails unless empty
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_only_expired_wavs() {
        let root = std::env::temp_dir().join(format!("flowpbx-clean-{}", uuid::Uuid::new_v4()));
        let day_dir = root.join("2020/01/01");
        std::fs::create_dir_all(&day_dir).unwrap();
        let old_wav = day_dir.join("old.wav");
        let keep_txt = day_dir.join("notes.txt");
        std::fs::write(&old_wav, b"RIFF").unwrap();
        std::fs::write(&keep_txt, b"keep").unwrap();

        // Cutoff in the future: everything counts as expired.
        let removed = sweep(&root, SystemTime::now() + Duration::from_secs(60)).await;
        assert_eq!(removed, 1);
        assert!(!old_wav.exists());
        assert!(keep_txt.exists());

        // Cutoff far in the past removes nothing.
        std::fs::write(&old_wav, b"RIFF").unwrap();
        let removed = sweep(&root, SystemTime::now() - Duration::from_secs(3600)).await;
        assert_eq!(removed, 0);
        assert!(old_wav.exists());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
