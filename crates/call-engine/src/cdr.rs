//! Call detail records

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Final classification of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    Voicemail,
}

/// Call direction as seen by the PBX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Internal,
}

/// One call's record. Opened at INVITE arrival, answered at 200, closed at
/// teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub direction: Direction,
    pub caller_id_name: String,
    pub caller_id_num: String,
    pub callee: String,
    /// Trunk the call arrived on, for inbound calls.
    pub trunk_id: Option<u64>,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Start to end.
    pub duration_secs: u64,
    /// Answer to end; what gets billed.
    pub billable_secs: u64,
    pub disposition: Disposition,
    pub hangup_cause: String,
    pub recording_file: Option<PathBuf>,
    /// Node ids the flow engine traversed, in order.
    pub flow_path: Vec<String>,
}

impl CallRecord {
    pub fn open(
        call_id: impl Into<String>,
        direction: Direction,
        caller_id_name: impl Into<String>,
        caller_id_num: impl Into<String>,
        callee: impl Into<String>,
        trunk_id: Option<u64>,
    ) -> Self {
        CallRecord {
            call_id: call_id.into(),
            direction,
            caller_id_name: caller_id_name.into(),
            caller_id_num: caller_id_num.into(),
            callee: callee.into(),
            trunk_id,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration_secs: 0,
            billable_secs: 0,
            disposition: Disposition::Failed,
            hangup_cause: String::new(),
            recording_file: None,
            flow_path: Vec::new(),
        }
    }

    pub fn mark_answered(&mut self) {
        if self.answer_time.is_none() {
            self.answer_time = Some(Utc::now());
        }
    }

    /// Fill the teardown fields. Idempotent on the end time.
    pub fn close(&mut self, disposition: Disposition, cause: impl Into<String>) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_secs = (end - self.start_time).num_seconds().max(0) as u64;
        self.billable_secs = self
            .answer_time
            .map(|answered| (end - answered).num_seconds().max(0) as u64)
            .unwrap_or(0);
        self.disposition = disposition;
        self.hangup_cause = cause.into();
    }
}

/// Persistence contract for call records, owned by the repository layer.
#[async_trait]
pub trait CdrSink: Send + Sync {
    async fn write(&self, record: &CallRecord) -> anyhow::Result<()>;
}

/// Fire-and-forget write with bounded retry. The call path never waits on
/// persistence.
pub fn write_record(sink: Arc<dyn CdrSink>, record: CallRecord) {
    tokio::spawn(async move {
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=3 {
            match sink.write(&record).await {
                Ok(()) => {
                    debug!(call_id = %record.call_id, "call record written");
                    return;
                }
                Err(err) if attempt < 3 => {
                    warn!(call_id = %record.call_id, %err, attempt, "record write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    warn!(call_id = %record.call_id, %err, "record write abandoned");
                }
            }
        }
    });
}

/// Default sink: JSON lines under `<data>/cdr/YYYY-MM.jsonl`.
pub struct JsonlCdrSink {
    dir: PathBuf,
}

impl JsonlCdrSink {
    pub fn new(data_dir: &std::path::Path) -> Self {
        JsonlCdrSink {
            dir: data_dir.join("cdr"),
        }
    }
}

#[async_trait]
impl CdrSink for JsonlCdrSink {
    async fn write(&self, record: &CallRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let file_name = format!("{}.jsonl", record.start_time.format("%Y-%m"));
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file_name))
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_computes_durations() {
        let mut record = CallRecord::open(
            "c1",
            Direction::Inbound,
            "Alice",
            "0255501234",
            "100",
            Some(1),
        );
        record.mark_answered();
        record.close(Disposition::Answered, "normal clearing");
        assert!(record.end_time.is_some());
        assert_eq!(record.disposition, Disposition::Answered);
        assert!(record.billable_secs <= record.duration_secs);
    }

    #[test]
    fn unanswered_call_has_no_billable_time() {
        let mut record =
            CallRecord::open("c2", Direction::Internal, "", "201", "202", None);
        record.close(Disposition::NoAnswer, "no answer");
        assert_eq!(record.billable_secs, 0);
        assert_eq!(record.answer_time, None);
    }

    #[tokio::test]
    async fn jsonl_sink_appends() {
        let dir = std::env::temp_dir().join(format!("flowpbx-cdr-{}", uuid::Uuid::new_v4()));
        let sink = JsonlCdrSink::new(&dir);
        let mut record =
            CallRecord::open("c3", Direction::Inbound, "A", "1", "100", None);
        record.flow_path = vec!["in".into(), "vm".into()];
        record.close(Disposition::Voicemail, "normal clearing");
        sink.write(&record).await.unwrap();
        sink.write(&record).await.unwrap();

        let month = record.start_time.format("%Y-%m");
        let written =
            std::fs::read_to_string(dir.join("cdr").join(format!("{month}.jsonl"))).unwrap();
        assert_eq!(written.lines().count(), 2);
        let parsed: CallRecord = serde_json::from_str(written.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.flow_path, vec!["in", "vm"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
