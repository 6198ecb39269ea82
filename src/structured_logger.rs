//! Structured JSONL journal of session lifecycle events.
//!
//! Each line carries:
//! - a monotonic sequence number for ordering
//! - an ISO 8601 timestamp with microsecond precision
//! - the run id of the node process that wrote it
//! - the emitting component and a JSON event

use crate::session::{NetHandle, SessionKey, SessionPolicy, SessionType};
use crate::timer::TimerId;
use crate::wire::OpCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub const JOURNAL_FILE: &str = "events.jsonl";

pub struct SessionJournal {
    run_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single journal line.
#[derive(Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub ts: String,
    /// Fresh for every process start.
    pub run_id: String,
    pub component: String,
    pub event: Value,
}

impl SessionJournal {
    /// Opens `<dir>/events.jsonl` for appending, creating `dir` if needed.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Appends one event. Write failures are dropped.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let entry = JournalEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            run_id: self.run_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    pub fn log_session_created(
        &self,
        key: SessionKey,
        session_type: SessionType,
        policy: SessionPolicy,
        owner: NetHandle,
    ) {
        self.log(
            "Registry",
            json!({
                "type": "SessionCreated",
                "session": key.to_string(),
                "session_type": session_type,
                "policy": policy,
                "owner": owner,
            }),
        );
    }

    pub fn log_session_released(&self, key: SessionKey, reason: &str) {
        self.log(
            "Registry",
            json!({
                "type": "SessionReleased",
                "session": key.to_string(),
                "reason": reason,
            }),
        );
    }

    pub fn log_phase_transition(&self, key: SessionKey, from: &str, to: &str) {
        self.log(
            "IndexSession",
            json!({
                "type": "PhaseTransition",
                "session": key.to_string(),
                "from": from,
                "to": to,
            }),
        );
    }

    pub fn log_dispatch_failure(&self, handle: NetHandle, op_code: OpCode, error: &str, fatal: bool) {
        self.log(
            "Dispatcher",
            json!({
                "type": "DispatchFailure",
                "handle": handle,
                "op_code": op_code.code(),
                "error": error,
                "fatal": fatal,
            }),
        );
    }

    pub fn log_timer_orphaned(&self, timer_id: TimerId, interval_ms: u32) {
        self.log(
            "Timer",
            json!({
                "type": "TimerOrphaned",
                "timer_id": timer_id,
                "interval_ms": interval_ms,
            }),
        );
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod structured_logger_tests;
