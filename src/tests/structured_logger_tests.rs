use super::*;
use crate::session::SessionTag;
use tempfile::TempDir;

fn create_test_journal() -> (SessionJournal, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let journal = SessionJournal::open(temp_dir.path()).expect("Failed to open journal");
    (journal, temp_dir)
}

fn read_entries(dir: &TempDir) -> Vec<JournalEntry> {
    let content = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).expect("Failed to read journal");
    content
        .lines()
        .map(|line| serde_json::from_str(line).expect("Failed to parse journal entry"))
        .collect()
}

#[test]
fn test_entries_share_run_id_and_increase_seq() {
    let (journal, temp_dir) = create_test_journal();

    for i in 0..5 {
        journal.log("Test", json!({"iteration": i}));
    }

    let entries = read_entries(&temp_dir);
    assert_eq!(entries.len(), 5);
    let mut prev_seq = 0;
    for entry in &entries {
        assert!(entry.seq > prev_seq, "Sequence numbers should increase");
        assert_eq!(entry.run_id, journal.run_id());
        prev_seq = entry.seq;
    }
}

#[test]
fn test_lifecycle_events_are_tagged() {
    let (journal, temp_dir) = create_test_journal();
    let key = SessionKey::active(SessionTag(SessionTag::ACTIVE_BIT | 1));

    journal.log_session_created(key, SessionType::SearchIndex, SessionPolicy::Active, NetHandle::INTERNAL);
    journal.log_phase_transition(key, "Consult", "QueryLastCheckpoint");
    journal.log_session_released(key, "timeout");
    journal.log_timer_orphaned(TimerId(4), 1000);
    journal.log_dispatch_failure(NetHandle(3), OpCode::Query, "boom", true);

    let types: Vec<String> = read_entries(&temp_dir)
        .iter()
        .map(|entry| entry.event["type"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        types,
        vec![
            "SessionCreated",
            "PhaseTransition",
            "SessionReleased",
            "TimerOrphaned",
            "DispatchFailure"
        ]
    );
}

#[test]
fn test_timestamp_has_microseconds() {
    let (journal, temp_dir) = create_test_journal();
    journal.log("Test", json!({}));

    let entries = read_entries(&temp_dir);
    let ts = &entries[0].ts;
    assert!(ts.ends_with('Z'));
    let fraction = ts.rsplit('.').next().unwrap_or_default();
    assert_eq!(fraction.len(), 7, "six digits plus the zone marker");
}

#[test]
fn test_reopening_appends() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    {
        let journal = SessionJournal::open(temp_dir.path()).expect("open");
        journal.log("Test", json!({"run": 1}));
    }
    let journal = SessionJournal::open(temp_dir.path()).expect("reopen");
    journal.log("Test", json!({"run": 2}));

    let entries = read_entries(&temp_dir);
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].run_id, entries[1].run_id);
}
