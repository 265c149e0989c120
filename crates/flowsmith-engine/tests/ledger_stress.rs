use std::collections::HashSet;
use std::sync::Arc;

use flowsmith_core::event::EventBus;
use flowsmith_core::types::{LogLevel, RunEvent, RunId, RunState};
use flowsmith_engine::RunLedger;

const WRITERS: usize = 8;
const PER_WRITER: usize = 250;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_get_unique_increasing_sequences() {
    let events = Arc::new(EventBus::new(WRITERS * PER_WRITER + 16));
    let mut rx = events.subscribe();
    let state = RunState::new(RunId::new(), "g", vec!["a".to_string()], "x");
    let ledger = Arc::new(RunLedger::new(state, events));

    let mut tasks = Vec::new();
    for w in 0..WRITERS {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            let mut seen = Vec::with_capacity(PER_WRITER);
            for i in 0..PER_WRITER {
                seen.push(ledger.log(Some("a"), LogLevel::Debug, format!("w{} #{}", w, i)));
                if i % 32 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            seen
        }));
    }

    let mut returned = HashSet::new();
    for task in tasks {
        let seen = task.await.unwrap();
        // Each writer observes its own appends in increasing order.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        returned.extend(seen);
    }

    let total = (WRITERS * PER_WRITER) as u64;
    assert_eq!(returned.len() as u64, total);

    let snapshot = ledger.snapshot();
    let sequences: Vec<u64> = snapshot.log.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=total).collect::<Vec<_>>());

    // Subscribers see entries in sequence order.
    let mut published = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::LogAppended { entry, .. } = event {
            published.push(entry.sequence);
        }
    }
    assert_eq!(published, sequences);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshots_taken_during_writes_are_consistent() {
    let events = Arc::new(EventBus::new(1024));
    let state = RunState::new(RunId::new(), "g", vec!["a".to_string()], "x");
    let ledger = Arc::new(RunLedger::new(state, events));

    let writer = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            for i in 0..2000 {
                ledger.log(None, LogLevel::Info, format!("entry {}", i));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    while !writer.is_finished() {
        let snapshot = ledger.snapshot();
        for (i, entry) in snapshot.log.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    assert_eq!(ledger.snapshot().log.len(), 2000);
}
