//! Policy durability properties against a failure-injecting sink.

mod support;

use std::sync::Arc;

use quarry_core::{
    BufferedPolicy, FlushMode, IngestionPolicy, MetricsCollector, SharedSink,
};
use quarry_model::{ArtifactChunk, EventType};

use support::{envelope, run_meta, RecordingSink, SinkOp};

fn harness() -> (SharedSink, Arc<std::sync::Mutex<support::RecordingState>>, Arc<MetricsCollector>)
{
    let (sink, state) = RecordingSink::new();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    (sink, state, Arc::new(MetricsCollector::new()))
}

fn chunk(artifact_id: &str, seq: u64, is_last: bool, len: usize) -> ArtifactChunk {
    ArtifactChunk {
        artifact_id: artifact_id.into(),
        seq,
        is_last,
        data: vec![3u8; len],
    }
}

#[tokio::test]
async fn buffered_drop_scenario_keeps_items_and_terminal() {
    // Scenario: max_events=2, at_least_once; log,log,item,log,log,item,run_complete.
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let mut policy =
        BufferedPolicy::new(sink, metrics, Some(2), None, FlushMode::AtLeastOnce);

    policy.ingest_event(envelope(&meta, 1, EventType::Log)).await.expect("log 1");
    policy.ingest_event(envelope(&meta, 2, EventType::Log)).await.expect("log 2");
    policy.ingest_event(envelope(&meta, 3, EventType::Item)).await.expect("item 3");
    policy.ingest_event(envelope(&meta, 4, EventType::Log)).await.expect("log 4");
    policy.ingest_event(envelope(&meta, 5, EventType::Log)).await.expect("log 5");
    policy.ingest_event(envelope(&meta, 6, EventType::Item)).await.expect("item 6");
    policy
        .ingest_event(envelope(&meta, 7, EventType::RunComplete))
        .await
        .expect("run_complete");
    policy.close().await.expect("close");

    let stats = policy.stats();
    // Drops may only ever be keyed under droppable types.
    for key in stats.dropped_by_type.keys() {
        assert_eq!(key, "log", "only logs were droppable in this stream");
    }
    let persisted = state.lock().expect("state").event_seqs();
    assert!(persisted.contains(&3), "items are never dropped");
    assert!(persisted.contains(&6), "items are never dropped");
    assert!(persisted.contains(&7), "the terminal event is never dropped");
    // Persisted order respects seq order.
    let mut sorted = persisted.clone();
    sorted.sort_unstable();
    assert_eq!(persisted, sorted);
    assert_eq!(
        stats.events_received,
        7,
        "every arrival is counted whether or not it persisted"
    );
}

#[tokio::test]
async fn at_least_once_retains_whole_event_batch_across_failed_flush() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let mut policy =
        BufferedPolicy::new(sink, metrics, Some(16), None, FlushMode::AtLeastOnce);

    for seq in 1..=3 {
        policy
            .ingest_event(envelope(&meta, seq, EventType::Item))
            .await
            .expect("ingest");
    }
    state.lock().expect("state").fail_events_at = Some(1);
    assert!(policy.flush().await.is_err(), "first flush fails");
    // Retry drains the retained batch; nothing was lost.
    policy.flush().await.expect("retry succeeds");

    let persisted = state.lock().expect("state").event_seqs();
    assert_eq!(persisted, vec![1, 2, 3]);
    assert_eq!(policy.stats().events_persisted, 3);
}

#[tokio::test]
async fn chunks_first_retains_exactly_the_unwritten_event_suffix() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let mut policy =
        BufferedPolicy::new(sink, metrics, Some(16), None, FlushMode::ChunksFirst);

    for seq in 1..=4 {
        policy
            .ingest_event(envelope(&meta, seq, EventType::Item))
            .await
            .expect("ingest");
    }
    // Per-event writes: fail the third write_events call (event seq 3).
    state.lock().expect("state").fail_events_at = Some(3);
    assert!(policy.flush().await.is_err());
    policy.flush().await.expect("retry");

    let persisted = state.lock().expect("state").event_seqs();
    // No duplicates: 1 and 2 landed once, then 3 and 4 on retry.
    assert_eq!(persisted, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn two_phase_failed_chunk_phase_writes_no_events() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let mut policy =
        BufferedPolicy::new(sink, metrics, Some(16), None, FlushMode::TwoPhase);

    policy.ingest_chunk(chunk("art-1", 1, true, 8)).await.expect("chunk");
    policy
        .ingest_event(envelope(&meta, 1, EventType::Item))
        .await
        .expect("event");

    state.lock().expect("state").fail_chunks_at = Some(1);
    assert!(policy.flush().await.is_err(), "chunk phase fails");
    assert!(
        state.lock().expect("state").event_seqs().is_empty(),
        "no event may precede its artifact chunks"
    );

    policy.flush().await.expect("retry");
    let state = state.lock().expect("state");
    assert_eq!(state.chunk_rows(), vec![("art-1".to_string(), 1, 8)]);
    assert_eq!(state.event_seqs(), vec![1]);
}

#[tokio::test]
async fn retry_after_failure_reissues_the_identical_chunk_batch() {
    // The sink's atomicity contract: a failed batch retried from identical
    // state produces the identical stream of chunk rows, no duplicates.
    let (sink, state, metrics) = harness();
    let mut policy =
        BufferedPolicy::new(sink, metrics, Some(16), None, FlushMode::AtLeastOnce);

    policy.ingest_chunk(chunk("art-1", 1, false, 4)).await.expect("c1");
    policy.ingest_chunk(chunk("art-1", 2, true, 6)).await.expect("c2");

    state.lock().expect("state").fail_chunks_at = Some(1);
    assert!(policy.flush().await.is_err());
    policy.flush().await.expect("retry");

    let rows = state.lock().expect("state").chunk_rows();
    assert_eq!(
        rows,
        vec![("art-1".to_string(), 1, 4), ("art-1".to_string(), 2, 6)],
        "each chunk reaches the sink exactly once"
    );
}

#[tokio::test]
async fn two_phase_event_retry_never_duplicates_landed_events() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let mut policy =
        BufferedPolicy::new(sink, metrics, Some(16), None, FlushMode::TwoPhase);

    for seq in 1..=3 {
        policy
            .ingest_event(envelope(&meta, seq, EventType::Item))
            .await
            .expect("ingest");
    }
    // Per-event writes: fail the second write_events call (event seq 2).
    state.lock().expect("state").fail_events_at = Some(2);
    assert!(policy.flush().await.is_err());
    policy.flush().await.expect("retry");

    let persisted = state.lock().expect("state").event_seqs();
    assert_eq!(
        persisted,
        vec![1, 2, 3],
        "seq 1 landed once; the retry resumed at seq 2"
    );
}

#[tokio::test]
async fn streaming_failed_flush_retains_the_swapped_batch() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let (mut policy, _) = quarry_core::PolicyConfig::Streaming {
        flush_count: None,
        flush_interval: Some(std::time::Duration::from_secs(3600)),
    }
    .build(sink, metrics);

    for seq in 1..=3 {
        policy
            .ingest_event(envelope(&meta, seq, EventType::Item))
            .await
            .expect("ingest");
    }
    state.lock().expect("state").fail_events_at = Some(1);
    assert!(policy.flush().await.is_err(), "first flush fails");

    // Ingest continues after the failure; the retained batch stays ahead.
    policy
        .ingest_event(envelope(&meta, 4, EventType::Item))
        .await
        .expect("ingest after failure");
    policy.close().await.expect("close drains everything");

    let persisted = state.lock().expect("state").event_seqs();
    assert_eq!(persisted, vec![1, 2, 3, 4], "no event was dropped or reordered");
    assert_eq!(policy.stats().events_persisted, 4);
}

#[tokio::test]
async fn streaming_failed_chunk_flush_retains_chunks_and_events() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let (mut policy, _) = quarry_core::PolicyConfig::Streaming {
        flush_count: None,
        flush_interval: Some(std::time::Duration::from_secs(3600)),
    }
    .build(sink, metrics);

    policy.ingest_chunk(chunk("art-1", 1, true, 8)).await.expect("chunk");
    policy
        .ingest_event(envelope(&meta, 1, EventType::Item))
        .await
        .expect("event");

    state.lock().expect("state").fail_chunks_at = Some(1);
    assert!(policy.flush().await.is_err(), "chunk phase fails");
    assert!(
        state.lock().expect("state").event_seqs().is_empty(),
        "no event may precede its artifact chunks"
    );

    policy.close().await.expect("retry drains");
    let state = state.lock().expect("state");
    assert_eq!(state.chunk_rows(), vec![("art-1".to_string(), 1, 8)]);
    assert_eq!(state.event_seqs(), vec![1]);
}

#[tokio::test]
async fn streaming_flushes_never_interleave_seq_ranges() {
    let meta = run_meta();
    let (sink, state, metrics) = harness();
    let (mut policy, _) = quarry_core::PolicyConfig::Streaming {
        flush_count: Some(2),
        flush_interval: None,
    }
    .build(sink, metrics);

    for seq in 1..=9 {
        policy
            .ingest_event(envelope(&meta, seq, EventType::Item))
            .await
            .expect("ingest");
    }
    policy.close().await.expect("close");

    let state = state.lock().expect("state");
    let mut previous_max = 0u64;
    for op in &state.ops {
        if let SinkOp::Events(seqs) = op {
            let min = *seqs.iter().min().expect("non-empty batch");
            let max = *seqs.iter().max().expect("non-empty batch");
            assert!(
                min > previous_max,
                "flush starting at {min} overlaps previous max {previous_max}"
            );
            previous_max = max;
        }
    }
    assert_eq!(previous_max, 9, "everything flushed by close");
}
