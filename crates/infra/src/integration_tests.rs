//! Integration tests for the full history store.
//!
//! Tests: append → KV log → resolver → snapshot / cache → projector
//!
//! Verifies:
//! - Replay is deterministic and snapshot baselines do not change the result
//! - Branches are isolated from their parent in both directions
//! - Rewind never destroys history and can be undone by a later rewind
//! - Stale heads are rejected without touching the log
//! - Cold reconstruction after a snapshot only scans the events after it

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use runlog_core::{AggregateId, Seq};
    use runlog_pipeline::{
        LlmResponse, PipelineEvent, PipelineStarted, PipelineState, PipelineStatus, ResponseReceived,
        ResponseSelected, RewindMarker, StepCompleted, StepStarted, StepStatus,
    };

    use crate::event_store::{ScanRange, StoredEvent};
    use crate::history::{CancelToken, HistoryStore};
    use crate::kv::{InMemoryKv, KvEngine, KvPair, StorageError, WriteTxn};
    use crate::{HistoryConfig, HistoryError, keys};

    const PLAN: [&str; 4] = ["angles", "outline", "draft", "polish"];

    fn at(n: u64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + n as i64, 0).unwrap()
    }

    fn started(n: u64) -> PipelineEvent {
        PipelineEvent::PipelineStarted(PipelineStarted {
            pipeline: "article".into(),
            steps: PLAN.iter().map(|s| s.to_string()).collect(),
            input: serde_json::json!({"topic": "tides"}),
            occurred_at: at(n),
        })
    }

    fn step_started(step: &str, n: u64) -> PipelineEvent {
        PipelineEvent::StepStarted(StepStarted {
            step: step.into(),
            occurred_at: at(n),
        })
    }

    fn response(step: &str, n: u64) -> PipelineEvent {
        PipelineEvent::ResponseReceived(ResponseReceived {
            step: step.into(),
            response: LlmResponse {
                model: "m-1".into(),
                provider: "p".into(),
                prompt: format!("write the {step}"),
                raw_output: format!("{step} take {n}"),
                usage: serde_json::json!({"output_tokens": n}),
                timing: serde_json::Value::Null,
            },
            occurred_at: at(n),
        })
    }

    fn step_completed(step: &str, n: u64) -> PipelineEvent {
        PipelineEvent::StepCompleted(StepCompleted {
            step: step.into(),
            output: Some(serde_json::json!(format!("{step} done"))),
            occurred_at: at(n),
        })
    }

    /// Ten events whose seqs 3, 5, 8 and 10 complete a step:
    /// started, angles s/c, outline s/c, draft s/r/c, polish s/c.
    fn ten_events() -> Vec<PipelineEvent> {
        vec![
            started(1),
            step_started("angles", 2),
            step_completed("angles", 3),
            step_started("outline", 4),
            step_completed("outline", 5),
            step_started("draft", 6),
            response("draft", 7),
            step_completed("draft", 8),
            step_started("polish", 9),
            step_completed("polish", 10),
        ]
    }

    /// Started, then every plan step started, answered `n` times and completed.
    fn history_with_responses(responses: &[usize]) -> Vec<PipelineEvent> {
        let mut n = 1;
        let mut events = vec![started(n)];
        for (step, count) in PLAN.iter().zip(responses) {
            n += 1;
            events.push(step_started(step, n));
            for _ in 0..*count {
                n += 1;
                events.push(response(step, n));
            }
            n += 1;
            events.push(step_completed(step, n));
        }
        events
    }

    fn quiet_config() -> HistoryConfig {
        HistoryConfig {
            background_snapshots: false,
            ..HistoryConfig::default()
        }
    }

    fn store_on(kv: Arc<dyn KvEngine>) -> HistoryStore {
        HistoryStore::builder(kv).config(quiet_config()).build().unwrap()
    }

    fn setup() -> (Arc<InMemoryKv>, HistoryStore) {
        runlog_observability::init_for_tests();
        let kv = Arc::new(InMemoryKv::new());
        let store = store_on(kv.clone());
        (kv, store)
    }

    /// Append in order, each against the head returned by the previous append.
    fn append_all(store: &HistoryStore, id: AggregateId, events: &[PipelineEvent]) -> Seq {
        let mut head = store.head(id).unwrap();
        for event in events {
            head = store.append_event(id, head, event.clone()).unwrap();
        }
        head
    }

    fn raw_log(store: &HistoryStore, id: AggregateId) -> Vec<StoredEvent> {
        store.scan(id, 1).map(Result::unwrap).collect()
    }

    fn assert_same_progress(a: &PipelineState, b: &PipelineState) {
        assert_eq!(a.status(), b.status());
        assert_eq!(a.plan(), b.plan());
        assert_eq!(a.current_step(), b.current_step());
        assert_eq!(a.steps(), b.steps());
    }

    /// Poll `check` until it holds or `timeout` elapses.
    fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        check()
    }

    #[test]
    fn scenario_a_started_then_step_started() {
        let (_, store) = setup();
        let run = AggregateId::new();

        append_all(&store, run, &[started(1), step_started("angles", 2)]);

        let state = store.reconstruct(run).unwrap();
        assert_eq!(state.current_step(), Some("angles"));
        assert_eq!(state.status(), PipelineStatus::Running);
    }

    #[test]
    fn independent_reconstructions_are_identical() {
        let (kv, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events());

        let warm = store.reconstruct(id).unwrap();
        let cold_a = store_on(kv.clone()).reconstruct(id).unwrap();
        let cold_b = store_on(kv).reconstruct(id).unwrap();

        assert_eq!(*cold_a, *cold_b);
        assert_eq!(*warm, *cold_a);
    }

    #[test]
    fn second_reconstruct_is_served_from_the_cache() {
        let (kv, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events());

        let cold = store_on(kv);
        cold.reconstruct(id).unwrap();
        cold.reconstruct(id).unwrap();

        let stats = cold.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.events_replayed, 10);
    }

    #[test]
    fn appends_keep_the_cache_warm() {
        let (_, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events());

        let state = store.reconstruct(id).unwrap();

        let stats = store.stats();
        assert_eq!(stats.cache_misses, 0);
        assert_eq!(stats.events_replayed, 0);
        assert_eq!(runlog_core::AggregateRoot::version(&*state), 10);
    }

    #[test]
    fn branch_is_isolated_from_its_parent() {
        let (_, store) = setup();
        let parent = AggregateId::new();
        let events = ten_events();
        append_all(&store, parent, &events);

        let child = store.create_branch(parent, 5, "alt").unwrap();

        let reference = AggregateId::new();
        append_all(&store, reference, &events[..5]);
        let child_state = store.reconstruct(child).unwrap();
        assert_same_progress(&child_state, &store.reconstruct(reference).unwrap());
        let lineage = child_state.lineage().unwrap();
        assert_eq!((lineage.parent_id, lineage.branch_point_seq), (parent, 5));

        // Appending to the parent never shows up in the child...
        let parent_before = store.reconstruct(parent).unwrap();
        append_all(&store, parent, &[step_started("polish", 11)]);
        assert_eq!(*store.reconstruct(child).unwrap(), *child_state);

        // ...and vice versa.
        let parent_after = store.reconstruct(parent).unwrap();
        assert_ne!(*parent_after, *parent_before);
        append_all(&store, child, &[step_started("draft", 12)]);
        assert_eq!(*store.reconstruct(parent).unwrap(), *parent_after);
        assert_eq!(store.head(parent).unwrap(), 11);
    }

    #[test]
    fn rewind_is_non_destructive_and_reversible() {
        let (_, store) = setup();
        let id = AggregateId::new();
        let events = ten_events();
        append_all(&store, id, &events);
        let log_before = raw_log(&store, id);
        let state_at_10 = store.reconstruct(id).unwrap();

        let ack = store.rewind(id, 5).unwrap();
        assert_eq!((ack.marker_seq, ack.horizon_seq), (11, 5));

        let log_after = raw_log(&store, id);
        assert_eq!(log_after.len(), 11);
        assert_eq!(log_after[..10], log_before[..]);

        let reference = AggregateId::new();
        append_all(&store, reference, &events[..5]);
        assert_same_progress(&store.reconstruct(id).unwrap(), &store.reconstruct(reference).unwrap());

        store.rewind(id, 10).unwrap();
        assert_eq!(*store.reconstruct(id).unwrap(), *state_at_10);
        assert_eq!(raw_log(&store, id).len(), 12);
    }

    #[test]
    fn stale_expected_seq_is_rejected_without_mutation() {
        let (_, store) = setup();
        let id = AggregateId::new();
        let events = ten_events();
        append_all(&store, id, &events[..3]);
        let log_before = raw_log(&store, id);

        for stale in [0, 1, 2, 4] {
            let err = store.append_event(id, stale, events[3].clone()).unwrap_err();
            assert!(
                matches!(err, HistoryError::ConcurrentAppendConflict { actual: 3, .. }),
                "expected_seq {stale}: {err:?}"
            );
            assert!(err.is_retryable());
        }

        assert_eq!(raw_log(&store, id), log_before);
        assert_eq!(store.stats().conflicts, 4);
    }

    #[test]
    fn scenario_b_branch_after_angles() {
        let (_, store) = setup();
        let run = AggregateId::new();
        append_all(
            &store,
            run,
            &[
                started(1),
                step_started("angles", 2),
                step_completed("angles", 3),
                step_started("outline", 4),
            ],
        );

        let child = store.create_branch(run, 3, "alt").unwrap();
        let child_state = store.reconstruct(child).unwrap();
        assert_eq!(child_state.current_step(), Some("outline"));
        assert_eq!(child_state.step_status("outline"), StepStatus::Pending);

        append_all(&store, run, &[step_completed("outline", 5)]);

        assert_eq!(
            store.reconstruct(run).unwrap().step_status("outline"),
            StepStatus::Completed
        );
        assert_eq!(*store.reconstruct(child).unwrap(), *child_state);

        assert_eq!(store.parent_of(child).unwrap().unwrap().name, "alt");
        let tree = store.get_branch_tree(run).unwrap();
        assert_eq!(tree[&run], vec![child]);
        assert!(tree[&child].is_empty());
    }

    #[test]
    fn scenario_c_rewind_after_angles() {
        let (_, store) = setup();
        let run = AggregateId::new();
        append_all(&store, run, &history_with_responses(&[0, 0, 0, 0]));
        let before = store.reconstruct(run).unwrap();
        assert_eq!(before.step_status("polish"), StepStatus::Completed);

        // Seq 3 completes angles.
        store.rewind(run, 3).unwrap();

        let state = store.reconstruct(run).unwrap();
        assert_eq!(state.current_step(), Some("outline"));
        assert_eq!(state.step_status("angles"), StepStatus::Completed);
        for step in ["outline", "draft", "polish"] {
            assert_eq!(state.step_status(step), StepStatus::Pending);
            assert!(state.step(step).is_none());
        }
    }

    #[test]
    fn rewound_run_can_continue_and_branch() {
        let (_, store) = setup();
        let run = AggregateId::new();
        append_all(&store, run, &ten_events());
        let ack = store.rewind(run, 3).unwrap();

        let head = append_all(&store, run, &[step_started("outline", 20), response("outline", 21)]);
        assert_eq!(head, ack.marker_seq + 2);

        let state = store.reconstruct(run).unwrap();
        assert_eq!(state.current_step(), Some("outline"));
        assert_eq!(state.step("outline").unwrap().responses.len(), 1);
        assert_eq!(state.step("outline").unwrap().attempts, 1);

        // The rewound-away range cannot be a branch point, the continuation can.
        assert!(matches!(
            store.create_branch(run, 6, "old"),
            Err(HistoryError::InvalidBranchPoint { .. })
        ));
        let child = store.create_branch(run, head, "continued").unwrap();
        assert_same_progress(&store.reconstruct(child).unwrap(), &state);
    }

    #[test]
    fn scenario_d_cold_replay_scans_only_after_the_snapshot() {
        let (kv, store) = setup();
        let run = AggregateId::new();
        append_all(&store, run, &ten_events());
        let snapshot = store.snapshot_now(run).unwrap();
        assert_eq!(snapshot.through_seq, 10);

        // Regenerate polish: five more events.
        append_all(
            &store,
            run,
            &[
                step_started("polish", 11),
                response("polish", 12),
                response("polish", 13),
                PipelineEvent::ResponseSelected(ResponseSelected {
                    step: "polish".into(),
                    index: 1,
                    occurred_at: at(14),
                }),
                step_completed("polish", 15),
            ],
        );
        let expected = store.reconstruct(run).unwrap();

        let ranges: Arc<Mutex<Vec<ScanRange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = ranges.clone();
        let cold = HistoryStore::builder(kv)
            .config(quiet_config())
            .scan_observer(Arc::new(move |r: &ScanRange| sink.lock().unwrap().push(*r)))
            .build()
            .unwrap();

        let state = cold.reconstruct(run).unwrap();

        assert_eq!(*state, *expected);
        let ranges = ranges.lock().unwrap();
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].from, 11);
        assert!(ranges.iter().all(|r| r.from >= 11), "{ranges:?}");
        assert_eq!(cold.stats().events_replayed, 5);
    }

    #[test]
    fn reserved_events_cannot_be_appended_directly() {
        let (_, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events()[..3]);

        let marker = PipelineEvent::RewindMarker(RewindMarker {
            horizon_seq: 1,
            occurred_at: at(4),
        });
        let err = store.append_event(id, 3, marker).unwrap_err();

        assert!(matches!(err, HistoryError::InvalidEvent(_)));
        assert_eq!(store.head(id).unwrap(), 3);
    }

    #[test]
    fn starting_twice_is_already_started() {
        let (_, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &[started(1)]);

        let err = store.append_event(id, 1, started(2)).unwrap_err();

        assert!(matches!(err, HistoryError::AlreadyStarted { aggregate_id } if aggregate_id == id));
        assert!(!err.is_retryable());
        assert_eq!(store.head(id).unwrap(), 1);
    }

    #[test]
    fn invalid_transition_is_refused_before_append() {
        let (_, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &[started(1)]);

        let err = store.append_event(id, 1, response("angles", 2)).unwrap_err();

        assert!(matches!(err, HistoryError::Domain(_)));
        assert_eq!(store.head(id).unwrap(), 1);
    }

    #[test]
    fn unknown_aggregate_is_not_found() {
        let (_, store) = setup();
        let id = AggregateId::new();
        assert!(matches!(store.reconstruct(id), Err(HistoryError::NotFound(_))));
        assert!(matches!(store.rewind(id, 1), Err(HistoryError::NotFound(_))));
        assert_eq!(store.head(id).unwrap(), 0);
    }

    #[test]
    fn tampered_snapshot_is_ignored() {
        let (kv, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events());
        store.snapshot_now(id).unwrap();
        let expected = store.reconstruct(id).unwrap();

        let key = keys::snapshot(id, 10);
        let mut record: serde_json::Value = serde_json::from_slice(&kv.get(&key).unwrap().unwrap()).unwrap();
        record["state"] = serde_json::json!(record["state"].as_str().unwrap().replace("angles", "angels"));
        let mut txn = kv.begin_write().unwrap();
        txn.put(key, serde_json::to_vec(&record).unwrap());
        txn.commit().unwrap();

        let cold = store_on(kv);
        assert_eq!(*cold.reconstruct(id).unwrap(), *expected);
        let stats = cold.stats();
        assert_eq!(stats.snapshots_rejected, 1);
        assert_eq!(stats.events_replayed, 10);
    }

    #[test]
    fn racing_appends_at_the_same_head_have_one_winner() {
        let (_, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &[started(1), step_started("angles", 2)]);

        for round in 0..20u64 {
            let head = store.head(id).unwrap();
            let event = response("angles", round);
            let barrier = std::sync::Barrier::new(4);
            let results: Vec<_> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            store.append_event(id, head, event.clone())
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1, "round {round}: {results:?}");
            for result in &results {
                match result {
                    Ok(seq) => assert_eq!(*seq, head + 1),
                    Err(err) => assert!(matches!(err, HistoryError::ConcurrentAppendConflict { .. }), "{err:?}"),
                }
            }
        }

        assert_eq!(store.head(id).unwrap(), 22);
        assert_eq!(raw_log(&store, id).len(), 22);
    }

    #[test]
    fn corrupt_snapshot_is_replaced_on_the_next_commit() {
        let (kv, store) = setup();
        let id = AggregateId::new();
        let events = ten_events();
        append_all(&store, id, &events[..9]);
        store.snapshot_now(id).unwrap();

        let key = keys::snapshot(id, 9);
        let mut record: serde_json::Value = serde_json::from_slice(&kv.get(&key).unwrap().unwrap()).unwrap();
        record["checksum"] = serde_json::json!("00");
        let mut txn = kv.begin_write().unwrap();
        txn.put(key, serde_json::to_vec(&record).unwrap());
        txn.commit().unwrap();

        append_all(&store, id, &events[9..]);
        assert!(store.should_snapshot(id).unwrap());

        store.snapshot_now(id).unwrap();
        assert!(!store.should_snapshot(id).unwrap());
        let cold = store_on(kv);
        cold.reconstruct(id).unwrap();
        assert_eq!(cold.stats().events_replayed, 0);
        assert_eq!(cold.stats().snapshots_rejected, 0);
    }

    #[test]
    fn snapshot_rewound_out_of_view_is_not_used() {
        let (kv, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events());
        store.snapshot_now(id).unwrap();
        store.rewind(id, 5).unwrap();
        let expected = store.reconstruct(id).unwrap();

        let cold = store_on(kv);
        assert_eq!(*cold.reconstruct(id).unwrap(), *expected);
        assert_eq!(cold.stats().events_replayed, 6);
        assert_eq!(expected.current_step(), Some("draft"));
    }

    #[test]
    fn background_worker_snapshots_after_enough_events() {
        runlog_observability::init_for_tests();
        let kv = Arc::new(InMemoryKv::new());
        let store = HistoryStore::builder(kv.clone()).build().unwrap();
        let id = AggregateId::new();

        append_all(&store, id, &ten_events()[..9]);
        assert!(!store.should_snapshot(id).unwrap());
        append_all(&store, id, &ten_events()[9..]);

        let written = wait_for(Duration::from_secs(5), || store.stats().snapshots_written >= 1);
        assert!(written, "no snapshot written in time");
        assert!(kv.get(&keys::snapshot(id, 10)).unwrap().is_some());
        assert!(!store.should_snapshot(id).unwrap());
    }

    #[test]
    fn cancelled_replay_returns_cancelled_and_writes_nothing() {
        let (kv, store) = setup();
        let id = AggregateId::new();
        append_all(&store, id, &ten_events());
        let keys_before = kv.len();

        let cold = store_on(kv.clone());
        let token = CancelToken::new();
        token.cancel();

        assert!(matches!(
            cold.reconstruct_cancellable(id, &token),
            Err(HistoryError::Cancelled)
        ));
        assert_eq!(kv.len(), keys_before);
        assert!(cold.reconstruct(id).is_ok());
    }

    #[test]
    fn commit_notifications_follow_commits() {
        let (_, store) = setup();
        let sub = store.subscribe();
        let id = AggregateId::new();

        append_all(&store, id, &ten_events()[..3]);
        store.rewind(id, 3).unwrap();

        let seqs: Vec<Seq> = (0..4)
            .map(|_| sub.recv_timeout(Duration::from_secs(1)).unwrap().sequence_number())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn unread_subscription_stays_bounded() {
        runlog_observability::init_for_tests();
        let store = HistoryStore::builder(Arc::new(InMemoryKv::new()))
            .config(quiet_config())
            .bus(Arc::new(crate::CommitBus::with_capacity(2)))
            .build()
            .unwrap();
        let sub = store.subscribe();
        let id = AggregateId::new();

        assert_eq!(append_all(&store, id, &ten_events()[..5]), 5);

        assert_eq!(sub.try_recv().unwrap().sequence_number(), 1);
        assert_eq!(sub.try_recv().unwrap().sequence_number(), 2);
        assert!(sub.try_recv().is_err());
    }

    /// KV engine whose commits can be made to fail.
    struct FailingKv {
        inner: InMemoryKv,
        fail_commits: AtomicBool,
    }

    struct FailingTxn<'a> {
        txn: Box<dyn WriteTxn + 'a>,
        fail: bool,
    }

    impl KvEngine for FailingKv {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }

        fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError> {
            self.inner.scan(start, end, limit)
        }

        fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>, StorageError> {
            Ok(Box::new(FailingTxn {
                txn: self.inner.begin_write()?,
                fail: self.fail_commits.load(Ordering::SeqCst),
            }))
        }
    }

    impl WriteTxn for FailingTxn<'_> {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.txn.get(key)
        }

        fn scan(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KvPair>, StorageError> {
            self.txn.scan(start, end, limit)
        }

        fn put(&mut self, key: String, value: Vec<u8>) {
            self.txn.put(key, value);
        }

        fn commit(self: Box<Self>) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Unavailable("disk full".to_string()));
            }
            self.txn.commit()
        }
    }

    #[test]
    fn failed_commit_leaves_the_stream_unchanged() {
        runlog_observability::init_for_tests();
        let kv = Arc::new(FailingKv {
            inner: InMemoryKv::new(),
            fail_commits: AtomicBool::new(false),
        });
        let store = store_on(kv.clone());
        let id = AggregateId::new();
        let events = ten_events();
        append_all(&store, id, &events[..3]);
        let before = store.reconstruct(id).unwrap();

        kv.fail_commits.store(true, Ordering::SeqCst);
        let err = store.append_event(id, 3, events[3].clone()).unwrap_err();
        assert!(matches!(err, HistoryError::Storage(StorageError::Unavailable(_))));
        assert!(matches!(store.rewind(id, 3), Err(HistoryError::Storage(_))));
        assert!(matches!(store.create_branch(id, 3, "alt"), Err(HistoryError::Storage(_))));

        assert_eq!(store.head(id).unwrap(), 3);
        assert_eq!(*store.reconstruct(id).unwrap(), *before);
        assert!(store.get_branch_tree(id).unwrap()[&id].is_empty());

        kv.fail_commits.store(false, Ordering::SeqCst);
        assert_eq!(store.append_event(id, 3, events[3].clone()).unwrap(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: a snapshot baseline plus the events after it gives the same state
        /// as a replay from genesis.
        #[test]
        fn snapshot_baseline_replays_to_the_same_state(
            responses in prop::collection::vec(0usize..3, 4),
            cut in any::<prop::sample::Index>(),
        ) {
            let events = history_with_responses(&responses);
            let cut = cut.index(events.len()) + 1;
            let id = AggregateId::new();

            let plain = store_on(Arc::new(InMemoryKv::new()));
            append_all(&plain, id, &events);

            let kv = Arc::new(InMemoryKv::new());
            let snapshotted = store_on(kv.clone());
            append_all(&snapshotted, id, &events[..cut]);
            snapshotted.snapshot_now(id).unwrap();
            append_all(&snapshotted, id, &events[cut..]);

            let cold = store_on(kv);
            prop_assert_eq!(&*cold.reconstruct(id).unwrap(), &*plain.reconstruct(id).unwrap());
            prop_assert_eq!(cold.stats().events_replayed, (events.len() - cut) as u64);
        }

        /// Property: rewinding to any step boundary yields the state the run had at
        /// that seq, and leaves every original event in the log.
        #[test]
        fn rewind_matches_the_prefix_state(
            responses in prop::collection::vec(0usize..3, 4),
            pick in any::<prop::sample::Index>(),
        ) {
            let events = history_with_responses(&responses);
            let boundaries: Vec<usize> = events
                .iter()
                .enumerate()
                .filter(|(_, e)| matches!(e, PipelineEvent::PipelineStarted(_) | PipelineEvent::StepCompleted(_)))
                .map(|(i, _)| i + 1)
                .collect();
            let target = boundaries[pick.index(boundaries.len())];
            let id = AggregateId::new();

            let (_, store) = setup();
            append_all(&store, id, &events);
            let log_before = raw_log(&store, id);
            store.rewind(id, target as Seq).unwrap();

            let prefix = store_on(Arc::new(InMemoryKv::new()));
            append_all(&prefix, id, &events[..target]);

            prop_assert_eq!(&*store.reconstruct(id).unwrap(), &*prefix.reconstruct(id).unwrap());
            prop_assert_eq!(&raw_log(&store, id)[..events.len()], &log_before[..]);
        }
    }
}
