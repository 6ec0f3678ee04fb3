use std::thread;
use std::time::Duration;

use rill::{
    CountByType, CountState, EngineConfig, EngineError, EventFilter, ExpectedVersion, Pagination,
    ProjectionName, ProjectionOptions, ProposedEvent, Rill, RillConfig, RillError, SourceSelector,
    StoreError, StreamId, TruncationPolicy,
};

fn fast_engine() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_millis(2))
        .with_max_poll_interval(Duration::from_millis(20))
}

fn in_memory_db() -> Rill {
    rill::init_tracing();
    Rill::open(RillConfig::new().with_engine(fast_engine())).expect("open in-memory store")
}

fn stream(name: &str) -> StreamId {
    StreamId::new(name).expect("valid stream id")
}

fn projection(name: &str) -> ProjectionName {
    ProjectionName::new(name).expect("valid projection name")
}

fn placed_events(count: usize) -> Vec<ProposedEvent> {
    (0..count)
        .map(|n| {
            ProposedEvent::json("OrderPlaced", &serde_json::json!({ "n": n })).expect("payload")
        })
        .collect()
}

fn count(db: &Rill, name: &ProjectionName) -> u64 {
    serde_json::from_value::<CountState>(db.projection_state(name).expect("state"))
        .expect("count state")
        .count
}

fn drain(db: &Rill, name: &ProjectionName) {
    while db.run_projection_step(name).expect("step") > 0 {}
}

/// Projections are eventually consistent behind a worker; poll briefly until
/// it catches up.
fn wait_for_catch_up(db: &Rill, name: &ProjectionName, position: u64) {
    for _ in 0..500 {
        if db.projection_stats(name).expect("stats").last_processed == Some(position) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("projection did not catch up within timeout");
}

#[test]
fn category_projection_counts_across_two_streams() {
    let db = in_memory_db();
    let one = stream("Stream1-1");
    let two = stream("Stream2-1");
    let totals = projection("added_totals");

    db.append(&one, ExpectedVersion::NoStream, placed_events(1000))
        .expect("first stream");
    db.create_projection(
        totals.clone(),
        CountByType::new("OrderPlaced"),
        SourceSelector::category("Stream"),
        ProjectionOptions::default().with_start_running(true),
    )
    .expect("create projection");

    // this stream did not exist when the projection started; the category
    // picks it up anyway
    db.append(&two, ExpectedVersion::NoStream, placed_events(1000))
        .expect("second stream");
    wait_for_catch_up(&db, &totals, 1999);

    assert_eq!(count(&db, &totals), 2000);
    db.shutdown();
}

#[test]
fn truncated_events_stay_counted_until_an_explicit_reset() {
    let db = in_memory_db();
    let one = stream("Stream1-1");
    let two = stream("Stream2-1");
    let totals = projection("added_totals");

    db.append(&one, ExpectedVersion::NoStream, placed_events(1000))
        .expect("first stream");
    db.append(&two, ExpectedVersion::NoStream, placed_events(1000))
        .expect("second stream");
    db.create_projection(
        totals.clone(),
        CountByType::new("OrderPlaced"),
        SourceSelector::category("Stream"),
        ProjectionOptions::default(),
    )
    .expect("create projection");

    drain(&db, &totals);
    assert_eq!(count(&db, &totals), 2000);

    db.set_truncate_before(&one, ExpectedVersion::Any, 111)
        .expect("truncate");

    // the default policy keeps the already-folded prefix in the count
    drain(&db, &totals);
    assert_eq!(count(&db, &totals), 2000);

    // a reset plus full replay sees only the visible events
    db.reset_projection(&totals).expect("reset");
    assert_eq!(count(&db, &totals), 0);
    drain(&db, &totals);
    assert_eq!(count(&db, &totals), 1889);
    assert_eq!(db.projection_stats(&totals).expect("stats").resets, 1);

    // truncation is logical: the stream keeps its version and its marker
    assert_eq!(db.current_version(&one).expect("version"), Some(999));
    let metadata = db.stream_metadata(&one).expect("metadata");
    assert_eq!(metadata.truncate_before, Some(111));
    assert_eq!(db.read(&one, 0, 5).expect("read")[0].event_number, 111);
}

#[test]
fn reset_and_replay_policy_recounts_without_a_manual_reset() {
    let db = in_memory_db();
    let one = stream("Stream1-1");
    let totals = projection("added_totals");

    db.append(&one, ExpectedVersion::NoStream, placed_events(400))
        .expect("append");
    db.create_projection(
        totals.clone(),
        CountByType::new("OrderPlaced"),
        SourceSelector::category("Stream"),
        ProjectionOptions::default().with_truncation_policy(TruncationPolicy::ResetAndReplay),
    )
    .expect("create projection");

    drain(&db, &totals);
    assert_eq!(count(&db, &totals), 400);

    db.set_truncate_before(&one, ExpectedVersion::Any, 111)
        .expect("truncate");
    drain(&db, &totals);

    assert_eq!(count(&db, &totals), 289);
    assert_eq!(db.projection_stats(&totals).expect("stats").resets, 1);
}

#[test]
fn duplicate_projection_names_are_rejected_without_side_effects() {
    let db = in_memory_db();
    let orders = stream("orders-1");
    let totals = projection("order_totals");

    db.append(&orders, ExpectedVersion::Any, placed_events(5))
        .expect("append");
    db.create_projection(
        totals.clone(),
        CountByType::new("OrderPlaced"),
        SourceSelector::all(),
        ProjectionOptions::default(),
    )
    .expect("create projection");
    drain(&db, &totals);

    let err = db
        .create_projection(
            totals.clone(),
            CountByType::new("OrderShipped"),
            SourceSelector::all(),
            ProjectionOptions::default(),
        )
        .expect_err("duplicate name must be rejected");
    assert!(matches!(
        err,
        RillError::Engine(EngineError::DuplicateName(ref n)) if *n == totals
    ));

    // the original registration is untouched
    assert_eq!(count(&db, &totals), 5);
    assert_eq!(
        db.projection_stats(&totals).expect("stats").events_processed,
        5
    );
}

#[test]
fn stale_expected_version_leaves_the_stream_untouched() {
    let db = in_memory_db();
    let orders = stream("orders-1");

    db.append(&orders, ExpectedVersion::NoStream, placed_events(3))
        .expect("append");

    let err = db
        .append(&orders, ExpectedVersion::Exact(0), placed_events(2))
        .expect_err("stale version must be rejected");
    assert!(matches!(
        err,
        RillError::Store(StoreError::WrongExpectedVersion {
            current: Some(2),
            ..
        })
    ));

    assert_eq!(db.current_version(&orders).expect("version"), Some(2));
    assert_eq!(db.read(&orders, 0, 10).expect("read").len(), 3);
}

#[test]
fn file_backed_store_resumes_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orders = stream("orders-1");
    let totals = projection("order_totals");
    let make_config = || {
        RillConfig::new()
            .with_data_dir(dir.path())
            .with_engine(fast_engine().with_checkpoint_every(100))
    };

    {
        let db = Rill::open(make_config()).expect("open");
        db.append(&orders, ExpectedVersion::NoStream, placed_events(500))
            .expect("append");
        db.create_projection(
            totals.clone(),
            CountByType::new("OrderPlaced"),
            SourceSelector::all(),
            ProjectionOptions::default(),
        )
        .expect("create projection");
        drain(&db, &totals);
        assert_eq!(count(&db, &totals), 500);
        db.shutdown();
    }

    let db = Rill::open(make_config()).expect("reopen");
    // journal replay restored the stream
    assert_eq!(db.current_version(&orders).expect("version"), Some(499));

    db.append(&orders, ExpectedVersion::Exact(499), placed_events(100))
        .expect("append after reopen");
    db.create_projection(
        totals.clone(),
        CountByType::new("OrderPlaced"),
        SourceSelector::all(),
        ProjectionOptions::default(),
    )
    .expect("create projection");
    drain(&db, &totals);

    assert_eq!(count(&db, &totals), 600);
    // the adopted checkpoint spared replaying the first five hundred
    assert_eq!(
        db.projection_stats(&totals).expect("stats").events_processed,
        100
    );
}

#[test]
fn open_creates_a_missing_data_dir() {
    let root = tempfile::tempdir().expect("tempdir");
    let data_dir = root.path().join("state").join("rill");
    let orders = stream("orders-1");
    let make_config = || RillConfig::new().with_data_dir(&data_dir);

    {
        let db = Rill::open(make_config()).expect("open fresh data dir");
        db.append(&orders, ExpectedVersion::NoStream, placed_events(3))
            .expect("append");
    }

    let db = Rill::open(make_config()).expect("reopen");
    assert_eq!(db.current_version(&orders).expect("version"), Some(2));
}

#[test]
fn event_queries_filter_by_type() {
    let db = in_memory_db();
    db.append(
        &stream("orders-1"),
        ExpectedVersion::Any,
        vec![
            ProposedEvent::new("OrderPlaced", Vec::new()),
            ProposedEvent::new("OrderShipped", Vec::new()),
        ],
    )
    .expect("append");
    db.append(
        &stream("billing-1"),
        ExpectedVersion::Any,
        vec![ProposedEvent::new("OrderPlaced", Vec::new())],
    )
    .expect("append");

    let result = db
        .query_events(
            &EventFilter {
                event_type: Some("OrderPlaced".into()),
                ..EventFilter::default()
            },
            Pagination::default(),
        )
        .expect("query");
    assert_eq!(result.total, 2);
    assert!(result.events.iter().all(|e| e.event_type == "OrderPlaced"));

    let first = &result.events[0];
    let by_id = db
        .get_event_by_id(first.event_id)
        .expect("lookup")
        .expect("event exists");
    assert_eq!(by_id.global_position, first.global_position);
}

#[tokio::test]
async fn rebuild_writes_a_checkpoint_fresh_registrations_adopt() {
    let db = in_memory_db();
    let orders = stream("orders-1");
    let totals = projection("order_totals");

    db.append(&orders, ExpectedVersion::Any, placed_events(40))
        .expect("append");

    let handle = db
        .rebuild_projection(
            totals.clone(),
            CountByType::new("OrderPlaced"),
            SourceSelector::all(),
        )
        .await
        .expect("start rebuild");
    let progress = handle.wait_for_completion().await.expect("rebuild");
    assert_eq!(progress.processed_events, 40);

    // a fresh registration picks the rebuilt checkpoint up instead of
    // replaying
    db.create_projection(
        totals.clone(),
        CountByType::new("OrderPlaced"),
        SourceSelector::all(),
        ProjectionOptions::default(),
    )
    .expect("create projection");
    assert_eq!(db.run_projection_step(&totals).expect("step"), 0);
    assert_eq!(count(&db, &totals), 40);
}
