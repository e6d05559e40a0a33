//! Cursor, range and idempotence behaviour of a single polling source

use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wormscan_sync::mock::raw_event;
use wormscan_sync::telemetry::{
    CURSOR_METRIC, EVENTS_SUNK_METRIC, OUTCOME_TAG, TICK_LATENCY_METRIC, TICK_METRIC,
};
use wormscan_sync::{
    BlockRange, CursorStore, EngineState, Position, RunExit, SyncError, TickOutcome,
};

use super::{Scenario, EMITTER};

#[tokio::test]
async fn test_bounded_source_plans_ten_to_twenty_five() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let scenario = Scenario::new(1_000).with_messages(10..=25);
    let engine = scenario.engine(Scenario::config(Some(10), Some(25), 10));

    engine.tick().await?;
    engine.tick().await?;

    assert_eq!(
        scenario.store.history("ethereum-logs").await,
        vec![
            Position::Blocks { from: 10, to: 19 },
            Position::Blocks { from: 20, to: 25 },
        ]
    );
    assert_eq!(
        scenario.source.calls(),
        vec![BlockRange { from: 10, to: 19 }, BlockRange { from: 20, to: 25 }]
    );
    assert_eq!(engine.state(), EngineState::Finished);
    assert_eq!(scenario.sink.len().await, 16);
    Ok(())
}

#[tokio::test]
async fn test_single_block_source() -> Result<()> {
    let scenario = Scenario::new(500).with_messages([100]);
    let engine = scenario.engine(Scenario::config(Some(100), Some(100), 10));

    match engine.tick().await? {
        TickOutcome::Progressed { range, finished, .. } => {
            assert_eq!(range, BlockRange { from: 100, to: 100 });
            assert!(finished);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(engine.tick().await?, TickOutcome::Finished);
    assert_eq!(scenario.source.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cursor_is_monotonic_under_failures() -> Result<()> {
    let scenario = Scenario::new(60).with_messages(1..=60);
    let engine = scenario.engine(Scenario::config(Some(1), Some(60), 7));

    let mut failures = 0;
    for round in 0..40 {
        match round % 4 {
            1 => scenario
                .source
                .fail_next_fetch(SyncError::TransientFetch("connection reset".into())),
            2 => scenario.sink.fail_next_upserts(1),
            3 => scenario.store.fail_next_saves(1),
            _ => {}
        }
        match engine.tick().await {
            Ok(TickOutcome::Finished) => break,
            Ok(_) => {}
            Err(e) => {
                assert!(e.is_retryable(), "unexpected {}", e);
                failures += 1;
            }
        }
    }
    assert!(failures > 0);
    assert_eq!(engine.state(), EngineState::Finished);

    // Every persisted range starts right after the previous one
    let history = scenario.store.history("ethereum-logs").await;
    let mut expected_from = 1;
    for position in &history {
        match position {
            Position::Blocks { from, to } => {
                assert_eq!(*from, expected_from);
                expected_from = to + 1;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(expected_from, 61);
    assert_eq!(scenario.sink.sequences(2, &EMITTER[2..]).await, (1..=60).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn test_resinking_a_range_is_idempotent() -> Result<()> {
    let scenario = Scenario::new(30).with_messages(1..=30);
    let config = Scenario::config(Some(1), Some(30), 10);

    let first = scenario.engine(config.clone());
    assert_eq!(first.run(CancellationToken::new()).await, RunExit::Finished);
    let keys = scenario.sink.keys().await;

    // Operator rewind: the same ranges are sunk again
    scenario.store.delete("ethereum-logs").await?;
    let second = scenario.engine(config);
    let mut unchanged = 0;
    loop {
        match second.tick().await? {
            TickOutcome::Progressed { stats, finished, .. } => {
                assert_eq!(stats.written, 0);
                unchanged += stats.unchanged;
                if finished {
                    break;
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(unchanged, 30);
    assert_eq!(scenario.sink.keys().await, keys);
    // Publishing is at-least-once: the replay announces every message again
    assert_eq!(scenario.publisher.published().await.len(), 60);
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_after_persisted_cursor() -> Result<()> {
    let scenario = Scenario::new(100).with_messages(1..=40);
    let config = Scenario::config(Some(1), None, 20);

    scenario.engine(config.clone()).tick().await?;

    let restarted = scenario.engine(config);
    restarted.tick().await?;
    assert_eq!(
        scenario.source.calls(),
        vec![BlockRange { from: 1, to: 20 }, BlockRange { from: 21, to: 40 }]
    );
    assert_eq!(scenario.sink.len().await, 40);
    Ok(())
}

#[tokio::test]
async fn test_live_source_waits_for_finality() -> Result<()> {
    let scenario = Scenario::new(5).with_messages(1..=8);
    let engine = scenario.engine(Scenario::config(Some(1), None, 100));

    engine.tick().await?;
    assert_eq!(engine.tick().await?, TickOutcome::Idle);
    assert_eq!(scenario.sink.len().await, 5);

    scenario.source.set_finalized(8);
    match engine.tick().await? {
        TickOutcome::Progressed { range, .. } => assert_eq!(range, BlockRange { from: 6, to: 8 }),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(scenario.sink.len().await, 8);
    Ok(())
}

#[tokio::test]
async fn test_finite_source_run_terminates_through_backoff() -> Result<()> {
    let scenario = Scenario::new(50).with_messages(1..=50);
    for _ in 0..3 {
        scenario
            .source
            .fail_next_height(SyncError::Timeout { operation: "eth_blockNumber".into(), millis: 10 });
    }
    let engine = scenario.engine(Scenario::config(Some(1), Some(50), 10));

    let exit = tokio::time::timeout(Duration::from_secs(10), engine.run(CancellationToken::new())).await?;
    assert_eq!(exit, RunExit::Finished);
    assert_eq!(scenario.store.history("ethereum-logs").await.len(), 5);
    assert_eq!(scenario.metrics.count_with(TICK_METRIC, OUTCOME_TAG, "transient_error"), 3);
    Ok(())
}

#[tokio::test]
async fn test_every_metric_carries_source_labels() -> Result<()> {
    let scenario = Scenario::new(10).with_messages(1..=10);
    scenario.add(raw_event(3, "not-an-address", 99));
    let mut config = Scenario::config(Some(1), Some(10), 10);
    config.commitment = "safe".to_string();
    let engine = scenario.engine(config);
    engine.tick().await?;

    for name in [TICK_METRIC, TICK_LATENCY_METRIC, CURSOR_METRIC, EVENTS_SUNK_METRIC] {
        let points = scenario.metrics.points(name);
        assert!(!points.is_empty(), "no {} points", name);
        for point in points {
            assert_eq!(point.labels.source_id, "ethereum-logs");
            assert_eq!(point.labels.chain_id, 2);
            assert_eq!(point.labels.commitment, "safe");
        }
    }
    assert_eq!(scenario.metrics.last_value(CURSOR_METRIC), Some(10.0));
    assert_eq!(scenario.metrics.last_value(EVENTS_SUNK_METRIC), Some(10.0));
    Ok(())
}
