//! Sequence-indexed sources: the cursor keeps moving through stretches with
//! no events, and bounded runs end once the scan reaches `to_block`.

use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wormscan_sync::mock::raw_event;
use wormscan_sync::{
    BlockRange, EngineState, Position, RunExit, SourceConfig, SourceKind, TickOutcome,
};

use super::{Scenario, EMITTER};

fn redeems(from: u64, to: Option<u64>, batch: u64) -> SourceConfig {
    let mut config = Scenario::config(Some(from), to, batch);
    config.kind = SourceKind::Redeems;
    config
}

fn markers(previous_from: u64, last_from: u64, scanned_to: u64) -> Position {
    Position::Markers {
        previous_from,
        last_from,
        scanned_to,
    }
}

fn ranges(pairs: &[(u64, u64)]) -> Vec<BlockRange> {
    pairs
        .iter()
        .map(|&(from, to)| BlockRange { from, to })
        .collect()
}

#[tokio::test]
async fn test_empty_windows_are_scanned_past() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let scenario = Scenario::new(1_000);
    scenario.add(raw_event(500, EMITTER, 1));
    let engine = scenario.engine(redeems(1, None, 100));

    for _ in 0..4 {
        assert!(matches!(engine.tick().await?, TickOutcome::NoNewData { .. }));
    }
    match engine.tick().await? {
        TickOutcome::Progressed { position, .. } => assert_eq!(position, markers(1, 500, 500)),
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(
        scenario.source.calls(),
        ranges(&[(1, 100), (101, 200), (201, 300), (301, 400), (401, 500)])
    );
    assert_eq!(scenario.sink.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_next_event_further_than_one_batch_is_reached() -> Result<()> {
    let scenario = Scenario::new(30);
    scenario.add(raw_event(30, EMITTER, 1));
    scenario.add(raw_event(500, EMITTER, 2));
    let engine = scenario.engine(redeems(1, None, 100));

    engine.tick().await?;
    assert_eq!(
        scenario.store.history("ethereum-logs").await,
        vec![markers(1, 30, 30)]
    );

    scenario.source.set_finalized(1_000);
    let mut ticks = 0;
    loop {
        ticks += 1;
        assert!(ticks <= 10, "marker source stopped advancing");
        match engine.tick().await? {
            TickOutcome::NoNewData { .. } => {}
            TickOutcome::Progressed { position, .. } => {
                assert_eq!(position, markers(30, 500, 529));
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(
        scenario.source.calls(),
        ranges(&[(1, 30), (30, 129), (130, 229), (230, 329), (330, 429), (430, 529)])
    );
    assert_eq!(scenario.sink.sequences(2, &EMITTER[2..]).await, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_bounded_redeem_source_runs_to_finished() -> Result<()> {
    let scenario = Scenario::new(1_000);
    scenario.add(raw_event(10, EMITTER, 1));
    scenario.add(raw_event(120, EMITTER, 2));
    let engine = scenario.engine(redeems(1, Some(250), 100));

    let exit = tokio::time::timeout(Duration::from_secs(5), engine.run(CancellationToken::new())).await?;
    assert_eq!(exit, RunExit::Finished);
    assert_eq!(engine.state(), EngineState::Finished);

    // The last window held no event but still carries the scan to to_block
    assert_eq!(
        scenario.store.history("ethereum-logs").await,
        vec![markers(1, 10, 100), markers(10, 120, 200), markers(10, 120, 250)]
    );
    assert_eq!(scenario.sink.len().await, 2);
    Ok(())
}
