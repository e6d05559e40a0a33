//! Range planning: decides what a tick fetches next and what it persists.
//!
//! All range bookkeeping lives here and in [`Cursor`]. Adapters and correlation
//! stages stay pure functions of the range they are handed.

use log::debug;

use crate::{BlockRange, Cursor, Position, SourceConfig, SourceKind};

/// Result of planning one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Fetch this inclusive range
    Range(BlockRange),
    /// Nothing finalized past the cursor yet
    Idle,
    /// Bounded source has covered its `to_block`
    Finished,
}

#[derive(Debug, Clone)]
pub struct RangePlanner {
    kind: SourceKind,
    from_block: Option<u64>,
    to_block: Option<u64>,
    genesis_block: Option<u64>,
}

impl RangePlanner {
    pub fn new(kind: SourceKind, from_block: Option<u64>, to_block: Option<u64>, genesis_block: Option<u64>) -> Self {
        Self {
            kind,
            from_block,
            to_block,
            genesis_block,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.kind, config.from_block, config.to_block, config.genesis_block)
    }

    /// First height to fetch when no cursor exists.
    fn initial_from(&self, finalized: u64) -> u64 {
        self.from_block.or(self.genesis_block).unwrap_or(finalized)
    }

    fn next_from(&self, cursor: Option<&Cursor>, finalized: u64, max_batch_size: u64) -> u64 {
        let next = match cursor.map(|c| c.position) {
            None => self.initial_from(finalized),
            Some(Position::Blocks { to, .. }) => to.saturating_add(1),
            // The newest marker is re-read while the scan has not moved past
            // it; there may be more events at it. A one-block window could
            // never leave it, so it skips the re-read.
            Some(position @ Position::Markers { last_from, .. }) => {
                let scanned_to = position.scanned_to();
                if scanned_to <= last_from && max_batch_size > 1 {
                    last_from
                } else {
                    scanned_to.saturating_add(1)
                }
            }
        };
        match self.from_block {
            Some(from_block) if from_block > next => from_block,
            _ => next,
        }
    }

    pub fn plan(&self, cursor: Option<&Cursor>, finalized: u64, max_batch_size: u64) -> Plan {
        if self.is_complete(cursor) {
            return Plan::Finished;
        }
        let from = self.next_from(cursor, finalized, max_batch_size);
        if let Some(to_block) = self.to_block {
            if from > to_block {
                return Plan::Finished;
            }
        }
        if from > finalized {
            debug!("nothing to plan: next {} is past finalized {}", from, finalized);
            return Plan::Idle;
        }
        let mut to = from
            .saturating_add(max_batch_size.max(1) - 1)
            .min(finalized);
        if let Some(to_block) = self.to_block {
            to = to.min(to_block);
        }
        Plan::Range(BlockRange { from, to })
    }

    /// Position to persist after `range` was fully sunk, `None` when nothing
    /// moved.
    ///
    /// `newest_marker` is the highest marker seen in the batch. Sequence-indexed
    /// sources move `last_from` only when it passes the previous newest marker,
    /// but always carry `scanned_to` forward so an empty window is not planned
    /// again.
    pub fn advance(&self, cursor: Option<&Cursor>, range: BlockRange, newest_marker: Option<u64>) -> Option<Position> {
        if !self.kind.is_sequence_indexed() {
            return Some(Position::Blocks {
                from: range.from,
                to: range.to,
            });
        }
        match cursor.map(|c| c.position) {
            Some(
                position @ Position::Markers {
                    previous_from,
                    last_from,
                    ..
                },
            ) => {
                let scanned_to = position.scanned_to().max(range.to);
                match newest_marker {
                    Some(newest) if newest > last_from => Some(Position::Markers {
                        previous_from: last_from,
                        last_from: newest,
                        scanned_to,
                    }),
                    _ if scanned_to > position.scanned_to() => Some(Position::Markers {
                        previous_from,
                        last_from,
                        scanned_to,
                    }),
                    _ => None,
                }
            }
            _ => {
                let last_from = newest_marker.unwrap_or(range.from);
                Some(Position::Markers {
                    previous_from: range.from.min(last_from),
                    last_from,
                    scanned_to: range.to.max(last_from),
                })
            }
        }
    }

    /// Whether `position` carries a newer marker than `cursor`. Always true for
    /// block sources.
    pub fn has_new_marker(&self, cursor: Option<&Cursor>, position: &Position, newest_marker: Option<u64>) -> bool {
        if !self.kind.is_sequence_indexed() {
            return true;
        }
        match (cursor.map(|c| c.position), newest_marker) {
            (_, None) => false,
            (Some(Position::Markers { last_from, .. }), Some(_)) => position.high_water() > last_from,
            (_, Some(_)) => true,
        }
    }

    /// A bounded source whose persisted position reached `to_block`.
    pub fn is_complete(&self, cursor: Option<&Cursor>) -> bool {
        match (self.to_block, cursor.map(|c| c.position)) {
            (Some(to_block), Some(position)) => position.scanned_to() >= to_block,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(from: u64, to: u64) -> Cursor {
        Cursor::new("src", Position::Blocks { from, to })
    }

    #[test]
    fn test_first_plan_uses_override_then_genesis_then_tip() {
        let planner = RangePlanner::new(SourceKind::Logs, Some(10), None, Some(5));
        assert_eq!(planner.plan(None, 100, 10), Plan::Range(BlockRange { from: 10, to: 19 }));

        let planner = RangePlanner::new(SourceKind::Logs, None, None, Some(5));
        assert_eq!(planner.plan(None, 100, 10), Plan::Range(BlockRange { from: 5, to: 14 }));

        let planner = RangePlanner::new(SourceKind::Logs, None, None, None);
        assert_eq!(planner.plan(None, 100, 10), Plan::Range(BlockRange { from: 100, to: 100 }));
    }

    #[test]
    fn test_plan_resumes_after_cursor_and_clamps_to_finalized() {
        let planner = RangePlanner::new(SourceKind::Logs, None, None, Some(0));
        let cursor = blocks(0, 49);
        assert_eq!(
            planner.plan(Some(&cursor), 55, 50),
            Plan::Range(BlockRange { from: 50, to: 55 })
        );
        assert_eq!(planner.plan(Some(&blocks(50, 55)), 55, 50), Plan::Idle);
    }

    #[test]
    fn test_from_block_raises_a_lagging_cursor() {
        let planner = RangePlanner::new(SourceKind::Logs, Some(1_000), None, None);
        assert_eq!(
            planner.plan(Some(&blocks(0, 9)), 2_000, 10),
            Plan::Range(BlockRange { from: 1_000, to: 1_009 })
        );
    }

    #[test]
    fn test_bounded_source_scenario() {
        let planner = RangePlanner::new(SourceKind::Logs, Some(10), Some(25), None);
        let first = planner.plan(None, 1_000, 10);
        assert_eq!(first, Plan::Range(BlockRange { from: 10, to: 19 }));
        let cursor = Cursor::new("src", planner.advance(None, BlockRange { from: 10, to: 19 }, None).unwrap());
        assert!(!planner.is_complete(Some(&cursor)));

        let second = planner.plan(Some(&cursor), 1_000, 10);
        assert_eq!(second, Plan::Range(BlockRange { from: 20, to: 25 }));
        let cursor = Cursor::new(
            "src",
            planner.advance(Some(&cursor), BlockRange { from: 20, to: 25 }, None).unwrap(),
        );
        assert!(planner.is_complete(Some(&cursor)));
        assert_eq!(planner.plan(Some(&cursor), 1_000, 10), Plan::Finished);
    }

    #[test]
    fn test_single_block_source_terminates() {
        let planner = RangePlanner::new(SourceKind::Logs, Some(100), Some(100), None);
        assert_eq!(planner.plan(None, 500, 50), Plan::Range(BlockRange { from: 100, to: 100 }));
        let cursor = blocks(100, 100);
        assert_eq!(planner.plan(Some(&cursor), 500, 50), Plan::Finished);
    }

    #[test]
    fn test_bounded_source_waits_for_finality() {
        let planner = RangePlanner::new(SourceKind::Logs, Some(10), Some(25), None);
        assert_eq!(planner.plan(None, 5, 10), Plan::Idle);
        assert_eq!(planner.plan(None, 12, 10), Plan::Range(BlockRange { from: 10, to: 12 }));
    }

    fn markers(previous_from: u64, last_from: u64, scanned_to: u64) -> Cursor {
        Cursor::new(
            "redeems",
            Position::Markers {
                previous_from,
                last_from,
                scanned_to,
            },
        )
    }

    fn range_of(plan: Plan) -> BlockRange {
        match plan {
            Plan::Range(range) => range,
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_markers_treat_equal_newest_as_no_new_data() {
        let planner = RangePlanner::new(SourceKind::Redeems, None, None, Some(1));
        let range = range_of(planner.plan(None, 30, 100));
        assert_eq!(range, BlockRange { from: 1, to: 30 });

        let position = planner.advance(None, range, Some(30)).unwrap();
        assert_eq!(position, markers(1, 30, 30).position);
        let cursor = Cursor::new("redeems", position);

        // Newest marker is re-read inclusively while the scan sits on it
        assert_eq!(planner.plan(Some(&cursor), 30, 100), Plan::Range(BlockRange { from: 30, to: 30 }));
        assert_eq!(planner.advance(Some(&cursor), BlockRange { from: 30, to: 30 }, Some(30)), None);
        assert_eq!(planner.advance(Some(&cursor), BlockRange { from: 30, to: 30 }, None), None);
        assert_eq!(
            planner.advance(Some(&cursor), BlockRange { from: 30, to: 40 }, Some(35)),
            Some(markers(30, 35, 40).position)
        );
    }

    #[test]
    fn test_markers_move_past_an_empty_window() {
        let planner = RangePlanner::new(SourceKind::Redeems, None, None, Some(1));
        let mut cursor: Option<Cursor> = None;
        let mut planned = Vec::new();
        for _ in 0..5 {
            let range = range_of(planner.plan(cursor.as_ref(), 1_000, 100));
            planned.push(range);
            let newest = if range.contains(500) { Some(500) } else { None };
            let position = planner.advance(cursor.as_ref(), range, newest).unwrap();
            assert_eq!(
                planner.has_new_marker(cursor.as_ref(), &position, newest),
                newest.is_some()
            );
            cursor = Some(Cursor::new("redeems", position));
        }

        assert_eq!(planned[0], BlockRange { from: 1, to: 100 });
        assert_eq!(planned[4], BlockRange { from: 401, to: 500 });
        assert_eq!(cursor.map(|c| c.position), Some(markers(1, 500, 500).position));
    }

    #[test]
    fn test_markers_scan_towards_a_distant_next_event() {
        let planner = RangePlanner::new(SourceKind::Redeems, None, None, Some(1));
        let cursor = markers(1, 30, 30);
        let range = range_of(planner.plan(Some(&cursor), 1_000, 100));
        assert_eq!(range, BlockRange { from: 30, to: 129 });

        let position = planner.advance(Some(&cursor), range, Some(30)).unwrap();
        assert_eq!(position, markers(1, 30, 129).position);
        assert!(!planner.has_new_marker(Some(&cursor), &position, Some(30)));

        let cursor = Cursor::new("redeems", position);
        assert_eq!(
            planner.plan(Some(&cursor), 1_000, 100),
            Plan::Range(BlockRange { from: 130, to: 229 })
        );
    }

    #[test]
    fn test_single_block_marker_window_still_advances() {
        let planner = RangePlanner::new(SourceKind::Redeems, None, None, Some(1));
        let cursor = markers(1, 30, 30);
        assert_eq!(planner.plan(Some(&cursor), 100, 1), Plan::Range(BlockRange { from: 31, to: 31 }));
    }

    #[test]
    fn test_bounded_marker_source_completes_on_scanned_height() {
        let planner = RangePlanner::new(SourceKind::Redeems, Some(1), Some(250), None);
        let cursor = markers(10, 120, 200);
        let range = range_of(planner.plan(Some(&cursor), 1_000, 100));
        assert_eq!(range, BlockRange { from: 201, to: 250 });

        let position = planner.advance(Some(&cursor), range, None).unwrap();
        assert_eq!(position, markers(10, 120, 250).position);
        let cursor = Cursor::new("redeems", position);
        assert!(planner.is_complete(Some(&cursor)));
        assert_eq!(planner.plan(Some(&cursor), 1_000, 100), Plan::Finished);
    }
}
