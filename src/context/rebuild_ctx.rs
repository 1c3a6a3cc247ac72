use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::*;

/// The ordered set of segments that must be reconstructed after a
/// device loss.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildCtx {
    targets: BTreeSet<SegmentId>,
}

impl RebuildCtx {
    /// Every segment holding destaged data becomes a target.
    pub(crate) fn make_rebuild_target(&mut self, states: &[SegmentState]) -> usize {
        self.targets = states
            .iter()
            .enumerate()
            .filter(|(_, state)| {
                matches!(state, SegmentState::DataArea | SegmentState::Victim)
            })
            .map(|(segment, _)| segment as SegmentId)
            .collect();
        self.targets.len()
    }

    pub fn next_target(&self) -> Option<SegmentId> {
        self.targets.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.targets.iter().copied()
    }

    pub fn contains(&self, segment: SegmentId) -> bool {
        self.targets.contains(&segment)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub(crate) fn release(&mut self, segment: SegmentId) -> bool {
        self.targets.remove(&segment)
    }

    pub(crate) fn clear(&mut self) {
        self.targets.clear();
    }
}

#[test]
fn targets_only_segments_with_destaged_data() {
    use SegmentState::*;

    let mut ctx = RebuildCtx::default();
    let n = ctx.make_rebuild_target(&[Free, DataArea, WriteBufferArea, Victim]);
    assert_eq!(n, 2);
    assert_eq!(ctx.iter().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(ctx.next_target(), Some(1));
    assert!(ctx.release(1));
    assert!(!ctx.release(1));
    assert_eq!(ctx.next_target(), Some(3));
    ctx.clear();
    assert!(ctx.is_empty());
}
