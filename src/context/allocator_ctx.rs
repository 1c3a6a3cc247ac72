use serde::{Deserialize, Serialize};

use crate::bitmap::BitMap;
use crate::result::bug_unless;
use crate::*;

/// Lifecycle of a user-area segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SegmentState {
    /// Not allocated.
    Free = 0,
    /// Allocated, with stripes still being filled in the write buffer.
    WriteBufferArea = 1,
    /// At least one stripe has been destaged into it.
    DataArea = 2,
    /// Selected for garbage collection.
    Victim = 3,
}

/// Segment allocation state plus the user-area stripe cursors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorCtx {
    segment_bitmap: BitMap,
    segment_states: Vec<SegmentState>,
    // destage sequence number, one per stripe flushed into the user area
    current_ssd_lsid: u64,
    // last user-area stripe handed to a newly opened stripe
    user_stripe_tail: StripeId,
}

impl AllocatorCtx {
    pub(crate) fn new(info: &AddressInfo) -> AllocatorCtx {
        AllocatorCtx {
            segment_bitmap: BitMap::new(info.num_segments()),
            segment_states: vec![SegmentState::Free; info.num_segments() as usize],
            current_ssd_lsid: 0,
            user_stripe_tail: UNMAP_STRIPE,
        }
    }

    pub(crate) fn matches_geometry(&self, info: &AddressInfo) -> bool {
        self.segment_bitmap.num_bits() == info.num_segments()
            && self.segment_states.len() == info.num_segments() as usize
    }

    /// First-fit allocation of a free segment.
    pub(crate) fn allocate_segment(&mut self) -> Option<SegmentId> {
        let segment = self.segment_bitmap.set_first_fit()?;
        self.segment_states[segment as usize] = SegmentState::WriteBufferArea;
        log::debug!("allocated segment {}", segment);
        Some(segment)
    }

    pub(crate) fn release_segment(&mut self, segment: SegmentId) -> Result<()> {
        bug_unless!(
            segment < self.segment_bitmap.num_bits(),
            "segment {} out of range",
            segment
        );
        bug_unless!(
            self.segment_bitmap.clear(segment),
            "double free of segment {}",
            segment
        );
        self.segment_states[segment as usize] = SegmentState::Free;
        log::debug!("released segment {}", segment);
        Ok(())
    }

    pub fn is_segment_allocated(&self, segment: SegmentId) -> bool {
        self.segment_bitmap.is_set(segment)
    }

    pub fn allocated_segment_count(&self) -> u32 {
        self.segment_bitmap.num_set()
    }

    pub fn total_segment_count(&self) -> u32 {
        self.segment_bitmap.num_bits()
    }

    pub(crate) fn set_allocated_segment_count(&mut self, count: u32) {
        self.segment_bitmap.reset_to_prefix(count);
    }

    /// `None` for a segment id past the end of the table.
    pub fn segment_state(&self, segment: SegmentId) -> Option<SegmentState> {
        self.segment_states.get(segment as usize).copied()
    }

    pub(crate) fn state(&self, segment: SegmentId) -> SegmentState {
        self.segment_states[segment as usize]
    }

    pub(crate) fn set_segment_state(&mut self, segment: SegmentId, state: SegmentState) {
        log::trace!(
            "segment {} {:?} -> {:?}",
            segment,
            self.segment_states[segment as usize],
            state
        );
        self.segment_states[segment as usize] = state;
    }

    pub fn segment_states(&self) -> &[SegmentState] {
        &self.segment_states
    }

    pub fn current_ssd_lsid(&self) -> u64 {
        self.current_ssd_lsid
    }

    /// Bumps and returns the destage sequence number.
    pub(crate) fn advance_ssd_lsid(&mut self) -> u64 {
        self.current_ssd_lsid += 1;
        self.current_ssd_lsid
    }

    pub fn user_stripe_tail(&self) -> StripeId {
        self.user_stripe_tail
    }

    /// Carves the next user-area stripe id, taking a fresh segment
    /// when the current one is used up.
    pub(crate) fn allocate_user_stripe(&mut self, info: &AddressInfo) -> Option<StripeId> {
        let vsid = if self.user_stripe_tail == UNMAP_STRIPE
            || info.is_last_stripe_of_segment(self.user_stripe_tail)
        {
            info.first_stripe_of(self.allocate_segment()?)
        } else {
            self.user_stripe_tail + 1
        };
        self.user_stripe_tail = vsid;
        Some(vsid)
    }

    pub(crate) fn segment_bitmap_bytes(&self) -> Vec<u8> {
        self.allocated_segment_count().to_le_bytes().to_vec()
    }

    pub(crate) fn segment_state_bytes(&self) -> Vec<u8> {
        self.segment_states
            .iter()
            .flat_map(|state| (*state as u32).to_le_bytes())
            .collect()
    }
}
