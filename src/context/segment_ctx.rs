use serde::{Deserialize, Serialize};

use crate::result::bug_unless;
use crate::*;

/// Per-segment block and stripe accounting.
///
/// `valid_block_count` never leaves `[0, blks_per_segment]` and
/// `occupied_stripe_count` never exceeds `stripes_per_segment`; any
/// attempt to push past either bound is rejected as a bug rather
/// than clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCtx {
    blks_per_segment: u32,
    stripes_per_segment: u32,
    valid_block_count: Vec<u32>,
    occupied_stripe_count: Vec<u32>,
}

impl SegmentCtx {
    pub(crate) fn new(info: &AddressInfo) -> SegmentCtx {
        let n = info.num_segments() as usize;
        SegmentCtx {
            blks_per_segment: info.blks_per_segment(),
            stripes_per_segment: info.stripes_per_segment(),
            valid_block_count: vec![0; n],
            occupied_stripe_count: vec![0; n],
        }
    }

    pub(crate) fn matches_geometry(&self, info: &AddressInfo) -> bool {
        self.blks_per_segment == info.blks_per_segment()
            && self.stripes_per_segment == info.stripes_per_segment()
            && self.valid_block_count.len() == info.num_segments() as usize
            && self.occupied_stripe_count.len() == info.num_segments() as usize
    }

    pub fn num_segments(&self) -> u32 {
        self.valid_block_count.len() as u32
    }

    /// `None` for a segment id past the end of the table.
    pub fn valid_block_count(&self, segment: SegmentId) -> Option<u32> {
        self.valid_block_count.get(segment as usize).copied()
    }

    pub fn occupied_stripe_count(&self, segment: SegmentId) -> Option<u32> {
        self.occupied_stripe_count.get(segment as usize).copied()
    }

    pub(crate) fn valid_blocks(&self, segment: SegmentId) -> u32 {
        self.valid_block_count[segment as usize]
    }

    pub(crate) fn occupied_stripes(&self, segment: SegmentId) -> u32 {
        self.occupied_stripe_count[segment as usize]
    }

    pub fn is_full(&self, segment: SegmentId) -> bool {
        self.occupied_stripe_count(segment) == Some(self.stripes_per_segment)
    }

    pub(crate) fn increase_valid_block_count(
        &mut self,
        segment: SegmentId,
        count: u32,
    ) -> Result<()> {
        let current = self.valid_block_count[segment as usize];
        bug_unless!(
            current
                .checked_add(count)
                .is_some_and(|next| next <= self.blks_per_segment),
            "valid block count of segment {} would exceed {} ({} + {})",
            segment,
            self.blks_per_segment,
            current,
            count
        );
        self.valid_block_count[segment as usize] = current + count;
        Ok(())
    }

    /// Returns `true` when the segment no longer holds any valid block.
    pub(crate) fn decrease_valid_block_count(
        &mut self,
        segment: SegmentId,
        count: u32,
    ) -> Result<bool> {
        let current = self.valid_block_count[segment as usize];
        bug_unless!(
            current >= count,
            "valid block count of segment {} would drop below zero ({} - {})",
            segment,
            current,
            count
        );
        let next = current - count;
        self.valid_block_count[segment as usize] = next;
        Ok(next == 0)
    }

    /// Returns `true` when every stripe of the segment is occupied.
    pub(crate) fn increase_occupied_stripe_count(
        &mut self,
        segment: SegmentId,
    ) -> Result<bool> {
        let current = self.occupied_stripe_count[segment as usize];
        bug_unless!(
            current < self.stripes_per_segment,
            "occupied stripe count of segment {} already at capacity {}",
            segment,
            self.stripes_per_segment
        );
        self.occupied_stripe_count[segment as usize] = current + 1;
        Ok(current + 1 == self.stripes_per_segment)
    }

    pub(crate) fn reset(&mut self, segment: SegmentId) {
        self.valid_block_count[segment as usize] = 0;
        self.occupied_stripe_count[segment as usize] = 0;
    }

    pub(crate) fn valid_block_count_bytes(&self) -> Vec<u8> {
        u32s_to_le_bytes(&self.valid_block_count)
    }

    pub(crate) fn occupied_stripe_count_bytes(&self) -> Vec<u8> {
        u32s_to_le_bytes(&self.occupied_stripe_count)
    }

    pub(crate) fn set_valid_block_count_bytes(&mut self, raw: &[u8]) -> Result<()> {
        let counts = le_bytes_to_u32s(raw, self.valid_block_count.len())?;
        if let Some(bad) = counts.iter().position(|c| *c > self.blks_per_segment) {
            return Err(Error::Unsupported(format!(
                "valid block count {} of segment {} exceeds segment capacity",
                counts[bad], bad
            )));
        }
        self.valid_block_count = counts;
        Ok(())
    }

    pub(crate) fn set_occupied_stripe_count_bytes(
        &mut self,
        raw: &[u8],
    ) -> Result<()> {
        let counts = le_bytes_to_u32s(raw, self.occupied_stripe_count.len())?;
        if let Some(bad) = counts.iter().position(|c| *c > self.stripes_per_segment)
        {
            return Err(Error::Unsupported(format!(
                "occupied stripe count {} of segment {} exceeds segment capacity",
                counts[bad], bad
            )));
        }
        self.occupied_stripe_count = counts;
        Ok(())
    }
}

pub(crate) fn u32s_to_le_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn le_bytes_to_u32s(raw: &[u8], expected: usize) -> Result<Vec<u32>> {
    if raw.len() != expected * 4 {
        return Err(Error::Unsupported(format!(
            "expected a section of {} bytes, got {}",
            expected * 4,
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
