use serde::{Deserialize, Serialize};

use crate::bitmap::BitMap;
use crate::result::bug_unless;
use crate::*;

/// The stripe a write-buffer slot was handed to. A slot outlives its
/// tail entry once the stripe fills up or is detached, and this is
/// what finds it again after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbSlotOwner {
    pub vsid: StripeId,
    pub tail_idx: TailIdx,
    /// Tail offset reached while the stripe was open.
    pub granted: u32,
}

/// Write-buffer slot bitmap, per-slot owners, and the
/// active-stripe-tail table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbStripeCtx {
    wb_lsid_bitmap: BitMap,
    slot_owner: Vec<Option<WbSlotOwner>>,
    active_stripe_tail: Vec<VirtualBlkAddr>,
}

impl WbStripeCtx {
    pub(crate) fn new(info: &AddressInfo) -> WbStripeCtx {
        WbStripeCtx {
            wb_lsid_bitmap: BitMap::new(info.num_wb_stripes()),
            slot_owner: vec![None; info.num_wb_stripes() as usize],
            active_stripe_tail: vec![UNMAP_VSA; info.tail_array_len()],
        }
    }

    pub(crate) fn matches_geometry(&self, info: &AddressInfo) -> bool {
        self.wb_lsid_bitmap.num_bits() == info.num_wb_stripes()
            && self.slot_owner.len() == info.num_wb_stripes() as usize
            && self.active_stripe_tail.len() == info.tail_array_len()
    }

    /// First-fit allocation of a free write-buffer slot.
    pub(crate) fn allocate_wb_stripe(&mut self) -> Option<StripeId> {
        self.wb_lsid_bitmap.set_first_fit()
    }

    pub(crate) fn release_wb_stripe(&mut self, wb_lsid: StripeId) -> Result<()> {
        bug_unless!(
            wb_lsid < self.wb_lsid_bitmap.num_bits(),
            "write-buffer stripe {} out of range",
            wb_lsid
        );
        bug_unless!(
            self.wb_lsid_bitmap.clear(wb_lsid),
            "double free of write-buffer stripe {}",
            wb_lsid
        );
        self.slot_owner[wb_lsid as usize] = None;
        Ok(())
    }

    pub fn slot_owner(&self, wb_lsid: StripeId) -> Option<WbSlotOwner> {
        self.slot_owner.get(wb_lsid as usize).copied().flatten()
    }

    pub(crate) fn set_slot_owner(&mut self, wb_lsid: StripeId, owner: WbSlotOwner) {
        if let Some(slot) = self.slot_owner.get_mut(wb_lsid as usize) {
            *slot = Some(owner);
        }
    }

    /// Moves the recorded grant of an owned slot forward.
    pub(crate) fn record_grant(&mut self, wb_lsid: StripeId, granted: u32) {
        if let Some(Some(owner)) = self.slot_owner.get_mut(wb_lsid as usize) {
            owner.granted = granted;
        }
    }

    /// Marks a slot as allocated while replaying persisted state.
    pub(crate) fn mark_wb_stripe_allocated(&mut self, wb_lsid: StripeId) {
        self.wb_lsid_bitmap.set(wb_lsid);
    }

    pub fn is_wb_stripe_allocated(&self, wb_lsid: StripeId) -> bool {
        wb_lsid < self.wb_lsid_bitmap.num_bits()
            && self.wb_lsid_bitmap.is_set(wb_lsid)
    }

    pub fn allocated_wb_stripe_count(&self) -> u32 {
        self.wb_lsid_bitmap.num_set()
    }

    pub fn num_total_wb_stripes(&self) -> u32 {
        self.wb_lsid_bitmap.num_bits()
    }

    pub(crate) fn set_allocated_wb_stripe_count(&mut self, count: u32) {
        self.wb_lsid_bitmap.reset_to_prefix(count);
    }

    pub fn allocated_wb_stripes(&self) -> impl Iterator<Item = StripeId> + '_ {
        self.wb_lsid_bitmap.iter_set()
    }

    /// `None` for an index past the end of the tail table.
    pub fn active_stripe_tail(&self, idx: TailIdx) -> Option<VirtualBlkAddr> {
        self.active_stripe_tail.get(idx.0).copied()
    }

    pub(crate) fn tail(&self, idx: TailIdx) -> VirtualBlkAddr {
        self.active_stripe_tail[idx.0]
    }

    pub(crate) fn set_active_stripe_tail(&mut self, idx: TailIdx, tail: VirtualBlkAddr) {
        log::trace!("active stripe tail {:?}: {:?}", idx, tail);
        self.active_stripe_tail[idx.0] = tail;
    }

    pub fn active_stripe_tails(&self) -> &[VirtualBlkAddr] {
        &self.active_stripe_tail
    }

    pub(crate) fn active_stripe_tail_bytes(&self) -> Vec<u8> {
        self.active_stripe_tail
            .iter()
            .flat_map(|vsa| {
                vsa.stripe_id
                    .to_le_bytes()
                    .into_iter()
                    .chain(vsa.offset.to_le_bytes())
            })
            .collect()
    }
}
