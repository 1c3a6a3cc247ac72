use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::result::bug_unless;
use crate::stripe::StripeTable;
use crate::*;

/// Grants block addresses to writers by advancing the active stripe
/// tail of their stream.
///
/// Each tail owns at most one open stripe, so a grant is a constant
/// time read-bump-return under the context lock. A request larger
/// than what is left in the open stripe is granted only the
/// remainder; the caller asks again for the rest, which then lands in
/// a freshly opened stripe. A grant is never empty.
///
/// While allocation is turned off, globally or for one stream, every
/// request fails immediately with `Error::AllocationSuspended` without
/// touching any tail.
#[derive(Debug)]
pub struct BlockManager {
    info: AddressInfo,
    ctx: Arc<ContextManager>,
    stripes: Arc<StripeTable>,
    stripe_map: Arc<dyn StripeMap>,
    // nesting depth of turn_off_blk_allocation
    suspend_depth: AtomicU32,
    prohibited: Vec<AtomicBool>,
}

impl BlockManager {
    pub(crate) fn new(
        info: AddressInfo,
        ctx: Arc<ContextManager>,
        stripes: Arc<StripeTable>,
        stripe_map: Arc<dyn StripeMap>,
    ) -> BlockManager {
        BlockManager {
            prohibited: (0..info.num_streams())
                .map(|_| AtomicBool::new(false))
                .collect(),
            info,
            ctx,
            stripes,
            stripe_map,
            suspend_depth: AtomicU32::new(0),
        }
    }

    /// Allocates up to `num_blks` blocks for user writes of `stream`.
    pub fn allocate_blocks(
        &self,
        stream: StreamId,
        num_blks: u32,
    ) -> Result<VirtualBlks> {
        self.allocate(stream, TailSlot::User, num_blks)
    }

    /// Allocates up to `num_blks` blocks on the garbage collection
    /// tail of `stream`. Per-stream prohibition does not apply here.
    pub fn allocate_gc_blocks(
        &self,
        stream: StreamId,
        num_blks: u32,
    ) -> Result<VirtualBlks> {
        self.allocate(stream, TailSlot::Gc, num_blks)
    }

    fn allocate(
        &self,
        stream: StreamId,
        slot: TailSlot,
        num_blks: u32,
    ) -> Result<VirtualBlks> {
        if num_blks == 0 {
            return Err(Error::Unsupported(
                "block allocation requires at least one block".into(),
            ));
        }
        let idx = self.info.tail_idx(stream, slot)?;

        let mut contexts = self.ctx.ctx_lock();

        if self.suspend_depth.load(Ordering::Acquire) > 0
            || (slot == TailSlot::User
                && self.prohibited[stream as usize].load(Ordering::Acquire))
        {
            log::trace!("allocation for stream {} refused while suspended", stream);
            return Err(Error::AllocationSuspended);
        }

        let blks_per_stripe = BlkOffset::from(self.info.blks_per_stripe());

        let mut tail = contexts.wb_stripe.tail(idx);
        let stripe = if tail.is_unmap() || tail.offset >= blks_per_stripe {
            let stripe = self.open_stripe(&mut contexts, idx)?;
            tail = VirtualBlkAddr::new(stripe.vsid(), 0);
            stripe
        } else {
            self.open_stripe_of(tail.stripe_id)?
        };

        let remaining = blks_per_stripe - tail.offset;
        let granted = BlkOffset::from(num_blks).min(remaining) as u32;

        bug_unless!(
            stripe.refer(),
            "open stripe {} refused a reference",
            stripe.vsid()
        );

        let next = VirtualBlkAddr::new(tail.stripe_id, tail.offset + BlkOffset::from(granted));
        contexts.wb_stripe.set_active_stripe_tail(idx, next);
        contexts.wb_stripe.record_grant(stripe.wb_lsid(), next.offset as u32);

        if next.offset == blks_per_stripe {
            let sealed = stripe.seal(self.info.blks_per_stripe());
            debug_assert!(sealed);
            log::debug!(
                "stripe {} (wb_lsid {}) of stream {} is full",
                stripe.vsid(),
                stripe.wb_lsid(),
                stream
            );
            self.stripes.push_pending(stream, stripe);
        }

        Ok(VirtualBlks { start: tail, num_blks: granted })
    }

    /// Binds a free write-buffer slot and the next user-area stripe to
    /// a new open stripe, and points tail `idx` at its first block.
    fn open_stripe(
        &self,
        contexts: &mut Contexts,
        idx: TailIdx,
    ) -> Result<Arc<Stripe>> {
        let wb_lsid = contexts
            .wb_stripe
            .allocate_wb_stripe()
            .ok_or(Error::NoFreeWbStripe)?;

        let Some(vsid) = contexts.allocator.allocate_user_stripe(&self.info) else {
            contexts.wb_stripe.release_wb_stripe(wb_lsid)?;
            return Err(Error::NoFreeSegment);
        };

        let stripe = Arc::new(Stripe::new(
            wb_lsid,
            vsid,
            idx,
            self.info.blks_per_stripe(),
        ));
        self.stripes.insert(stripe.clone())?;
        self.stripe_map.set_lsa(vsid, StripeAddr::in_write_buffer(wb_lsid));
        contexts
            .wb_stripe
            .set_slot_owner(wb_lsid, WbSlotOwner { vsid, tail_idx: idx, granted: 0 });
        contexts
            .wb_stripe
            .set_active_stripe_tail(idx, VirtualBlkAddr::new(vsid, 0));

        log::debug!("opened stripe {} in wb slot {} for tail {:?}", vsid, wb_lsid, idx);

        Ok(stripe)
    }

    fn open_stripe_of(&self, vsid: StripeId) -> Result<Arc<Stripe>> {
        let stripe = match self.stripe_map.get_lsa(vsid) {
            Some(addr) if addr.is_in_write_buffer() => self.stripes.get(addr.stripe_id),
            _ => None,
        };
        match stripe {
            Some(stripe) if stripe.vsid() == vsid => Ok(stripe),
            _ => Err(Error::ReportableBug(format!(
                "active stripe tail points at stripe {} which is not in the write buffer",
                vsid
            ))),
        }
    }

    /// Marks a run of previously destaged blocks as garbage, reclaiming
    /// the owning segment once nothing valid is left in it.
    pub fn invalidate_blks(&self, blks: VirtualBlks) -> Result<()> {
        if blks.start.stripe_id >= self.info.num_user_stripes()
            || blks.end_offset() > BlkOffset::from(self.info.blks_per_stripe())
        {
            return Err(Error::Unsupported(format!(
                "{:?} is not a run of user-area blocks",
                blks
            )));
        }

        let segment = self.info.segment_of(blks.start.stripe_id);
        let mut contexts = self.ctx.ctx_lock();

        // blocks still in the write buffer were never counted as valid
        match self.stripe_map.get_lsa(blks.start.stripe_id) {
            Some(addr) if !addr.is_in_write_buffer() => {}
            other => {
                return Err(Error::Unsupported(format!(
                    "{:?} has not been destaged, stripe map has {:?}",
                    blks, other
                )));
            }
        }

        if contexts.segment.decrease_valid_block_count(segment, blks.num_blks)? {
            self.try_reclaim(&mut contexts, segment)?;
        }
        Ok(())
    }

    /// Frees `segment` if it holds no valid block and will not receive
    /// any more stripes.
    pub(crate) fn try_reclaim(
        &self,
        contexts: &mut Contexts,
        segment: SegmentId,
    ) -> Result<bool> {
        let reclaimable = contexts.segment.valid_blocks(segment) == 0
            && match contexts.allocator.state(segment) {
                SegmentState::Victim => true,
                SegmentState::DataArea => contexts.segment.is_full(segment),
                _ => false,
            };

        if reclaimable {
            contexts.segment.reset(segment);
            contexts.allocator.release_segment(segment)?;
            contexts.rebuild.release(segment);
            log::debug!("reclaimed segment {}", segment);
        }
        Ok(reclaimable)
    }

    /// Selects a fully written segment for garbage collection.
    pub fn mark_victim(&self, segment: SegmentId) -> Result<()> {
        if segment >= self.info.num_segments() {
            return Err(Error::Unsupported(format!(
                "segment {} is out of range",
                segment
            )));
        }
        let mut contexts = self.ctx.ctx_lock();
        let state = contexts.allocator.state(segment);
        if state != SegmentState::DataArea || !contexts.segment.is_full(segment) {
            return Err(Error::Unsupported(format!(
                "segment {} in state {:?} with {} occupied stripes can not become a victim",
                segment,
                state,
                contexts.segment.occupied_stripes(segment)
            )));
        }
        contexts.allocator.set_segment_state(segment, SegmentState::Victim);
        self.try_reclaim(&mut contexts, segment)?;
        Ok(())
    }

    /// Suspends every new grant. Calls nest; allocation resumes once
    /// each call has been matched by `turn_on_blk_allocation`. When
    /// this returns no grant is in progress.
    pub fn turn_off_blk_allocation(&self) {
        let _contexts = self.ctx.ctx_lock();
        let depth = self.suspend_depth.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("block allocation turned off (depth {})", depth);
    }

    pub fn turn_on_blk_allocation(&self) {
        let _contexts = self.ctx.ctx_lock();
        let prev = self.suspend_depth.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |depth| depth.checked_sub(1),
        );
        match prev {
            Ok(prev) => log::debug!("block allocation turned on (depth {})", prev - 1),
            Err(_) => log::warn!("turn_on_blk_allocation without a matching turn off"),
        }
    }

    pub fn is_blk_allocation_on(&self) -> bool {
        self.suspend_depth.load(Ordering::Acquire) == 0
    }

    /// Refuses new user grants for `stream`, e.g. while its volume is
    /// being deleted.
    pub fn prohibit_user_blk_allocation(&self, stream: StreamId) -> Result<()> {
        self.set_prohibited(stream, true)
    }

    pub fn permit_user_blk_allocation(&self, stream: StreamId) -> Result<()> {
        self.set_prohibited(stream, false)
    }

    pub fn is_user_blk_allocation_prohibited(&self, stream: StreamId) -> bool {
        self.prohibited
            .get(stream as usize)
            .is_some_and(|p| p.load(Ordering::Acquire))
    }

    fn set_prohibited(&self, stream: StreamId, prohibited: bool) -> Result<()> {
        let flag = self.prohibited.get(stream as usize).ok_or_else(|| {
            Error::Unsupported(format!("stream {} is out of range", stream))
        })?;
        let _contexts = self.ctx.ctx_lock();
        flag.store(prohibited, Ordering::Release);
        Ok(())
    }
}
