use std::fmt;
use std::io;
use std::sync::Arc;

use crate::result::bug_unless;
use crate::stripe::StripeTable;
use crate::*;

/// Destages the contents of a write-buffer stripe into the user area.
///
/// `flush` is called once per stripe after every writer has drained
/// and before any metadata is updated. It must return only once the
/// stripe is durable.
pub trait StripeFlusher: Send + Sync + fmt::Debug {
    fn flush(&self, stripe: &Stripe) -> io::Result<()>;
}

/// A flusher for callers that keep stripe contents elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlusher;

impl StripeFlusher for NoopFlusher {
    fn flush(&self, _stripe: &Stripe) -> io::Result<()> {
        Ok(())
    }
}

/// Owns the lifecycle of write-buffer stripes: opening is done by the
/// `BlockManager`, everything after that happens here.
///
/// ```text
/// Open ──seal──▶ Finalizing ──drain + flush──▶ Flushed ──▶ Free
/// ```
///
/// A stripe is sealed either when its tail fills up, in which case it
/// waits on its stream's pending queue, or when it is detached by
/// `pick_active_stripe`. Finalizing blocks until every writer that was
/// granted blocks in the stripe has called `derefer_lsid_cnt`.
#[derive(Debug)]
pub struct WbStripeManager {
    info: AddressInfo,
    ctx: Arc<ContextManager>,
    stripes: Arc<StripeTable>,
    stripe_map: Arc<dyn StripeMap>,
    flusher: Arc<dyn StripeFlusher>,
    block_manager: Arc<BlockManager>,
}

impl WbStripeManager {
    pub(crate) fn new(
        info: AddressInfo,
        ctx: Arc<ContextManager>,
        stripes: Arc<StripeTable>,
        stripe_map: Arc<dyn StripeMap>,
        flusher: Arc<dyn StripeFlusher>,
        block_manager: Arc<BlockManager>,
    ) -> WbStripeManager {
        WbStripeManager { info, ctx, stripes, stripe_map, flusher, block_manager }
    }

    /// Rebuilds the in-memory stripe of every active tail that the
    /// stripe map still places in the write buffer, then requeues the
    /// sealed stripes that still hold a slot without a tail. Must run
    /// after the contexts have been loaded.
    pub fn init(&self) -> Result<()> {
        let blks_per_stripe = BlkOffset::from(self.info.blks_per_stripe());
        let mut contexts = self.ctx.ctx_lock();
        let mut reconstructed = 0;

        for stream in 0..self.info.num_streams() {
            for idx in self.info.tails_of_stream(stream) {
                let tail = contexts.wb_stripe.tail(idx);
                if tail.is_unmap() {
                    continue;
                }

                let addr = match self.stripe_map.get_lsa(tail.stripe_id) {
                    Some(addr) if addr.is_in_write_buffer() => addr,
                    other => {
                        log::warn!(
                            "dropping tail {:?} of stream {}: stripe map has {:?}",
                            tail,
                            stream,
                            other
                        );
                        contexts.wb_stripe.set_active_stripe_tail(idx, UNMAP_VSA);
                        continue;
                    }
                };

                self.reconstruct_locked(&mut contexts, stream, addr.stripe_id, tail, idx)?;
                if tail.offset >= blks_per_stripe {
                    self.finish_locked(addr.stripe_id, tail)?;
                }
                reconstructed += 1;
            }
        }

        let requeued = self.recover_detached_locked(&mut contexts)?;

        let allocated = contexts.wb_stripe.allocated_wb_stripe_count() as usize;
        let live = self.stripes.live_count();
        if allocated != live {
            log::warn!(
                "recovery validation: {} write-buffer stripes allocated but {} in memory",
                allocated,
                live
            );
        }
        log::debug!(
            "reconstructed {} active stripes, requeued {} sealed stripes",
            reconstructed,
            requeued
        );
        Ok(())
    }

    /// Walks the allocated slots that no tail led to. A slot whose
    /// owner the stripe map still places there is a sealed stripe that
    /// never got destaged: it is rebuilt and queued for the next sweep.
    /// Any other slot is stale and released.
    fn recover_detached_locked(&self, contexts: &mut Contexts) -> Result<usize> {
        let detached: Vec<StripeId> = contexts
            .wb_stripe
            .allocated_wb_stripes()
            .filter(|wb_lsid| self.stripes.get(*wb_lsid).is_none())
            .collect();

        let mut requeued = 0;
        for wb_lsid in detached {
            let owner = contexts.wb_stripe.slot_owner(wb_lsid).filter(|owner| {
                owner.tail_idx.0 < self.info.tail_array_len()
                    && owner.granted <= self.info.blks_per_stripe()
                    && self.stripe_map.get_lsa(owner.vsid)
                        == Some(StripeAddr::in_write_buffer(wb_lsid))
            });

            let Some(owner) = owner else {
                log::warn!(
                    "releasing stale write-buffer slot {} owned by {:?}",
                    wb_lsid,
                    contexts.wb_stripe.slot_owner(wb_lsid)
                );
                contexts.wb_stripe.release_wb_stripe(wb_lsid)?;
                continue;
            };

            let stripe = Arc::new(Stripe::new(
                wb_lsid,
                owner.vsid,
                owner.tail_idx,
                self.info.blks_per_stripe(),
            ));
            stripe.restore_written(owner.granted);
            stripe.seal(owner.granted);
            self.stripes.insert(stripe.clone())?;

            let stream = owner.tail_idx.stream(self.info.num_streams());
            self.stripes.push_pending(stream, stripe);
            log::debug!(
                "requeued sealed stripe {} in wb slot {} with {} blocks",
                owner.vsid,
                wb_lsid,
                owner.granted
            );
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Looks up an in-memory stripe. Stripes that already live in the
    /// user area are no longer held in memory.
    pub fn get_stripe(&self, addr: StripeAddr) -> Option<Arc<Stripe>> {
        if addr.is_in_write_buffer() {
            self.stripes.get(addr.stripe_id)
        } else {
            None
        }
    }

    pub fn get_stripe_by_wb_lsid(&self, wb_lsid: StripeId) -> Option<Arc<Stripe>> {
        self.stripes.get(wb_lsid)
    }

    /// Chooses the user-area stripe a finalizing stripe destages to.
    /// User-area stripes map one to one onto virtual stripes.
    pub fn allocate_user_data_stripe_id(&self, vsid: StripeId) -> StripeId {
        vsid
    }

    /// Returns the write-buffer slot of a drained stripe.
    pub fn free_wb_stripe_id(&self, wb_lsid: StripeId) -> Result<()> {
        let mut contexts = self.ctx.ctx_lock();
        self.free_wb_stripe_locked(&mut contexts, wb_lsid)
    }

    fn free_wb_stripe_locked(
        &self,
        contexts: &mut Contexts,
        wb_lsid: StripeId,
    ) -> Result<()> {
        if let Some(stripe) = self.stripes.get(wb_lsid) {
            bug_unless!(
                stripe.ref_count() == 0,
                "freeing write-buffer stripe {} with {} outstanding writers",
                wb_lsid,
                stripe.ref_count()
            );
        }
        contexts.wb_stripe.release_wb_stripe(wb_lsid)?;
        if let Some(stripe) = self.stripes.remove(wb_lsid) {
            stripe.mark_free();
        }
        log::trace!("freed write-buffer stripe {}", wb_lsid);
        Ok(())
    }

    /// Brackets an in-flight write. Returns `false` when the stripe is
    /// gone or already finalizing, in which case nothing was taken.
    pub fn refer_lsid_cnt(&self, addr: &StripeAddr) -> bool {
        self.get_stripe(*addr).is_some_and(|stripe| stripe.refer())
    }

    /// Ends a write bracket opened by a grant or by `refer_lsid_cnt`,
    /// crediting `block_count` written blocks to the stripe.
    pub fn derefer_lsid_cnt(&self, addr: &StripeAddr, block_count: u32) -> Result<()> {
        match self.get_stripe(*addr) {
            Some(stripe) => stripe.derefer(block_count),
            None => Err(Error::ReportableBug(format!(
                "dereferencing {:?} which is not an in-memory stripe",
                addr
            ))),
        }
    }

    /// Detaches every stripe of `stream`: the ones already full and
    /// waiting, then the open ones, which are sealed at their current
    /// tail. The stream's tails are reset.
    pub fn pick_active_stripe(
        &self,
        contexts: &mut Contexts,
        stream: StreamId,
    ) -> Result<Vec<Arc<Stripe>>> {
        if stream >= self.info.num_streams() {
            return Err(Error::Unsupported(format!(
                "stream {} is out of range",
                stream
            )));
        }

        let blks_per_stripe = BlkOffset::from(self.info.blks_per_stripe());
        let mut picked = vec![];
        for stripe in self.stripes.take_pending(stream) {
            push_unique(&mut picked, stripe);
        }

        for idx in self.info.tails_of_stream(stream) {
            let tail = contexts.wb_stripe.tail(idx);
            if tail.is_unmap() {
                continue;
            }
            contexts.wb_stripe.set_active_stripe_tail(idx, UNMAP_VSA);

            if tail.offset >= blks_per_stripe {
                // sealed when it filled up, and queued as pending
                continue;
            }

            let stripe = self.stripe_of_vsid(tail.stripe_id)?;
            if stripe.seal(tail.offset as u32) {
                push_unique(&mut picked, stripe);
            }
        }

        // stripes a concurrent finalizer is still working on
        for stripe in self.stripes.of_stream(stream, self.info.num_streams()) {
            push_unique(&mut picked, stripe);
        }

        log::debug!("picked {} stripes of stream {}", picked.len(), stream);
        Ok(picked)
    }

    fn stripe_of_vsid(&self, vsid: StripeId) -> Result<Arc<Stripe>> {
        self.stripe_map
            .get_lsa(vsid)
            .and_then(|addr| self.get_stripe(addr))
            .filter(|stripe| stripe.vsid() == vsid)
            .ok_or_else(|| {
                Error::ReportableBug(format!(
                    "active stripe {} is missing from the write buffer",
                    vsid
                ))
            })
    }

    /// Destages each stripe: waits for its writers to drain, flushes
    /// it, then moves it into the user area and frees its slot. A
    /// failure does not stop the rest of the batch; the first error is
    /// returned once every stripe has been tried.
    pub fn finalize_write_io(&self, stripes: Vec<Arc<Stripe>>) -> Result<()> {
        let mut first_error = None;
        for stripe in stripes {
            if let Err(e) = self.finalize_stripe(&stripe) {
                log::error!("failed to finalize stripe {}: {}", stripe.vsid(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// A stripe whose flush fails goes back on its stream's pending
    /// queue, still holding its slot, so that a later sweep or flush
    /// retries it.
    fn finalize_stripe(&self, stripe: &Arc<Stripe>) -> Result<()> {
        let _finalizing = stripe.lock_finalize();

        match stripe.state() {
            StripeState::Flushed | StripeState::Free => {
                log::debug!("stripe {} is already finalized", stripe.vsid());
                return Ok(());
            }
            StripeState::Open => self.seal_at_tail(stripe),
            StripeState::Finalizing => {}
        }

        stripe.wait_for_drain();

        if let Err(e) = self.flusher.flush(stripe) {
            let stream = stripe.tail_idx().stream(self.info.num_streams());
            log::warn!("requeueing stripe {} after failed flush: {}", stripe.vsid(), e);
            self.stripes.push_pending(stream, stripe.clone());
            return Err(e.into());
        }

        let vsid = stripe.vsid();
        let user_lsid = self.allocate_user_data_stripe_id(vsid);
        stripe.set_user_lsid(user_lsid);

        let segment = self.info.segment_of(vsid);
        let mut contexts = self.ctx.ctx_lock();

        if contexts.allocator.state(segment) == SegmentState::WriteBufferArea {
            contexts.allocator.set_segment_state(segment, SegmentState::DataArea);
        }
        let full = contexts.segment.increase_occupied_stripe_count(segment)?;
        contexts
            .segment
            .increase_valid_block_count(segment, stripe.granted_blks())?;

        let ssd_lsid = contexts.allocator.advance_ssd_lsid();
        stripe.mark_flushed(ssd_lsid)?;
        self.stripe_map.set_lsa(vsid, StripeAddr::in_user_area(user_lsid));

        self.free_wb_stripe_locked(&mut contexts, stripe.wb_lsid())?;

        if full {
            self.block_manager.try_reclaim(&mut contexts, segment)?;
        }

        log::debug!(
            "finalized stripe {} ({} blocks) into segment {} as ssd lsid {}",
            vsid,
            stripe.granted_blks(),
            segment,
            ssd_lsid
        );
        Ok(())
    }

    /// Seals a stripe handed to finalize while still open, detaching
    /// it from its tail first.
    fn seal_at_tail(&self, stripe: &Stripe) {
        let mut contexts = self.ctx.ctx_lock();
        let tail = contexts.wb_stripe.tail(stripe.tail_idx());
        let granted = if tail.stripe_id == stripe.vsid() {
            contexts
                .wb_stripe
                .set_active_stripe_tail(stripe.tail_idx(), UNMAP_VSA);
            tail.offset as u32
        } else {
            stripe.blks_per_stripe()
        };
        stripe.seal(granted);
    }

    fn detach_all(&self, contexts: &mut Contexts) -> Result<Vec<Arc<Stripe>>> {
        let mut picked = vec![];
        for stream in 0..self.info.num_streams() {
            picked.extend(self.pick_active_stripe(contexts, stream)?);
        }
        Ok(picked)
    }

    /// Finalizes every open and pending stripe of every stream. A
    /// second call with no writes in between changes nothing.
    pub fn flush_all_active_stripes(&self) -> Result<()> {
        let picked = {
            let mut contexts = self.ctx.ctx_lock();
            self.detach_all(&mut contexts)?
        };
        if !picked.is_empty() {
            log::info!("flushing {} active stripes", picked.len());
        }
        self.finalize_write_io(picked)
    }

    /// Seals and detaches every active stripe without finalizing
    /// them, for a caller that finalizes later. Block allocation must
    /// be turned off so the result is a consistent snapshot.
    pub fn check_all_active_stripes(&self) -> Result<Vec<Arc<Stripe>>> {
        if self.block_manager.is_blk_allocation_on() {
            return Err(Error::Unsupported(
                "checking all active stripes requires block allocation to be turned off"
                    .into(),
            ));
        }
        let mut contexts = self.ctx.ctx_lock();
        self.detach_all(&mut contexts)
    }

    /// Finalizes the stripes that filled up since the last sweep,
    /// returning how many there were.
    pub fn flush_pending_active_stripes(&self) -> Result<usize> {
        let pending = self.stripes.take_all_pending();
        let count = pending.len();
        self.finalize_write_io(pending)?;
        if count > 0 {
            log::trace!("swept {} pending full stripes", count);
        }
        Ok(count)
    }

    /// Recreates the in-memory stripe behind a persisted tail. Blocks
    /// below the tail are treated as written.
    pub fn reconstruct_active_stripe(
        &self,
        stream: StreamId,
        wb_lsid: StripeId,
        tail: VirtualBlkAddr,
        idx: TailIdx,
    ) -> Result<Arc<Stripe>> {
        let mut contexts = self.ctx.ctx_lock();
        self.reconstruct_locked(&mut contexts, stream, wb_lsid, tail, idx)
    }

    fn reconstruct_locked(
        &self,
        contexts: &mut Contexts,
        stream: StreamId,
        wb_lsid: StripeId,
        tail: VirtualBlkAddr,
        idx: TailIdx,
    ) -> Result<Arc<Stripe>> {
        let blks_per_stripe = BlkOffset::from(self.info.blks_per_stripe());
        if stream >= self.info.num_streams()
            || !self.info.tails_of_stream(stream).any(|i| i == idx)
            || wb_lsid >= self.info.num_wb_stripes()
            || tail.is_unmap()
            || tail.stripe_id >= self.info.num_user_stripes()
            || tail.offset > blks_per_stripe
        {
            return Err(Error::Unsupported(format!(
                "can not reconstruct stripe at {:?} in wb slot {} for tail {:?} of stream {}",
                tail, wb_lsid, idx, stream
            )));
        }

        let stripe = Arc::new(Stripe::new(
            wb_lsid,
            tail.stripe_id,
            idx,
            self.info.blks_per_stripe(),
        ));
        stripe.restore_written(tail.offset as u32);
        self.stripes.insert(stripe.clone())?;

        contexts.wb_stripe.mark_wb_stripe_allocated(wb_lsid);
        contexts.wb_stripe.set_slot_owner(
            wb_lsid,
            WbSlotOwner { vsid: tail.stripe_id, tail_idx: idx, granted: tail.offset as u32 },
        );
        contexts.wb_stripe.set_active_stripe_tail(idx, tail);
        self.stripe_map.set_lsa(tail.stripe_id, StripeAddr::in_write_buffer(wb_lsid));

        log::debug!(
            "reconstructed stripe {} in wb slot {} at {:?}",
            tail.stripe_id,
            wb_lsid,
            tail
        );
        Ok(stripe)
    }

    /// Completes reconstruction of a stripe. A stripe whose tail
    /// reached its end is sealed and queued for the next sweep.
    pub fn finish_reconstructed_stripe(
        &self,
        wb_lsid: StripeId,
        tail: VirtualBlkAddr,
    ) -> Result<()> {
        let _contexts = self.ctx.ctx_lock();
        self.finish_locked(wb_lsid, tail)
    }

    fn finish_locked(&self, wb_lsid: StripeId, tail: VirtualBlkAddr) -> Result<()> {
        let Some(stripe) = self.stripes.get(wb_lsid) else {
            return Err(Error::Unsupported(format!(
                "no reconstructed stripe in wb slot {}",
                wb_lsid
            )));
        };
        let full = tail.offset >= BlkOffset::from(self.info.blks_per_stripe());
        if full && stripe.seal(self.info.blks_per_stripe()) {
            let stream = stripe.tail_idx().stream(self.info.num_streams());
            self.stripes.push_pending(stream, stripe);
        }
        Ok(())
    }

    /// Replays a tail entry from persisted state, reserving its
    /// write-buffer slot.
    pub fn restore_active_stripe_tail(
        &self,
        idx: TailIdx,
        tail: VirtualBlkAddr,
        wb_lsid: StripeId,
    ) -> Result<()> {
        if idx.0 >= self.info.tail_array_len()
            || wb_lsid >= self.info.num_wb_stripes()
        {
            return Err(Error::Unsupported(format!(
                "can not restore tail {:?} in wb slot {}",
                idx, wb_lsid
            )));
        }
        let mut contexts = self.ctx.ctx_lock();
        contexts.wb_stripe.set_active_stripe_tail(idx, tail);
        contexts.wb_stripe.mark_wb_stripe_allocated(wb_lsid);
        if !tail.is_unmap() {
            contexts.wb_stripe.set_slot_owner(
                wb_lsid,
                WbSlotOwner {
                    vsid: tail.stripe_id,
                    tail_idx: idx,
                    granted: tail.offset.min(BlkOffset::from(self.info.blks_per_stripe()))
                        as u32,
                },
            );
            self.stripe_map.set_lsa(tail.stripe_id, StripeAddr::in_write_buffer(wb_lsid));
        }
        Ok(())
    }

    /// Freezes the write path, destages everything in flight, and
    /// records every segment holding data as a rebuild target.
    pub fn prepare_rebuild(&self) -> Result<()> {
        self.block_manager.turn_off_blk_allocation();
        let result = self
            .flush_all_active_stripes()
            .and_then(|()| self.ctx.make_rebuild_target());
        self.block_manager.turn_on_blk_allocation();
        result.map(drop)
    }

    pub fn stop_rebuilding(&self) -> Result<()> {
        self.ctx.stop_rebuilding()
    }
}

fn push_unique(picked: &mut Vec<Arc<Stripe>>, stripe: Arc<Stripe>) {
    // a slot can be reused, so compare stripes rather than slots
    if !picked.iter().any(|p| Arc::ptr_eq(p, &stripe)) {
        picked.push(stripe);
    }
}
