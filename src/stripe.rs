use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::drain::DrainCounter;
use crate::result::bug_unless;
use crate::*;

/// Lifecycle of an in-memory stripe.
///
/// `Open` stripes are reachable by `wb_lsid` and accept new grants.
/// `Finalizing` stripes accept no new grants and are draining their
/// outstanding writers. `Flushed` stripes have been destaged and are
/// reachable by `vsid` through the stripe map. `Free` stripes have
/// returned their write-buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeState {
    Open,
    Finalizing,
    Flushed,
    Free,
}

#[derive(Debug)]
struct StripeInner {
    state: StripeState,
    // blocks handed out before the seal; fixed once finalizing
    granted: u32,
    user_lsid: Option<StripeId>,
    ssd_lsid: Option<u64>,
    reverse_map: Vec<Option<u64>>,
}

/// A write-buffer stripe: a fixed number of blocks that are filled by
/// one stream and then destaged to the user area as a unit.
#[derive(Debug)]
pub struct Stripe {
    wb_lsid: StripeId,
    vsid: StripeId,
    tail_idx: TailIdx,
    blks_per_stripe: u32,
    refs: DrainCounter,
    written: AtomicU32,
    inner: Mutex<StripeInner>,
    // held from drain until the slot is freed
    finalize: Mutex<()>,
}

impl Stripe {
    pub(crate) fn new(
        wb_lsid: StripeId,
        vsid: StripeId,
        tail_idx: TailIdx,
        blks_per_stripe: u32,
    ) -> Stripe {
        Stripe {
            wb_lsid,
            vsid,
            tail_idx,
            blks_per_stripe,
            refs: DrainCounter::default(),
            written: AtomicU32::new(0),
            inner: Mutex::new(StripeInner {
                state: StripeState::Open,
                granted: 0,
                user_lsid: None,
                ssd_lsid: None,
                reverse_map: vec![None; blks_per_stripe as usize],
            }),
            finalize: Mutex::new(()),
        }
    }

    pub fn wb_lsid(&self) -> StripeId {
        self.wb_lsid
    }

    pub fn vsid(&self) -> StripeId {
        self.vsid
    }

    pub fn tail_idx(&self) -> TailIdx {
        self.tail_idx
    }

    pub fn blks_per_stripe(&self) -> u32 {
        self.blks_per_stripe
    }

    pub fn state(&self) -> StripeState {
        self.inner.lock().state
    }

    /// Blocks handed out to writers. Only final once the stripe
    /// is no longer `Open`.
    pub fn granted_blks(&self) -> u32 {
        self.inner.lock().granted
    }

    /// Blocks whose writers have completed.
    pub fn written_blks(&self) -> u32 {
        self.written.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.count()
    }

    pub fn user_lsid(&self) -> Option<StripeId> {
        self.inner.lock().user_lsid
    }

    /// The destage sequence number stamped when the stripe was flushed.
    pub fn ssd_lsid(&self) -> Option<u64> {
        self.inner.lock().ssd_lsid
    }

    /// Records the logical address written at `offset`.
    pub fn update_reverse_map(&self, offset: BlkOffset, rba: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        bug_unless!(
            offset < BlkOffset::from(self.blks_per_stripe),
            "reverse map offset {} out of range for stripe {}",
            offset,
            self.vsid
        );
        inner.reverse_map[offset as usize] = Some(rba);
        Ok(())
    }

    pub fn reverse_map_entry(&self, offset: BlkOffset) -> Option<u64> {
        self.inner.lock().reverse_map.get(offset as usize).copied().flatten()
    }

    pub(crate) fn refer(&self) -> bool {
        self.refs.refer()
    }

    pub(crate) fn derefer(&self, written_blks: u32) -> Result<()> {
        self.refs.derefer()?;
        self.written.fetch_add(written_blks, Ordering::AcqRel);
        Ok(())
    }

    /// Stops accepting grants. `granted` is the tail offset reached
    /// while the stripe was open. Returns `false` if already sealed.
    pub(crate) fn seal(&self, granted: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != StripeState::Open {
            return false;
        }
        inner.state = StripeState::Finalizing;
        inner.granted = granted.min(self.blks_per_stripe);
        drop(inner);

        let sealed = self.refs.seal();
        debug_assert!(sealed);
        log::trace!(
            "sealed stripe vsid {} wb_lsid {} with {} granted blocks",
            self.vsid,
            self.wb_lsid,
            granted
        );
        true
    }

    /// Serializes finalizers of this stripe. Taken before the context
    /// lock.
    pub(crate) fn lock_finalize(&self) -> MutexGuard<'_, ()> {
        self.finalize.lock()
    }

    pub(crate) fn wait_for_drain(&self) {
        self.refs.wait_for_drain();
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.refs.is_sealed() && self.refs.is_drained()
    }

    pub(crate) fn set_user_lsid(&self, user_lsid: StripeId) {
        self.inner.lock().user_lsid = Some(user_lsid);
    }

    pub(crate) fn mark_flushed(&self, ssd_lsid: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        bug_unless!(
            inner.state == StripeState::Finalizing,
            "stripe {} flushed from state {:?}",
            self.vsid,
            inner.state
        );
        inner.state = StripeState::Flushed;
        inner.ssd_lsid = Some(ssd_lsid);
        Ok(())
    }

    pub(crate) fn mark_free(&self) {
        self.inner.lock().state = StripeState::Free;
    }

    /// Marks `[0, blks)` as written by writers that completed before
    /// a restart. Used while reconstructing stripes.
    pub(crate) fn restore_written(&self, blks: u32) {
        self.written.store(blks.min(self.blks_per_stripe), Ordering::Release);
    }
}

/// Owns every in-memory stripe, indexed by write-buffer slot, and the
/// per-stream queues of stripes that filled up but are not flushed yet.
///
/// Lock order: the context lock, when held, is always taken first.
#[derive(Debug)]
pub(crate) struct StripeTable {
    by_wb_lsid: Mutex<Vec<Option<Arc<Stripe>>>>,
    pending_full: Mutex<Vec<Vec<Arc<Stripe>>>>,
}

impl StripeTable {
    pub fn new(info: &AddressInfo) -> StripeTable {
        StripeTable {
            by_wb_lsid: Mutex::new(vec![None; info.num_wb_stripes() as usize]),
            pending_full: Mutex::new(vec![vec![]; info.num_streams() as usize]),
        }
    }

    pub fn insert(&self, stripe: Arc<Stripe>) -> Result<()> {
        let mut slots = self.by_wb_lsid.lock();
        let slot = &mut slots[stripe.wb_lsid() as usize];
        bug_unless!(
            slot.is_none(),
            "write-buffer slot {} already holds a stripe",
            stripe.wb_lsid()
        );
        *slot = Some(stripe);
        Ok(())
    }

    pub fn get(&self, wb_lsid: StripeId) -> Option<Arc<Stripe>> {
        self.by_wb_lsid.lock().get(wb_lsid as usize).cloned().flatten()
    }

    pub fn remove(&self, wb_lsid: StripeId) -> Option<Arc<Stripe>> {
        self.by_wb_lsid.lock().get_mut(wb_lsid as usize)?.take()
    }

    pub fn live_count(&self) -> usize {
        self.by_wb_lsid.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn push_pending(&self, stream: StreamId, stripe: Arc<Stripe>) {
        self.pending_full.lock()[stream as usize].push(stripe);
    }

    pub fn take_pending(&self, stream: StreamId) -> Vec<Arc<Stripe>> {
        std::mem::take(&mut self.pending_full.lock()[stream as usize])
    }

    pub fn take_all_pending(&self) -> Vec<Arc<Stripe>> {
        let mut pending = self.pending_full.lock();
        pending.iter_mut().flat_map(std::mem::take).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_full.lock().iter().map(Vec::len).sum()
    }

    /// Every in-memory stripe of `stream`, including the ones a
    /// finalizer already took off the pending queue.
    pub fn of_stream(&self, stream: StreamId, num_streams: u32) -> Vec<Arc<Stripe>> {
        self.by_wb_lsid
            .lock()
            .iter()
            .flatten()
            .filter(|stripe| stripe.tail_idx().stream(num_streams) == stream)
            .cloned()
            .collect()
    }
}
