use quickcheck::{Arbitrary, Gen};

use stripealloc::{
    Config, Error, MemMetaStorage, MemStripeMap, StripeMap, VirtualBlks,
};

use super::common;

const NUM_STREAMS: u32 = 2;
const BLKS_PER_STRIPE: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub enum Op {
    Alloc { stream: u32, blks: u32 },
    AllocGc { stream: u32, blks: u32 },
    Complete,
    FlushPending,
    FlushAll,
    Unmount(u32),
    Invalidate,
    Restart,
    Crash,
}

use self::Op::*;

fn range(g: &mut Gen, min_inclusive: u32, max_exclusive: u32) -> u32 {
    assert!(max_exclusive > min_inclusive);
    min_inclusive + u32::arbitrary(g) % (max_exclusive - min_inclusive)
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        if range(g, 0, 20) == 0 {
            return if bool::arbitrary(g) { Restart } else { Crash };
        }

        let stream = range(g, 0, NUM_STREAMS);
        match range(g, 0, 9) {
            0 | 1 | 2 => Alloc { stream, blks: range(g, 1, 2 * BLKS_PER_STRIPE) },
            3 => AllocGc { stream, blks: range(g, 1, BLKS_PER_STRIPE + 1) },
            4 => Complete,
            5 => FlushPending,
            6 => FlushAll,
            7 => Unmount(stream),
            8 => Invalidate,
            _ => panic!("impossible choice"),
        }
    }
}

pub fn config() -> Config {
    Config::new()
        .num_segments(4)
        .stripes_per_segment(2)
        .blks_per_stripe(BLKS_PER_STRIPE)
        .num_wb_stripes(4)
        .num_streams(NUM_STREAMS)
        .tails_per_stream(2)
        .flush_every_ms(None)
}

/// Drives an allocator with `ops` and checks its bookkeeping after
/// every step.
pub fn prop_allocator_keeps_invariants(ops: Vec<Op>) -> bool {
    common::setup_logger();

    let config = config();
    let meta = MemMetaStorage::default();
    let stripe_map = MemStripeMap::default();
    let mut allocator = common::open_on(&config, &meta, &stripe_map);

    // grants whose writers have not completed yet
    let mut in_flight: Vec<VirtualBlks> = vec![];
    // grants completed but possibly still in the write buffer
    let mut completed: Vec<VirtualBlks> = vec![];
    // grants known to be destaged and still valid
    let mut destaged: Vec<VirtualBlks> = vec![];

    let mut granted_total: u64 = 0;
    let mut invalidated_total: u64 = 0;

    let complete_all = |in_flight: &mut Vec<VirtualBlks>,
                        completed: &mut Vec<VirtualBlks>,
                        allocator: &stripealloc::Allocator| {
        for blks in in_flight.drain(..) {
            let addr = stripe_map.get_lsa(blks.start.stripe_id).unwrap();
            assert!(addr.is_in_write_buffer());
            allocator
                .wb_stripe_manager()
                .derefer_lsid_cnt(&addr, blks.num_blks)
                .unwrap();
            completed.push(blks);
        }
    };

    for op in ops {
        match op {
            Alloc { stream, blks } | AllocGc { stream, blks } => {
                let bm = allocator.block_manager();
                let tails_before = allocator
                    .context_manager()
                    .context_section(stripealloc::ContextSection::ActiveStripeTail);

                let res = if let Alloc { .. } = op {
                    bm.allocate_blocks(stream, blks)
                } else {
                    bm.allocate_gc_blocks(stream, blks)
                };

                match res {
                    Ok(grant) => {
                        assert!(grant.num_blks >= 1);
                        assert!(grant.num_blks <= blks);
                        assert!(grant.end_offset() <= u64::from(BLKS_PER_STRIPE));
                        granted_total += u64::from(grant.num_blks);
                        in_flight.push(grant);
                    }
                    Err(Error::NoFreeWbStripe) | Err(Error::NoFreeSegment) => {
                        let tails_after = allocator.context_manager().context_section(
                            stripealloc::ContextSection::ActiveStripeTail,
                        );
                        assert_eq!(tails_before, tails_after);
                    }
                    Err(other) => panic!("unexpected allocation failure {:?}", other),
                }
            }
            Complete => {
                if !in_flight.is_empty() {
                    let blks = in_flight.remove(0);
                    let addr = stripe_map.get_lsa(blks.start.stripe_id).unwrap();
                    allocator
                        .wb_stripe_manager()
                        .derefer_lsid_cnt(&addr, blks.num_blks)
                        .unwrap();
                    completed.push(blks);
                }
            }
            FlushPending => {
                complete_all(&mut in_flight, &mut completed, &allocator);
                allocator.wb_stripe_manager().flush_pending_active_stripes().unwrap();
            }
            Unmount(stream) => {
                complete_all(&mut in_flight, &mut completed, &allocator);
                allocator.volume_unmounted(stream).unwrap();
            }
            FlushAll => {
                complete_all(&mut in_flight, &mut completed, &allocator);
                allocator.wb_stripe_manager().flush_all_active_stripes().unwrap();
                destaged.append(&mut completed);

                let cm = allocator.context_manager();
                let contexts = cm.ctx_lock();
                let valid: u64 = (0..config.num_segments)
                    .map(|seg| u64::from(contexts.segment_ctx().valid_block_count(seg).unwrap()))
                    .sum();
                assert_eq!(valid, granted_total - invalidated_total);
                assert_eq!(contexts.wb_stripe_ctx().allocated_wb_stripe_count(), 0);
            }
            Invalidate => {
                if !destaged.is_empty() {
                    let blks = destaged.remove(0);
                    allocator.block_manager().invalidate_blks(blks).unwrap();
                    invalidated_total += u64::from(blks.num_blks);
                }
            }
            Restart => {
                complete_all(&mut in_flight, &mut completed, &allocator);
                allocator.dispose().unwrap();
                drop(allocator);
                destaged.append(&mut completed);
                allocator = common::open_on(&config, &meta, &stripe_map);

                let contexts = allocator.context_manager().ctx_lock();
                assert_eq!(contexts.wb_stripe_ctx().allocated_wb_stripe_count(), 0);
                assert!(
                    contexts
                        .wb_stripe_ctx()
                        .active_stripe_tails()
                        .iter()
                        .all(|tail| tail.is_unmap())
                );
            }
            Crash => {
                // the contexts reach the backend, then the process dies
                // without destaging anything
                complete_all(&mut in_flight, &mut completed, &allocator);
                allocator.context_manager().flush_contexts_sync().unwrap();
                std::mem::forget(allocator);
                allocator = common::open_on(&config, &meta, &stripe_map);

                let wbm = allocator.wb_stripe_manager();
                let contexts = allocator.context_manager().ctx_lock();
                for wb_lsid in contexts.wb_stripe_ctx().allocated_wb_stripes() {
                    assert!(
                        wbm.get_stripe_by_wb_lsid(wb_lsid).is_some(),
                        "write-buffer slot {} leaked across a crash",
                        wb_lsid
                    );
                }
            }
        }

        let info = *allocator.address_info();
        let contexts = allocator.context_manager().ctx_lock();
        for seg in 0..info.num_segments() {
            assert!(contexts.segment_ctx().valid_block_count(seg).unwrap() <= info.blks_per_segment());
            assert!(
                contexts.segment_ctx().occupied_stripe_count(seg).unwrap()
                    <= info.stripes_per_segment()
            );
        }
        let wb = contexts.wb_stripe_ctx();
        assert!(wb.allocated_wb_stripe_count() <= wb.num_total_wb_stripes());
        for tail in wb.active_stripe_tails() {
            assert!(tail.is_unmap() || tail.offset <= u64::from(BLKS_PER_STRIPE));
        }
    }

    complete_all(&mut in_flight, &mut completed, &allocator);
    true
}
