use std::fmt::Write as _;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{ALLOCATOR_CTX_FILE, REBUILD_CTX_FILE};
use crate::stripe::StripeTable;
use crate::sweeper::Sweeper;
use crate::*;

/// The allocator of one storage array: wires the context manager,
/// block manager and write-buffer stripe manager together and owns
/// their lifecycle.
///
/// Dropping an `Allocator` disposes it, destaging every active stripe
/// and persisting the contexts.
#[derive(Debug)]
pub struct Allocator {
    config: Config,
    info: AddressInfo,
    meta: Arc<dyn MetaStorage>,
    context_manager: Arc<ContextManager>,
    block_manager: Arc<BlockManager>,
    wb_stripe_manager: Arc<WbStripeManager>,
    // Some while initialized
    running: Mutex<Option<Option<Sweeper>>>,
}

impl Allocator {
    pub fn new(
        config: Config,
        meta: Arc<dyn MetaStorage>,
        stripe_map: Arc<dyn StripeMap>,
        flusher: Arc<dyn StripeFlusher>,
    ) -> Result<Allocator> {
        let info = AddressInfo::from_config(&config)?;

        let context_manager = Arc::new(ContextManager::new(
            info,
            meta.clone(),
            config.gc_threshold,
            config.urgent_threshold,
        ));
        let stripes = Arc::new(StripeTable::new(&info));
        let block_manager = Arc::new(BlockManager::new(
            info,
            context_manager.clone(),
            stripes.clone(),
            stripe_map.clone(),
        ));
        let wb_stripe_manager = Arc::new(WbStripeManager::new(
            info,
            context_manager.clone(),
            stripes,
            stripe_map,
            flusher,
            block_manager.clone(),
        ));

        Ok(Allocator {
            config,
            info,
            meta,
            context_manager,
            block_manager,
            wb_stripe_manager,
            running: Mutex::new(None),
        })
    }

    /// Loads the contexts, reconstructs active stripes and starts the
    /// background sweeper. Calling it again does nothing.
    pub fn init(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        self.context_manager.init()?;
        self.wb_stripe_manager.init()?;

        let sweeper = match self.config.flush_every_ms {
            Some(every) => Some(Sweeper::new(
                "stripealloc_sweeper".into(),
                self.wb_stripe_manager.clone(),
                every,
            )?),
            None => None,
        };

        *running = Some(sweeper);
        log::debug!("allocator initialized with {:?}", self.info);
        Ok(())
    }

    /// Stops the sweeper, destages every active stripe, persists the
    /// contexts and releases the metadata files.
    pub fn dispose(&self) -> Result<()> {
        let mut running = self.running.lock();
        let Some(sweeper) = running.take() else {
            return Ok(());
        };
        drop(sweeper);

        self.wb_stripe_manager.flush_all_active_stripes()?;
        self.context_manager.flush_contexts_sync()?;
        self.context_manager.close()?;

        log::debug!("allocator disposed");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn address_info(&self) -> &AddressInfo {
        &self.info
    }

    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.block_manager
    }

    pub fn wb_stripe_manager(&self) -> &Arc<WbStripeManager> {
        &self.wb_stripe_manager
    }

    pub fn context_manager(&self) -> &Arc<ContextManager> {
        &self.context_manager
    }

    /// Destages the stripes of a stream whose volume went away. The
    /// stripes are detached under the context lock and finalized
    /// outside of it.
    pub fn volume_unmounted(&self, stream: StreamId) -> Result<()> {
        let picked = {
            let mut contexts = self.context_manager.ctx_lock();
            self.wb_stripe_manager.pick_active_stripe(&mut contexts, stream)?
        };
        log::info!(
            "stream {} unmounted, finalizing {} stripes",
            stream,
            picked.len()
        );
        self.wb_stripe_manager.finalize_write_io(picked)
    }

    /// Best-effort destage of all buffered user data.
    pub fn flush_all_user_data(&self) -> Result<()> {
        self.block_manager.turn_off_blk_allocation();
        let checked = self.wb_stripe_manager.check_all_active_stripes();
        self.block_manager.turn_on_blk_allocation();
        self.wb_stripe_manager.finalize_write_io(checked?)
    }

    pub fn set_gc_threshold(&self, threshold: u32) {
        self.context_manager.set_gc_threshold(threshold);
    }

    pub fn set_urgent_threshold(&self, threshold: u32) {
        self.context_manager.set_urgent_threshold(threshold);
    }

    pub fn current_ssd_lsid(&self) -> u64 {
        self.context_manager.ctx_lock().allocator_ctx().current_ssd_lsid()
    }

    /// Dumps one context section, headerless, into `file_name`.
    pub fn get_meta(&self, section: ContextSection, file_name: &str) -> Result<()> {
        let mut bytes = self.context_manager.context_section(section);

        let mut store = || -> io::Result<()> {
            let mut file = self.meta.file(file_name);
            file.create(bytes.len() as u64)?;
            file.open()?;
            file.issue_io(MetaIoOpcode::Write, 0, &mut bytes)?;
            file.close()
        };

        store().map_err(|cause| {
            log::error!("failed to store {:?} to {}: {}", section, file_name, cause);
            Error::ArchiveStore { file: file_name.to_owned(), cause }
        })?;

        log::info!("stored {:?} to {}", section, file_name);
        Ok(())
    }

    /// Restores one context section from a file written by `get_meta`.
    pub fn set_meta(&self, section: ContextSection, file_name: &str) -> Result<()> {
        let load = || -> io::Result<Vec<u8>> {
            let mut file = self.meta.file(file_name);
            file.open()?;
            let mut bytes = vec![0; file.size()? as usize];
            file.issue_io(MetaIoOpcode::Read, 0, &mut bytes)?;
            file.close()?;
            Ok(bytes)
        };

        let bytes = load().map_err(|cause| {
            log::error!("failed to load {:?} from {}: {}", section, file_name, cause);
            Error::ArchiveLoad { file: file_name.to_owned(), cause }
        })?;

        self.context_manager.set_context_section(section, &bytes)?;
        log::info!("loaded {:?} from {}", section, file_name);
        Ok(())
    }

    /// A human readable summary of the allocation state.
    pub fn instant_meta_info(&self) -> String {
        let contexts = self.context_manager.ctx_lock();
        let segment = contexts.segment_ctx();
        let wb_stripe = contexts.wb_stripe_ctx();
        let allocator = contexts.allocator_ctx();
        let (gc, urgent) = self.context_manager.gc_thresholds();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "allocated segments: {} / {}",
            allocator.allocated_segment_count(),
            allocator.total_segment_count()
        );
        let _ = writeln!(
            out,
            "allocated wb stripes: {} / {}",
            wb_stripe.allocated_wb_stripe_count(),
            wb_stripe.num_total_wb_stripes()
        );
        let _ = writeln!(out, "current ssd lsid: {}", allocator.current_ssd_lsid());
        let _ = writeln!(out, "gc threshold: {} urgent threshold: {}", gc, urgent);
        let _ = writeln!(
            out,
            "rebuild targets: {:?}",
            contexts.rebuild_ctx().iter().collect::<Vec<_>>()
        );

        for (idx, tail) in wb_stripe.active_stripe_tails().iter().enumerate() {
            if !tail.is_unmap() {
                let _ = writeln!(out, "tail {}: {:?}", idx, tail);
            }
        }

        for seg in 0..segment.num_segments() {
            let state = allocator.state(seg);
            let valid = segment.valid_blocks(seg);
            if state != SegmentState::Free || valid != 0 {
                let _ = writeln!(
                    out,
                    "segment {}: {:?} valid {} occupied {}",
                    seg,
                    state,
                    valid,
                    segment.occupied_stripes(seg)
                );
            }
        }
        out
    }

    /// Sizes and fill levels of the allocation bitmaps.
    pub fn bitmap_layout(&self) -> String {
        let contexts = self.context_manager.ctx_lock();
        let wb_stripe = contexts.wb_stripe_ctx();
        let allocator = contexts.allocator_ctx();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "wb lsid bitmap: {} bits, {} set, {} bytes",
            wb_stripe.num_total_wb_stripes(),
            wb_stripe.allocated_wb_stripe_count(),
            wb_stripe.num_total_wb_stripes().div_ceil(64) * 8
        );
        let _ = writeln!(
            out,
            "segment bitmap: {} bits, {} set, {} bytes",
            allocator.total_segment_count(),
            allocator.allocated_segment_count(),
            allocator.total_segment_count().div_ceil(64) * 8
        );
        let _ = writeln!(
            out,
            "context files: {}, {}",
            ALLOCATOR_CTX_FILE, REBUILD_CTX_FILE
        );
        out
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            log::error!("failed to dispose allocator: {}", e);
        }
    }
}
