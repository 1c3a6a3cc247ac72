//! Allocation metadata and the manager that owns, locks and
//! persists it.
//!
//! Every context lives inside a single `Contexts` value behind one
//! coarse mutex. Any operation that touches more than one context
//! (opening a stripe, finalizing a stripe, reclaiming a segment,
//! computing rebuild targets) does so while holding the guard
//! returned by `ContextManager::ctx_lock`, which is the only path to
//! the mutable state.
//!
//! Each of the two persisted images (allocator contexts and rebuild
//! context) alternates between a primary and a `.shadow` metadata
//! file. A write always targets the file that does not hold the
//! newest image, and loading picks the newest image that decodes, so
//! a torn write loses at most the image being written. Each file
//! holds one frame:
//!
//! ```text
//! 8 byte LE payload length
//! bincode payload (generation, signature, version, contexts)
//! 4 byte LE crc32 of length + payload, XOR 0xAF
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::*;

mod allocator_ctx;
mod rebuild_ctx;
mod segment_ctx;
mod wb_stripe_ctx;

pub use self::{
    allocator_ctx::{AllocatorCtx, SegmentState},
    rebuild_ctx::RebuildCtx,
    segment_ctx::SegmentCtx,
    wb_stripe_ctx::{WbSlotOwner, WbStripeCtx},
};

pub(crate) const ALLOCATOR_CTX_FILE: &str = "AllocatorContexts";
pub(crate) const REBUILD_CTX_FILE: &str = "RebuildContext";
pub(crate) const SHADOW_SUFFIX: &str = ".shadow";

const ALLOCATOR_CTX_SIGNATURE: u32 = 0xAFAF_AFAF;
const REBUILD_CTX_SIGNATURE: u32 = 0xCFCF_CFCF;
const CTX_VERSION: u32 = 2;

/// The mutable allocation state, reachable only through
/// `ContextManager::ctx_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contexts {
    pub(crate) segment: SegmentCtx,
    pub(crate) wb_stripe: WbStripeCtx,
    pub(crate) allocator: AllocatorCtx,
    pub(crate) rebuild: RebuildCtx,
}

impl Contexts {
    fn fresh(info: &AddressInfo) -> Contexts {
        Contexts {
            segment: SegmentCtx::new(info),
            wb_stripe: WbStripeCtx::new(info),
            allocator: AllocatorCtx::new(info),
            rebuild: RebuildCtx::default(),
        }
    }

    pub fn segment_ctx(&self) -> &SegmentCtx {
        &self.segment
    }

    pub fn wb_stripe_ctx(&self) -> &WbStripeCtx {
        &self.wb_stripe
    }

    pub fn allocator_ctx(&self) -> &AllocatorCtx {
        &self.allocator
    }

    pub fn rebuild_ctx(&self) -> &RebuildCtx {
        &self.rebuild
    }
}

/// Names one raw field of the contexts, as dumped to and restored
/// from a diagnostic archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextSection {
    /// `u32` LE per segment.
    SegmentValidCount,
    /// `u32` LE per segment.
    SegmentOccupiedStripe,
    /// 4 byte LE allocated slot count.
    WbLsidBitmap,
    /// 4 byte LE allocated segment count.
    SegmentBitmap,
    /// `u32` stripe id + `u64` offset, LE, per tail.
    ActiveStripeTail,
    /// 8 byte LE destage sequence number.
    CurrentSsdLsid,
    /// `u32` LE per segment.
    SegmentState,
}

impl ContextSection {
    pub const ALL: [ContextSection; 7] = [
        ContextSection::SegmentValidCount,
        ContextSection::SegmentOccupiedStripe,
        ContextSection::WbLsidBitmap,
        ContextSection::SegmentBitmap,
        ContextSection::ActiveStripeTail,
        ContextSection::CurrentSsdLsid,
        ContextSection::SegmentState,
    ];
}

#[derive(Serialize, Deserialize)]
struct AllocatorContextsImage {
    signature: u32,
    version: u32,
    segment: SegmentCtx,
    wb_stripe: WbStripeCtx,
    allocator: AllocatorCtx,
}

#[derive(Serialize, Deserialize)]
struct RebuildContextImage {
    signature: u32,
    version: u32,
    rebuild: RebuildCtx,
}

#[derive(Serialize, Deserialize)]
struct Stamped<T> {
    generation: u64,
    image: T,
}

/// The primary and shadow file of one persisted image.
#[derive(Debug)]
struct SlotPair {
    files: [Box<dyn MetaFile>; 2],
    // generation of the newest durable image
    generation: u64,
}

impl SlotPair {
    fn write<T: Serialize>(&mut self, image: &T) -> Result<()> {
        let generation = self.generation + 1;
        let payload = encode(&Stamped { generation, image })?;
        let file = &mut self.files[(generation % 2) as usize];
        write_frame(&mut **file, &payload)?;
        self.generation = generation;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        for file in &mut self.files {
            file.close()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MetaFiles {
    allocator: SlotPair,
    rebuild: SlotPair,
}

/// Owns every allocation context, the lock that serializes their
/// mutation, and their persistence.
///
/// Lock order: the metadata file lock is taken before the context
/// lock, and never while the context lock is held.
#[derive(Debug)]
pub struct ContextManager {
    info: AddressInfo,
    meta: Arc<dyn MetaStorage>,
    contexts: Mutex<Contexts>,
    files: Mutex<Option<MetaFiles>>,
    gc_threshold: AtomicU32,
    urgent_threshold: AtomicU32,
}

impl ContextManager {
    pub(crate) fn new(
        info: AddressInfo,
        meta: Arc<dyn MetaStorage>,
        gc_threshold: u32,
        urgent_threshold: u32,
    ) -> ContextManager {
        ContextManager {
            contexts: Mutex::new(Contexts::fresh(&info)),
            info,
            meta,
            files: Mutex::new(None),
            gc_threshold: AtomicU32::new(gc_threshold),
            urgent_threshold: AtomicU32::new(urgent_threshold),
        }
    }

    pub fn info(&self) -> &AddressInfo {
        &self.info
    }

    /// Loads both context files, formatting them on first run.
    /// Calling `init` on an initialized manager does nothing.
    pub fn init(&self) -> Result<()> {
        let mut files = self.files.lock();
        if files.is_some() {
            return Ok(());
        }

        let fresh = Contexts::fresh(&self.info);

        let (allocator_slots, allocator_image) = load_or_format(
            &*self.meta,
            ALLOCATOR_CTX_FILE,
            AllocatorContextsImage {
                signature: ALLOCATOR_CTX_SIGNATURE,
                version: CTX_VERSION,
                segment: fresh.segment,
                wb_stripe: fresh.wb_stripe,
                allocator: fresh.allocator,
            },
        )?;

        if allocator_image.signature != ALLOCATOR_CTX_SIGNATURE
            || allocator_image.version != CTX_VERSION
            || !allocator_image.segment.matches_geometry(&self.info)
            || !allocator_image.wb_stripe.matches_geometry(&self.info)
            || !allocator_image.allocator.matches_geometry(&self.info)
        {
            log::error!(
                "{} does not match the configured geometry {:?}",
                ALLOCATOR_CTX_FILE,
                self.info
            );
            return Err(Error::Corruption { file: ALLOCATOR_CTX_FILE.into() });
        }

        let (rebuild_slots, rebuild_image) = load_or_format(
            &*self.meta,
            REBUILD_CTX_FILE,
            RebuildContextImage {
                signature: REBUILD_CTX_SIGNATURE,
                version: CTX_VERSION,
                rebuild: fresh.rebuild,
            },
        )?;

        if rebuild_image.signature != REBUILD_CTX_SIGNATURE
            || rebuild_image.version != CTX_VERSION
            || rebuild_image
                .rebuild
                .iter()
                .any(|segment| segment >= self.info.num_segments())
        {
            return Err(Error::Corruption { file: REBUILD_CTX_FILE.into() });
        }

        let mut contexts = self.contexts.lock();
        *contexts = Contexts {
            segment: allocator_image.segment,
            wb_stripe: allocator_image.wb_stripe,
            allocator: allocator_image.allocator,
            rebuild: rebuild_image.rebuild,
        };

        log::debug!(
            "loaded allocator contexts: {} segments allocated, {} wb stripes \
             allocated, {} rebuild targets, ssd lsid {}",
            contexts.allocator.allocated_segment_count(),
            contexts.wb_stripe.allocated_wb_stripe_count(),
            contexts.rebuild.target_count(),
            contexts.allocator.current_ssd_lsid(),
        );

        *files = Some(MetaFiles { allocator: allocator_slots, rebuild: rebuild_slots });

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.files.lock().is_some()
    }

    /// The single coarse lock over every context.
    pub fn ctx_lock(&self) -> MutexGuard<'_, Contexts> {
        self.contexts.lock()
    }

    /// Persists every context and returns once the backend has
    /// made them durable. The state is snapshotted under the context
    /// lock and written outside of it.
    pub fn flush_contexts_sync(&self) -> Result<()> {
        let mut files = self.files.lock();
        let files = files.as_mut().ok_or_else(not_initialized)?;

        let (allocator_image, rebuild_image) = {
            let contexts = self.contexts.lock();
            (
                AllocatorContextsImage {
                    signature: ALLOCATOR_CTX_SIGNATURE,
                    version: CTX_VERSION,
                    segment: contexts.segment.clone(),
                    wb_stripe: contexts.wb_stripe.clone(),
                    allocator: contexts.allocator.clone(),
                },
                RebuildContextImage {
                    signature: REBUILD_CTX_SIGNATURE,
                    version: CTX_VERSION,
                    rebuild: contexts.rebuild.clone(),
                },
            )
        };

        files.allocator.write(&allocator_image)?;
        files.rebuild.write(&rebuild_image)?;

        log::trace!("flushed allocator contexts");
        Ok(())
    }

    /// Persists only the rebuild target set.
    pub fn flush_rebuild_context(&self) -> Result<()> {
        let mut files = self.files.lock();
        let files = files.as_mut().ok_or_else(not_initialized)?;

        let image = RebuildContextImage {
            signature: REBUILD_CTX_SIGNATURE,
            version: CTX_VERSION,
            rebuild: self.contexts.lock().rebuild.clone(),
        };

        files.rebuild.write(&image)
    }

    /// Releases the backend files. The in-memory contexts stay
    /// readable until the manager is dropped.
    pub fn close(&self) -> Result<()> {
        if let Some(mut files) = self.files.lock().take() {
            files.allocator.close()?;
            files.rebuild.close()?;
            log::debug!("closed allocator context files");
        }
        Ok(())
    }

    /// Replaces the rebuild target set with every segment that holds
    /// destaged data, and persists it.
    pub fn make_rebuild_target(&self) -> Result<usize> {
        let count = {
            let mut contexts = self.contexts.lock();
            let Contexts { allocator, rebuild, .. } = &mut *contexts;
            rebuild.make_rebuild_target(allocator.segment_states())
        };
        log::info!("{} segments targeted for rebuild", count);
        self.flush_rebuild_context()?;
        Ok(count)
    }

    /// True while rebuild targets remain, meaning another rebuild
    /// pass is required.
    pub fn need_rebuild_again(&self) -> bool {
        !self.contexts.lock().rebuild.is_empty()
    }

    pub fn next_rebuild_target(&self) -> Option<SegmentId> {
        self.contexts.lock().rebuild.next_target()
    }

    pub fn rebuild_targets(&self) -> Vec<SegmentId> {
        self.contexts.lock().rebuild.iter().collect()
    }

    /// Marks `segment` as fully reconstructed by the caller.
    pub fn release_rebuild_segment(&self, segment: SegmentId) -> Result<bool> {
        let removed = self.contexts.lock().rebuild.release(segment);
        if removed {
            log::debug!("segment {} rebuilt", segment);
            self.flush_rebuild_context()?;
        }
        Ok(removed)
    }

    pub fn stop_rebuilding(&self) -> Result<()> {
        self.contexts.lock().rebuild.clear();
        log::info!("rebuild stopped");
        self.flush_rebuild_context()
    }

    /// A copy of one raw field, laid out as described on
    /// `ContextSection`.
    pub fn context_section(&self, section: ContextSection) -> Vec<u8> {
        let contexts = self.contexts.lock();
        match section {
            ContextSection::SegmentValidCount => {
                contexts.segment.valid_block_count_bytes()
            }
            ContextSection::SegmentOccupiedStripe => {
                contexts.segment.occupied_stripe_count_bytes()
            }
            ContextSection::WbLsidBitmap => contexts
                .wb_stripe
                .allocated_wb_stripe_count()
                .to_le_bytes()
                .to_vec(),
            ContextSection::SegmentBitmap => contexts.allocator.segment_bitmap_bytes(),
            ContextSection::ActiveStripeTail => {
                contexts.wb_stripe.active_stripe_tail_bytes()
            }
            ContextSection::CurrentSsdLsid => {
                contexts.allocator.current_ssd_lsid().to_le_bytes().to_vec()
            }
            ContextSection::SegmentState => contexts.allocator.segment_state_bytes(),
        }
    }

    /// Overwrites one raw field from an archive. Only the count
    /// tables and the bitmap summaries can be restored; the other
    /// sections are dump-only.
    pub fn set_context_section(
        &self,
        section: ContextSection,
        raw: &[u8],
    ) -> Result<()> {
        let mut contexts = self.contexts.lock();
        match section {
            ContextSection::SegmentValidCount => {
                contexts.segment.set_valid_block_count_bytes(raw)
            }
            ContextSection::SegmentOccupiedStripe => {
                contexts.segment.set_occupied_stripe_count_bytes(raw)
            }
            ContextSection::WbLsidBitmap => {
                let count =
                    bitmap_summary(raw, contexts.wb_stripe.num_total_wb_stripes())?;
                contexts.wb_stripe.set_allocated_wb_stripe_count(count);
                Ok(())
            }
            ContextSection::SegmentBitmap => {
                let count =
                    bitmap_summary(raw, contexts.allocator.total_segment_count())?;
                contexts.allocator.set_allocated_segment_count(count);
                Ok(())
            }
            ContextSection::ActiveStripeTail
            | ContextSection::CurrentSsdLsid
            | ContextSection::SegmentState => Err(Error::Unsupported(format!(
                "{:?} can not be restored from an archive",
                section
            ))),
        }
    }

    pub fn set_gc_threshold(&self, threshold: u32) {
        self.gc_threshold.store(threshold, Ordering::Release);
    }

    pub fn set_urgent_threshold(&self, threshold: u32) {
        self.urgent_threshold.store(threshold, Ordering::Release);
    }

    /// `(gc, urgent)` free segment thresholds for the reclamation
    /// policy.
    pub fn gc_thresholds(&self) -> (u32, u32) {
        (
            self.gc_threshold.load(Ordering::Acquire),
            self.urgent_threshold.load(Ordering::Acquire),
        )
    }
}

fn not_initialized() -> Error {
    Error::Unsupported("the context manager has not been initialized".into())
}

fn bitmap_summary(raw: &[u8], total: u32) -> Result<u32> {
    let bytes: [u8; 4] = raw.try_into().map_err(|_| {
        Error::Unsupported(format!(
            "a bitmap summary is 4 bytes, got {}",
            raw.len()
        ))
    })?;
    let count = u32::from_le_bytes(bytes);
    if count > total {
        return Err(Error::Unsupported(format!(
            "allocated count {} exceeds capacity {}",
            count, total
        )));
    }
    Ok(count)
}

fn encode<T: Serialize>(image: &T) -> Result<Vec<u8>> {
    bincode::serialize(image).map_err(|e| {
        Error::ReportableBug(format!("failed to encode allocator context: {}", e))
    })
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + 12);
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(payload);

    let hash: u32 = crc32fast::hash(&bytes) ^ 0xAF;
    bytes.extend_from_slice(&hash.to_le_bytes());
    bytes
}

fn write_frame(file: &mut dyn MetaFile, payload: &[u8]) -> Result<()> {
    let mut bytes = frame(payload);
    file.append_io(MetaIoOpcode::Write, 0, &mut bytes)?;
    Ok(())
}

/// Reads the frame at the start of `file`. Bytes past the frame,
/// left over from a larger earlier write, are ignored.
fn read_frame(file: &mut dyn MetaFile) -> io::Result<Option<Vec<u8>>> {
    if file.size()? < 12 {
        return Ok(None);
    }

    let mut len_buf = [0_u8; 8];
    file.issue_io(MetaIoOpcode::Read, 0, &mut len_buf)?;
    let len = u64::from_le_bytes(len_buf);

    if len.saturating_add(12) > file.size()? {
        log::warn!("frame length {} overruns {}", len, file.name());
        return Ok(None);
    }

    let mut bytes = vec![0; len as usize + 12];
    file.issue_io(MetaIoOpcode::Read, 0, &mut bytes)?;

    let crc_actual = crc32fast::hash(&bytes[..len as usize + 8]) ^ 0xAF;
    let crc_recorded = u32::from_le_bytes([
        bytes[len as usize + 8],
        bytes[len as usize + 9],
        bytes[len as usize + 10],
        bytes[len as usize + 11],
    ]);

    if crc_actual != crc_recorded {
        log::warn!("encountered incorrect crc for {}", file.name());
        return Ok(None);
    }

    bytes.truncate(len as usize + 8);
    bytes.drain(..8);
    Ok(Some(bytes))
}

/// Opens the primary and shadow file of `name` and decodes the newest
/// image they hold, or formats the primary with `fresh` on first run.
fn load_or_format<T: Serialize + DeserializeOwned>(
    meta: &dyn MetaStorage,
    name: &str,
    fresh: T,
) -> Result<(SlotPair, T)> {
    let mut files = [meta.file(name), meta.file(&format!("{}{}", name, SHADOW_SUFFIX))];
    let startup = |file: &dyn MetaFile, cause: io::Error| Error::Startup {
        file: file.name().to_owned(),
        cause,
    };

    if files.iter().all(|file| !file.does_file_exist()) {
        log::info!("formatting new allocator context file {}", name);
        let mut bytes = frame(&encode(&Stamped { generation: 0, image: &fresh })?);
        let [primary, shadow] = &mut files;
        primary.create(bytes.len() as u64).map_err(|e| startup(&**primary, e))?;
        primary.open().map_err(|e| startup(&**primary, e))?;
        primary
            .issue_io(MetaIoOpcode::Write, 0, &mut bytes)
            .map_err(|e| startup(&**primary, e))?;
        shadow.create(0).map_err(|e| startup(&**shadow, e))?;
        shadow.open().map_err(|e| startup(&**shadow, e))?;
        return Ok((SlotPair { files, generation: 0 }, fresh));
    }

    let mut newest: Option<Stamped<T>> = None;
    for file in &mut files {
        if !file.does_file_exist() {
            file.create(0).map_err(|e| startup(&**file, e))?;
        }
        file.open().map_err(|e| startup(&**file, e))?;

        let Some(payload) = read_frame(&mut **file).map_err(|e| startup(&**file, e))?
        else {
            continue;
        };
        match bincode::deserialize::<Stamped<T>>(&payload) {
            Ok(stamped) => {
                if newest.as_ref().is_none_or(|n| stamped.generation > n.generation) {
                    newest = Some(stamped);
                }
            }
            Err(e) => log::warn!("failed to decode {}: {}", file.name(), e),
        }
    }

    let Some(newest) = newest else {
        log::error!("no usable image of {} survives", name);
        return Err(Error::Corruption { file: name.into() });
    };

    log::debug!("loaded {} generation {}", name, newest.generation);
    Ok((SlotPair { files, generation: newest.generation }, newest.image))
}
