use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::*;

/// Top-level configuration for the allocator.
///
/// # Examples
///
/// ```
/// let allocator = stripealloc::Config::new()
///     .num_segments(16)
///     .stripes_per_segment(8)
///     .blks_per_stripe(32)
///     .num_wb_stripes(8)
///     .flush_every_ms(None)
///     .open()
///     .unwrap();
///
/// let blks = allocator.block_manager().allocate_blocks(0, 4).unwrap();
/// assert_eq!(blks.num_blks, 4);
///
/// // dropping the allocator waits for outstanding writers
/// allocator
///     .wb_stripe_manager()
///     .derefer_lsid_cnt(&stripealloc::StripeAddr::in_write_buffer(0), blks.num_blks)
///     .unwrap();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    #[doc(hidden)]
    pub path: Option<PathBuf>,
    #[doc(hidden)]
    pub temporary: bool,
    #[doc(hidden)]
    pub num_segments: u32,
    #[doc(hidden)]
    pub stripes_per_segment: u32,
    #[doc(hidden)]
    pub blks_per_stripe: u32,
    #[doc(hidden)]
    pub num_wb_stripes: u32,
    #[doc(hidden)]
    pub num_streams: u32,
    #[doc(hidden)]
    pub tails_per_stream: u32,
    #[doc(hidden)]
    pub flush_every_ms: Option<u64>,
    #[doc(hidden)]
    pub gc_threshold: u32,
    #[doc(hidden)]
    pub urgent_threshold: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: None,
            temporary: false,
            num_segments: 1024,
            stripes_per_segment: 1024,
            blks_per_stripe: 128,
            num_wb_stripes: 1024,
            num_streams: 256,
            tails_per_stream: 2,
            flush_every_ms: Some(500),
            gc_threshold: 20,
            urgent_threshold: 5,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Set the directory that holds the allocator metadata files.
    /// Without a path the metadata lives in memory only.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    builder!(
        (temporary, bool, "store metadata in a fresh temporary directory that is removed on drop"),
        (num_segments, u32, "number of user-area segments"),
        (stripes_per_segment, u32, "number of stripes in each segment"),
        (blks_per_stripe, u32, "number of blocks in each stripe"),
        (num_wb_stripes, u32, "number of write-buffer stripe slots"),
        (num_streams, u32, "number of logical write streams (volumes)"),
        (tails_per_stream, u32, "active stripe tails per stream: 1 for user writes, 2 to add a gc destination tail"),
        (flush_every_ms, Option<u64>, "number of ms between background sweeps of pending full stripes"),
        (gc_threshold, u32, "free segment count below which reclamation starts"),
        (urgent_threshold, u32, "free segment count below which reclamation becomes urgent")
    );

    /// Opens an `Allocator` wired to the default collaborators: an
    /// in-memory stripe map, a flusher that completes immediately, and
    /// a metadata backend chosen by `path` and `temporary`.
    pub fn open(&self) -> Result<Allocator> {
        let meta: Arc<dyn MetaStorage> = if let Some(path) = &self.path {
            Arc::new(DiskMetaStorage::open(path)?)
        } else if self.temporary {
            Arc::new(DiskMetaStorage::temporary()?)
        } else {
            Arc::new(MemMetaStorage::default())
        };

        let allocator = Allocator::new(
            self.clone(),
            meta,
            Arc::new(MemStripeMap::default()),
            Arc::new(NoopFlusher),
        )?;

        allocator.init()?;

        Ok(allocator)
    }
}
