//! `stripealloc` decides where each write of a log-structured flash
//! store lands, tracks which segments still hold live data, and moves
//! filled write-buffer stripes into durable segments.
//!
//! ```
//! let allocator = stripealloc::Config::new()
//!     .num_segments(4)
//!     .stripes_per_segment(2)
//!     .blks_per_stripe(4)
//!     .num_wb_stripes(4)
//!     .num_streams(1)
//!     .flush_every_ms(None)
//!     .open()
//!     .unwrap();
//!
//! let bm = allocator.block_manager();
//! let wbm = allocator.wb_stripe_manager();
//!
//! // a grant never crosses a stripe boundary
//! let first = bm.allocate_blocks(0, 3).unwrap();
//! let second = bm.allocate_blocks(0, 3).unwrap();
//! assert_eq!(first.num_blks, 3);
//! assert_eq!(second.num_blks, 1);
//!
//! // writers release their grants once the data is written
//! let addr = stripealloc::StripeAddr::in_write_buffer(0);
//! wbm.derefer_lsid_cnt(&addr, first.num_blks).unwrap();
//! wbm.derefer_lsid_cnt(&addr, second.num_blks).unwrap();
//!
//! wbm.flush_pending_active_stripes().unwrap();
//! assert_eq!(allocator.current_ssd_lsid(), 1);
//! ```
#![deny(missing_debug_implementations)]

mod address;
mod address_info;
mod allocator;
mod bitmap;
mod block_manager;
mod config;
mod context;
mod drain;
mod meta_file;
mod result;
mod stripe;
mod stripe_map;
mod sweeper;
mod wb_stripe_manager;

pub use crate::address::{
    BlkOffset, Location, SegmentId, StreamId, StripeAddr, StripeId, TailIdx,
    TailSlot, UNMAP_OFFSET, UNMAP_STRIPE, UNMAP_VSA, VirtualBlkAddr,
    VirtualBlks,
};
pub use crate::address_info::AddressInfo;
pub use crate::allocator::Allocator;
pub use crate::block_manager::BlockManager;
pub use crate::config::Config;
pub use crate::context::{
    AllocatorCtx, ContextManager, ContextSection, Contexts, RebuildCtx,
    SegmentCtx, SegmentState, WbSlotOwner, WbStripeCtx,
};
pub use crate::meta_file::{
    DiskMetaStorage, MemMetaStorage, MetaFile, MetaIoOpcode, MetaStorage,
};
pub use crate::result::{Error, Result};
pub use crate::stripe::{Stripe, StripeState};
pub use crate::stripe_map::{MemStripeMap, StripeMap};
pub use crate::wb_stripe_manager::{NoopFlusher, StripeFlusher, WbStripeManager};
