use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a stripe, either a write-buffer slot (`wb_lsid`),
/// a virtual stripe (`vsid`) or a user-area stripe.
pub type StripeId = u32;

/// Identifies a user-area segment.
pub type SegmentId = u32;

/// Identifies a logical write stream (a volume).
pub type StreamId = u32;

/// Offset of a block within its stripe.
pub type BlkOffset = u64;

/// Sentinel stripe id meaning "unmapped".
pub const UNMAP_STRIPE: StripeId = StripeId::MAX;

/// Sentinel offset meaning "unmapped".
pub const UNMAP_OFFSET: BlkOffset = BlkOffset::MAX;

/// Sentinel tail entry meaning "no open stripe".
pub const UNMAP_VSA: VirtualBlkAddr =
    VirtualBlkAddr { stripe_id: UNMAP_STRIPE, offset: UNMAP_OFFSET };

/// The logical position of one block within a virtual stripe.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VirtualBlkAddr {
    pub stripe_id: StripeId,
    pub offset: BlkOffset,
}

impl VirtualBlkAddr {
    pub const fn new(stripe_id: StripeId, offset: BlkOffset) -> Self {
        VirtualBlkAddr { stripe_id, offset }
    }

    pub fn is_unmap(&self) -> bool {
        *self == UNMAP_VSA
    }
}

impl fmt::Debug for VirtualBlkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unmap() {
            write!(f, "Vsa(UNMAP)")
        } else {
            write!(f, "Vsa({:#x}:{:#x})", self.stripe_id, self.offset)
        }
    }
}

/// A contiguous run of blocks inside a single stripe. This is the
/// unit returned by block allocation and consumed by invalidation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualBlks {
    pub start: VirtualBlkAddr,
    pub num_blks: u32,
}

impl VirtualBlks {
    /// One past the last block of the run.
    pub fn end_offset(&self) -> BlkOffset {
        self.start.offset + BlkOffset::from(self.num_blks)
    }

    pub fn iter(&self) -> impl Iterator<Item = VirtualBlkAddr> + '_ {
        (self.start.offset..self.end_offset())
            .map(|offset| VirtualBlkAddr::new(self.start.stripe_id, offset))
    }
}

/// Where a stripe currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    WriteBuffer,
    UserArea,
}

/// The physical-side address a stripe map resolves a vsid to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeAddr {
    pub loc: Location,
    pub stripe_id: StripeId,
}

impl StripeAddr {
    pub const fn in_write_buffer(wb_lsid: StripeId) -> Self {
        StripeAddr { loc: Location::WriteBuffer, stripe_id: wb_lsid }
    }

    pub const fn in_user_area(user_lsid: StripeId) -> Self {
        StripeAddr { loc: Location::UserArea, stripe_id: user_lsid }
    }

    pub fn is_in_write_buffer(&self) -> bool {
        self.loc == Location::WriteBuffer
    }
}

/// Which tail of a stream an allocation advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TailSlot {
    User = 0,
    Gc = 1,
}

/// Index into the active-stripe-tail table. Laid out as
/// `stream + slot * num_streams` so all user tails come first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TailIdx(pub usize);

impl TailIdx {
    pub fn new(stream: StreamId, slot: TailSlot, num_streams: u32) -> TailIdx {
        TailIdx(stream as usize + slot as usize * num_streams as usize)
    }

    pub fn stream(&self, num_streams: u32) -> StreamId {
        (self.0 % num_streams as usize) as StreamId
    }
}

#[test]
fn virtual_blks_iterates_run() {
    let blks = VirtualBlks { start: VirtualBlkAddr::new(3, 2), num_blks: 3 };
    let offsets: Vec<BlkOffset> = blks.iter().map(|vsa| vsa.offset).collect();
    assert_eq!(offsets, vec![2, 3, 4]);
    assert_eq!(blks.end_offset(), 5);
}

#[test]
fn tail_idx_layout() {
    let user = TailIdx::new(2, TailSlot::User, 4);
    let gc = TailIdx::new(2, TailSlot::Gc, 4);
    assert_eq!(user, TailIdx(2));
    assert_eq!(gc, TailIdx(6));
    assert_eq!(gc.stream(4), 2);
}
