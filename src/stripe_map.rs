use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::*;

/// Resolves a virtual stripe id to where the stripe currently lives.
///
/// The allocator records a stripe as `WriteBuffer` when it opens and
/// as `UserArea` once it has been destaged, and consults the map when
/// reconstructing open stripes after a restart. The map's own storage
/// belongs to the caller.
pub trait StripeMap: Send + Sync + fmt::Debug {
    fn set_lsa(&self, vsid: StripeId, addr: StripeAddr);

    fn get_lsa(&self, vsid: StripeId) -> Option<StripeAddr>;
}

/// A stripe map held in memory. Clones share the same table.
#[derive(Debug, Default, Clone)]
pub struct MemStripeMap {
    map: Arc<Mutex<FnvHashMap<StripeId, StripeAddr>>>,
}

impl MemStripeMap {
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl StripeMap for MemStripeMap {
    fn set_lsa(&self, vsid: StripeId, addr: StripeAddr) {
        log::trace!("stripe map vsid {} -> {:?}", vsid, addr);
        self.map.lock().insert(vsid, addr);
    }

    fn get_lsa(&self, vsid: StripeId) -> Option<StripeAddr> {
        self.map.lock().get(&vsid).copied()
    }
}

#[test]
fn clones_share_entries() {
    let map = MemStripeMap::default();
    let other = map.clone();
    map.set_lsa(3, StripeAddr::in_write_buffer(1));
    assert_eq!(other.get_lsa(3), Some(StripeAddr::in_write_buffer(1)));
    other.set_lsa(3, StripeAddr::in_user_area(3));
    assert!(!map.get_lsa(3).unwrap().is_in_write_buffer());
    assert_eq!(map.get_lsa(4), None);
    assert_eq!(map.len(), 1);
}
