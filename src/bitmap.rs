//! Fixed-capacity bitmap with first-fit allocation. Capacity is chosen
//! at construction and never changes.

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitMap {
    bits: BitVec<u64, Lsb0>,
    // only consulted with monotonic-behavior
    next_fit: u32,
}

impl BitMap {
    pub fn new(num_bits: u32) -> BitMap {
        BitMap { bits: BitVec::repeat(false, num_bits as usize), next_fit: 0 }
    }

    pub fn num_bits(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn num_set(&self) -> u32 {
        self.bits.count_ones() as u32
    }

    /// Out of range bits read as clear.
    pub fn is_set(&self, idx: u32) -> bool {
        self.bits.get(idx as usize).is_some_and(|bit| *bit)
    }

    /// Sets `idx`, returning `false` if it was already set or is out
    /// of range.
    pub fn set(&mut self, idx: u32) -> bool {
        if idx >= self.num_bits() || self.is_set(idx) {
            return false;
        }
        self.bits.set(idx as usize, true);
        true
    }

    /// Clears `idx`, returning `false` if it was already clear or is
    /// out of range.
    pub fn clear(&mut self, idx: u32) -> bool {
        if !self.is_set(idx) {
            return false;
        }
        self.bits.set(idx as usize, false);
        true
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
        self.next_fit = 0;
    }

    /// Sets and returns the first clear bit, or `None` when full.
    pub fn set_first_fit(&mut self) -> Option<u32> {
        let start = if cfg!(feature = "monotonic-behavior") {
            (self.next_fit as usize).min(self.bits.len())
        } else {
            0
        };

        let idx = self.bits[start..]
            .first_zero()
            .map(|offset| start + offset)
            .or_else(|| self.bits[..start].first_zero())?;

        self.bits.set(idx, true);
        self.next_fit = ((idx + 1) % self.bits.len()) as u32;
        Some(idx as u32)
    }

    /// Sets bits `[0, n)` and clears the rest. Used when only a
    /// population count survives, e.g. a restored bitmap summary.
    pub fn reset_to_prefix(&mut self, n: u32) {
        self.clear_all();
        let n = (n as usize).min(self.bits.len());
        self.bits[..n].fill(true);
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|idx| idx as u32)
    }
}
