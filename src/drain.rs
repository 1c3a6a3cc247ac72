use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::result::bug_unless;
use crate::*;

const SEAL_BIT: u64 = 1 << 63;
const SEAL_MASK: u64 = u64::MAX - SEAL_BIT;

/// A one-shot latch that any number of threads can block on.
#[derive(Clone, Debug, Default)]
pub(crate) struct Completion {
    mu: Arc<Mutex<bool>>,
    cv: Arc<Condvar>,
}

impl Completion {
    pub fn wait_for_complete(&self) {
        let mut mu = self.mu.lock();
        while !*mu {
            self.cv.wait(&mut mu);
        }
    }

    pub fn mark_complete(&self) {
        let mut mu = self.mu.lock();
        // a late refer that bounced off the seal may
        // re-notify an already drained counter.
        *mu = true;
        drop(mu);
        self.cv.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.mu.lock()
    }
}

/// Counts outstanding writers of a stripe. Once sealed, no new
/// reference can be taken, and `wait_for_drain` returns as soon as
/// the count reaches zero.
#[derive(Debug, Default)]
pub(crate) struct DrainCounter {
    rc: AtomicU64,
    drained: Completion,
}

impl DrainCounter {
    /// Takes a reference, failing if the counter has been sealed.
    pub fn refer(&self) -> bool {
        let rc = self.rc.fetch_add(1, Ordering::AcqRel);
        if rc & SEAL_BIT == SEAL_BIT {
            // the stripe is already finalizing, so we must
            // give the reference back and possibly notify.
            let _ = self.derefer();
            false
        } else {
            true
        }
    }

    /// Releases a reference. Releasing more than was taken is a bug
    /// and leaves the count untouched.
    pub fn derefer(&self) -> Result<()> {
        let prev = self.rc.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |rc| if rc & SEAL_MASK == 0 { None } else { Some(rc - 1) },
        );

        bug_unless!(prev.is_ok(), "stripe reference count underflow");

        if let Ok(prev) = prev {
            if prev - 1 == SEAL_BIT {
                self.drained.mark_complete();
            }
        }
        Ok(())
    }

    /// Seals the counter, returning `false` if it was already sealed.
    pub fn seal(&self) -> bool {
        let prev = self.rc.fetch_or(SEAL_BIT, Ordering::AcqRel);
        if prev & SEAL_BIT == SEAL_BIT {
            return false;
        }
        if prev & SEAL_MASK == 0 {
            self.drained.mark_complete();
        }
        true
    }

    pub fn is_sealed(&self) -> bool {
        self.rc.load(Ordering::Acquire) & SEAL_BIT == SEAL_BIT
    }

    pub fn count(&self) -> u64 {
        self.rc.load(Ordering::Acquire) & SEAL_MASK
    }

    pub fn is_drained(&self) -> bool {
        self.drained.is_complete()
    }

    /// Blocks until every reference taken before the seal is released.
    pub fn wait_for_drain(&self) {
        assert!(self.is_sealed(), "waiting on an unsealed drain counter");
        self.drained.wait_for_complete();
    }
}

#[test]
fn drain_counter_basic_functionality() {
    let dc = DrainCounter::default();

    assert!(dc.refer());
    assert!(dc.refer());
    assert_eq!(dc.count(), 2);

    assert!(dc.seal());
    assert!(!dc.seal());
    assert!(!dc.is_drained());

    // late writers bounce off the seal
    assert!(!dc.refer());
    assert_eq!(dc.count(), 2);

    dc.derefer().unwrap();
    assert!(!dc.is_drained());
    dc.derefer().unwrap();
    assert!(dc.is_drained());
    dc.wait_for_drain();

    assert!(matches!(dc.derefer(), Err(Error::ReportableBug(_))));
    assert_eq!(dc.count(), 0);
}

#[test]
fn sealing_an_idle_counter_is_immediately_drained() {
    let dc = DrainCounter::default();
    assert!(dc.seal());
    assert!(dc.is_drained());
    dc.wait_for_drain();
}

#[test]
fn drain_wakes_waiter() {
    let dc = Arc::new(DrainCounter::default());
    assert!(dc.refer());
    dc.seal();

    let waiter = {
        let dc = dc.clone();
        std::thread::spawn(move || dc.wait_for_drain())
    };

    std::thread::sleep(std::time::Duration::from_millis(10));
    assert!(!waiter.is_finished());
    dc.derefer().unwrap();
    waiter.join().unwrap();
}
