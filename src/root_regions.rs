use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::region::HeapRegion;

/// Append-only registry of the regions whose contents must be scanned
/// before concurrent marking proper may begin. Filled at a safepoint,
/// claimed concurrently by the scanning gang.
pub struct RootRegions {
    regions: Box<[AtomicPtr<HeapRegion>]>,
    max_regions: usize,
    num_root_regions: AtomicUsize,
    claimed_root_regions: AtomicUsize,
    should_abort: AtomicBool,
    scan_in_progress: Mutex<bool>,
    scan_done: Condvar,
}

impl RootRegions {
    pub fn new(max_regions: usize) -> Self {
        Self {
            regions: (0..max_regions).map(|_| AtomicPtr::new(null_mut())).collect(),
            max_regions,
            num_root_regions: AtomicUsize::new(0),
            claimed_root_regions: AtomicUsize::new(0),
            should_abort: AtomicBool::new(false),
            scan_in_progress: Mutex::new(false),
            scan_done: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        self.num_root_regions.store(0, Ordering::Relaxed);
    }

    /// Register a region. Only called at a safepoint.
    pub fn add(&self, hr: *mut HeapRegion) {
        let idx = self.num_root_regions.fetch_add(1, Ordering::Relaxed);
        assert!(
            idx < self.max_regions,
            "trying to add more root regions than there is space {}",
            self.max_regions
        );
        self.regions[idx].store(hr, Ordering::Release);
    }

    pub fn prepare_for_scan(&self) {
        assert!(!self.scan_in_progress(), "pre-condition");

        *self.scan_in_progress.lock() = self.num_root_regions.load(Ordering::Relaxed) > 0;
        self.claimed_root_regions.store(0, Ordering::Relaxed);
        self.should_abort.store(false, Ordering::Relaxed);
    }

    /// Claim the next unclaimed root region, or null when the registry is
    /// exhausted or the scan was cancelled.
    pub fn claim_next(&self) -> *mut HeapRegion {
        if self.should_abort.load(Ordering::Relaxed) {
            return null_mut();
        }

        let num = self.num_root_regions.load(Ordering::Relaxed);
        if self.claimed_root_regions.load(Ordering::Relaxed) >= num {
            return null_mut();
        }

        let claimed_index = self.claimed_root_regions.fetch_add(1, Ordering::Relaxed);
        if claimed_index < num {
            return self.regions[claimed_index].load(Ordering::Acquire);
        }
        null_mut()
    }

    pub fn num_root_regions(&self) -> usize {
        self.num_root_regions.load(Ordering::Relaxed)
    }

    pub fn scan_in_progress(&self) -> bool {
        *self.scan_in_progress.lock()
    }

    pub fn notify_scan_done(&self) {
        let mut in_progress = self.scan_in_progress.lock();
        *in_progress = false;
        self.scan_done.notify_all();
    }

    pub fn cancel_scan(&self) {
        self.should_abort.store(true, Ordering::Relaxed);
        self.notify_scan_done();
    }

    pub fn scan_finished(&self) {
        assert!(self.scan_in_progress(), "pre-condition");

        if !self.should_abort.load(Ordering::Relaxed) {
            assert!(
                self.claimed_root_regions.load(Ordering::Relaxed) >= self.num_root_regions(),
                "we should have claimed all root regions, claimed {}, length = {}",
                self.claimed_root_regions.load(Ordering::Relaxed),
                self.num_root_regions()
            );
        }

        self.notify_scan_done();
    }

    /// Block until the scanning gang has finished. Returns false if no
    /// scan was running.
    pub fn wait_until_scan_finished(&self) -> bool {
        let mut in_progress = self.scan_in_progress.lock();
        if !*in_progress {
            return false;
        }
        while *in_progress {
            self.scan_done.wait(&mut in_progress);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fake_region(i: u32) -> Box<HeapRegion> {
        let base = 0x20_0000 + (i as usize) * 0x1000;
        Box::new(HeapRegion::new(i, base as *mut u8, (base + 0x1000) as *mut u8))
    }

    #[test]
    fn claim_each_region_once() {
        let mut regions: Vec<_> = (0..5).map(fake_region).collect();
        let roots = RootRegions::new(8);
        for r in regions.iter_mut() {
            roots.add(r.as_mut() as *mut _);
        }
        roots.prepare_for_scan();
        assert!(roots.scan_in_progress());

        let mut claimed = vec![];
        loop {
            let hr = roots.claim_next();
            if hr.is_null() {
                break;
            }
            claimed.push(hr as usize);
        }
        assert_eq!(claimed.len(), 5);
        claimed.sort_unstable();
        claimed.dedup();
        assert_eq!(claimed.len(), 5);

        roots.scan_finished();
        assert!(!roots.scan_in_progress());
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let mut region = fake_region(0);
        let roots = RootRegions::new(4);
        roots.add(region.as_mut() as *mut _);
        roots.prepare_for_scan();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| roots.wait_until_scan_finished());
            std::thread::sleep(Duration::from_millis(20));
            roots.cancel_scan();
            assert!(waiter.join().unwrap());
        });

        assert!(roots.claim_next().is_null());
    }

    #[test]
    fn wait_without_scan_returns_immediately() {
        let roots = RootRegions::new(4);
        roots.prepare_for_scan();
        // No regions registered, nothing in progress.
        assert!(!roots.wait_until_scan_finished());
    }
}
