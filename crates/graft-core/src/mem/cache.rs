//! TTL cache over the platform protection query.
//!
//! Hot paths ask "can I touch this range" before every raw dereference, so
//! the real protection lookup is fronted by a small fixed table. Answers
//! are best effort by design: protection can change between the check and
//! the caller's access, and holding a lock across that access would be far
//! worse than the stale read.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{RegionQuery, RegionReport, protect};

/// Fixed number of cached regions.
pub const REGION_CACHE_SLOTS: usize = 32;

/// How long a cached classification stays valid.
pub const REGION_CACHE_TTL: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy)]
struct Slot {
    report: RegionReport,
    stamp: Instant,
}

enum Access {
    Read,
    Write,
}

/// Answers readability/writability questions with a 32-slot TTL cache in
/// front of a [`RegionQuery`] backend.
///
/// Construct one at startup and share it; every component that dereferences
/// a discovered address consults it first.
pub struct RegionCache {
    backend: Box<dyn RegionQuery>,
    ttl: Duration,
    slots: Mutex<[Option<Slot>; REGION_CACHE_SLOTS]>,
}

impl RegionCache {
    pub fn new(backend: Box<dyn RegionQuery>) -> Self {
        Self::with_ttl(backend, REGION_CACHE_TTL)
    }

    /// Same cache with a caller-chosen expiry. Mostly useful to force
    /// short expiries in tests.
    pub fn with_ttl(backend: Box<dyn RegionQuery>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            slots: Mutex::new([None; REGION_CACHE_SLOTS]),
        }
    }

    /// Cache backed by the live platform query.
    #[cfg(target_os = "windows")]
    pub fn system() -> Self {
        Self::new(Box::new(super::windows::VirtualQueryBackend))
    }

    /// Whether `[address, address + size)` is currently readable.
    ///
    /// Null address, zero size, and address-range overflow are all `false`,
    /// never a fault.
    pub fn is_readable(&self, address: usize, size: usize) -> bool {
        self.check(address, size, Access::Read)
    }

    /// Whether `[address, address + size)` is currently writable.
    pub fn is_writable(&self, address: usize, size: usize) -> bool {
        self.check(address, size, Access::Write)
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        let mut slots = self.lock_slots();
        *slots = [None; REGION_CACHE_SLOTS];
        debug!("Region cache cleared");
    }

    fn check(&self, address: usize, size: usize, access: Access) -> bool {
        if address == 0 || size == 0 {
            return false;
        }
        if address.checked_add(size).is_none() {
            return false;
        }

        let mask = match access {
            Access::Read => protect::READ_MASK,
            Access::Write => protect::WRITE_MASK,
        };

        // Fast path: a live cached region that covers the whole request.
        if let Some(report) = self.lookup(address, size) {
            return Self::classify(&report, mask);
        }

        // Miss: the real query runs with the table unlocked.
        let Some(report) = self.backend.query(address) else {
            return false;
        };

        if report.contains(address, size) {
            self.insert(report);
            Self::classify(&report, mask)
        } else {
            // The platform region does not cover the request; answer
            // negatively and leave the table alone.
            false
        }
    }

    fn classify(report: &RegionReport, mask: u32) -> bool {
        report.committed
            && report.protection & mask != 0
            && report.protection & protect::BLOCKED_MASK == 0
    }

    fn lookup(&self, address: usize, size: usize) -> Option<RegionReport> {
        let mut slots = self.lock_slots();
        let now = Instant::now();

        for slot in slots.iter_mut() {
            let Some(entry) = slot else { continue };

            if now.duration_since(entry.stamp) > self.ttl {
                *slot = None;
                continue;
            }

            if entry.report.contains(address, size) {
                // Refresh so frequently-checked regions survive eviction.
                entry.stamp = now;
                return Some(entry.report);
            }
        }

        None
    }

    fn insert(&self, report: RegionReport) {
        let mut slots = self.lock_slots();
        let now = Instant::now();

        // Prefer a free slot; otherwise evict the oldest stamp.
        let target = match slots.iter().position(|slot| slot.is_none()) {
            Some(idx) => idx,
            None => slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.map(|s| s.stamp).unwrap_or(now))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        };

        slots[target] = Some(Slot { report, stamp: now });
    }

    // A poisoned table only costs cached entries; recover it rather than
    // propagating the panic into every safety check.
    fn lock_slots(&self) -> MutexGuard<'_, [Option<Slot>; REGION_CACHE_SLOTS]> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
