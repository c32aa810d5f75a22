//! Table-backed seam implementations for tests.
//!
//! These run on any host: the query backend answers from a fixed region
//! table and counts calls, the patcher copies bytes without protection
//! changes, and the arena hands out plain heap blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::mem::{CodeArena, CodeSlab, PatchMemory, RegionQuery, RegionReport};

/// Region query that answers from a fixed table and counts invocations,
/// so tests can observe exactly when the cache misses.
#[derive(Clone)]
pub struct CountingQuery {
    inner: Arc<CountingQueryInner>,
}

struct CountingQueryInner {
    regions: Vec<RegionReport>,
    calls: AtomicUsize,
}

impl CountingQuery {
    pub fn shared(regions: Vec<RegionReport>) -> Self {
        Self {
            inner: Arc::new(CountingQueryInner {
                regions,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// How many times the "expensive" query has run.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

impl RegionQuery for CountingQuery {
    fn query(&self, address: usize) -> Option<RegionReport> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .regions
            .iter()
            .find(|region| {
                address >= region.base && address < region.base.saturating_add(region.size)
            })
            .copied()
    }
}

/// Patcher that copies bytes directly; the test memory is ordinary heap
/// memory, so no protection change is involved.
pub struct RawPatcher;

impl PatchMemory for RawPatcher {
    unsafe fn patch(&self, address: usize, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut previous = vec![0u8; bytes.len()];
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, previous.as_mut_ptr(), bytes.len());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        Ok(previous)
    }
}

/// Arena backed by leaked heap blocks, reclaimed on release.
#[derive(Default)]
pub struct HeapArena {
    blocks: Mutex<HashMap<usize, Box<[u8]>>>,
    allocated: AtomicUsize,
}

impl HeapArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total allocations made, for verifying failure paths allocate nothing.
    pub fn allocations(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Blocks currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

impl CodeArena for HeapArena {
    fn alloc(&self, _near: usize, len: usize) -> Result<CodeSlab> {
        let block = vec![0u8; len].into_boxed_slice();
        let address = block.as_ptr() as usize;
        self.blocks.lock().unwrap().insert(address, block);
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(CodeSlab { address, len })
    }

    unsafe fn release(&self, slab: &CodeSlab) {
        self.blocks.lock().unwrap().remove(&slab.address);
    }
}
