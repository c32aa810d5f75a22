//! Live platform implementations of the memory seams.

use std::ffi::c_void;

use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
    PAGE_PROTECTION_FLAGS, VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use crate::error::{Error, Result};
use crate::mem::{CodeArena, CodeSlab, PatchMemory, RegionQuery, RegionReport};

/// Protection lookup via `VirtualQuery`.
pub struct VirtualQueryBackend;

impl RegionQuery for VirtualQueryBackend {
    fn query(&self, address: usize) -> Option<RegionReport> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(address as *const c_void),
                &mut info,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return None;
        }

        Some(RegionReport {
            base: info.BaseAddress as usize,
            size: info.RegionSize,
            protection: info.Protect.0,
            committed: info.State == MEM_COMMIT,
        })
    }
}

/// Code patcher: unprotect, swap bytes, restore protection, flush the
/// instruction cache so every core sees the new code.
pub struct SystemPatcher;

impl PatchMemory for SystemPatcher {
    unsafe fn patch(&self, address: usize, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(
                address as *const c_void,
                bytes.len(),
                PAGE_EXECUTE_READWRITE,
                &mut old,
            )
            .map_err(|_| Error::ProtectFailed { address })?;

            let mut previous = vec![0u8; bytes.len()];
            std::ptr::copy_nonoverlapping(address as *const u8, previous.as_mut_ptr(), bytes.len());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());

            let mut scratch = PAGE_PROTECTION_FLAGS::default();
            let _ = VirtualProtect(address as *const c_void, bytes.len(), old, &mut scratch);
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(address as *const c_void),
                bytes.len(),
            );

            Ok(previous)
        }
    }
}

/// Executable memory allocator that probes outward from the requested
/// address in allocation-granularity steps.
///
/// Nearness is an optimization, not a requirement: a distant block only
/// forces the wider absolute patch form.
pub struct SystemArena;

const ALLOCATION_GRANULARITY: usize = 0x10000;
const NEAR_PROBE_STEPS: usize = 64;

impl CodeArena for SystemArena {
    fn alloc(&self, near: usize, len: usize) -> Result<CodeSlab> {
        for step in 1..=NEAR_PROBE_STEPS {
            let distance = step * ALLOCATION_GRANULARITY;
            for candidate in [near.saturating_sub(distance), near.saturating_add(distance)] {
                if candidate == 0 {
                    continue;
                }
                let ptr = unsafe {
                    VirtualAlloc(
                        Some(candidate as *const c_void),
                        len,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_EXECUTE_READWRITE,
                    )
                };
                if !ptr.is_null() {
                    return Ok(CodeSlab {
                        address: ptr as usize,
                        len,
                    });
                }
            }
        }

        // Let the platform pick any address.
        let ptr = unsafe {
            VirtualAlloc(None, len, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        };
        if ptr.is_null() {
            return Err(Error::BadAllocation { address: near });
        }
        Ok(CodeSlab {
            address: ptr as usize,
            len,
        })
    }

    unsafe fn release(&self, slab: &CodeSlab) {
        let _ = unsafe { VirtualFree(slab.address as *mut c_void, 0, MEM_RELEASE) };
    }
}
