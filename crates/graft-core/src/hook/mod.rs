//! Inline function intercepts.
//!
//! A hook overwrites the entry of a live function with a jump to caller
//! logic, after relocating the displaced prologue into an executable stub
//! so the original can still be invoked. The registry owns every hook;
//! dropping a hook (explicitly, via [`HookRegistry::remove_hook`], or at
//! registry teardown) restores the original bytes and releases the stub —
//! error cleanup and shutdown share that single path.

mod arch;
mod trampoline;

pub use arch::{JMP_ABS_SIZE, JMP_REL_SIZE, NOP, TRAP_OPCODE, encode_abs_jump, encode_rel_jump};

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mem::{CodeArena, CodeSlab, PatchMemory, RegionCache};
use crate::pattern::{Pattern, PatternSet, scan_region};
use trampoline::relocate_prologue;

/// Bytes read at the target while sizing the displaced prologue.
pub const MAX_PROLOGUE_BYTES: usize = 32;

/// Executable stub allocation per hook.
const STUB_SIZE: usize = 64;

/// Entry point for invoking the original function after its entry has been
/// patched. The address stays valid until the owning hook is removed.
#[derive(Debug)]
pub struct Trampoline {
    address: usize,
}

impl Trampoline {
    pub fn address(&self) -> usize {
        self.address
    }

    /// Reinterpret the stub entry as a typed function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a `fn`/`unsafe extern fn` pointer type matching the
    /// hooked function's true signature and calling convention, and the
    /// hook must still be installed when the pointer is invoked.
    pub unsafe fn cast<F: Copy>(&self) -> F {
        debug_assert_eq!(size_of::<F>(), size_of::<usize>());
        unsafe { std::mem::transmute_copy(&self.address) }
    }
}

/// Diagnostic view of an installed hook.
#[derive(Debug, Clone)]
pub struct HookSummary {
    pub name: String,
    pub target: usize,
    pub detour: usize,
    pub trampoline: usize,
}

struct Hook {
    name: String,
    target: usize,
    detour: usize,
    patch_len: usize,
    saved: Vec<u8>,
    stub: CodeSlab,
    patched: bool,
    patcher: Arc<dyn PatchMemory>,
    arena: Arc<dyn CodeArena>,
}

impl Drop for Hook {
    fn drop(&mut self) {
        if self.patched {
            match unsafe { self.patcher.patch(self.target, &self.saved) } {
                Ok(_) => debug!(
                    "Hook '{}': restored {} bytes at {:#x}",
                    self.name,
                    self.saved.len(),
                    self.target
                ),
                Err(e) => warn!(
                    "Hook '{}': failed to restore bytes at {:#x}: {}",
                    self.name, self.target, e
                ),
            }
        }
        unsafe { self.arena.release(&self.stub) };
    }
}

/// Creates and owns inline hooks.
///
/// Construct one at startup and share it by reference. Creation and
/// removal are expected to run from a controlling thread; the registry
/// detects name collisions but does not serialize racing calls on the
/// same name.
pub struct HookRegistry {
    cache: Arc<RegionCache>,
    patcher: Arc<dyn PatchMemory>,
    arena: Arc<dyn CodeArena>,
    hooks: Mutex<Vec<Hook>>,
}

impl HookRegistry {
    pub fn new(
        cache: Arc<RegionCache>,
        patcher: Arc<dyn PatchMemory>,
        arena: Arc<dyn CodeArena>,
    ) -> Self {
        Self {
            cache,
            patcher,
            arena,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Registry wired to the live platform backends.
    #[cfg(target_os = "windows")]
    pub fn system(cache: Arc<RegionCache>) -> Self {
        Self::new(
            cache,
            Arc::new(crate::mem::windows::SystemPatcher),
            Arc::new(crate::mem::windows::SystemArena),
        )
    }

    /// Install an inline hook at `target`, returning the trampoline for
    /// calling the original.
    ///
    /// On any failure nothing is registered and the bytes at `target` are
    /// untouched.
    ///
    /// # Safety
    ///
    /// `target` must be the entry of a patchable function in this process
    /// and `detour` must be a function pointer compatible with its
    /// signature; no thread may be executing the first
    /// [`MAX_PROLOGUE_BYTES`] of the target while the patch is written.
    pub unsafe fn create_hook(
        &self,
        name: &str,
        target: usize,
        detour: *const (),
    ) -> Result<Trampoline> {
        if target == 0 {
            return Err(Error::NullTarget);
        }
        if detour.is_null() {
            return Err(Error::NullDetour);
        }
        let detour = detour as usize;

        self.check_site_free(name, target)?;

        if !self.cache.is_readable(target, MAX_PROLOGUE_BYTES) {
            return Err(Error::UnreadableRegion {
                address: target,
                size: MAX_PROLOGUE_BYTES,
            });
        }

        let mut source = [0u8; MAX_PROLOGUE_BYTES];
        unsafe {
            std::ptr::copy_nonoverlapping(
                target as *const u8,
                source.as_mut_ptr(),
                MAX_PROLOGUE_BYTES,
            );
        }

        let stub = self.arena.alloc(target, STUB_SIZE)?;
        // From here on `hook` owns the stub; any early return below drops
        // it, which releases the allocation without touching the target.
        let mut hook = Hook {
            name: name.to_string(),
            target,
            detour,
            patch_len: 0,
            saved: Vec::new(),
            stub,
            patched: false,
            patcher: Arc::clone(&self.patcher),
            arena: Arc::clone(&self.arena),
        };

        // Prefer the 5-byte relative form; fall back to the 14-byte
        // absolute jump when the detour is out of rel32 range.
        let jump_to_detour = match encode_rel_jump(target, detour) {
            Some(bytes) => bytes.to_vec(),
            None => encode_abs_jump(detour).to_vec(),
        };

        let relocated = relocate_prologue(
            &source,
            target as u64,
            stub.address as u64,
            jump_to_detour.len(),
        )?;
        hook.patch_len = relocated.consumed;

        let mut stub_code = relocated.bytes;
        stub_code.extend_from_slice(&encode_abs_jump(target + relocated.consumed));
        if stub_code.len() > stub.len {
            return Err(Error::NotEnoughSpace { address: target });
        }
        unsafe {
            self.patcher.patch(stub.address, &stub_code)?;
        }

        let mut site = jump_to_detour;
        site.resize(relocated.consumed, NOP);

        hook.saved = unsafe { self.patcher.patch(target, &site)? };
        hook.patched = true;

        let trampoline = Trampoline {
            address: hook.stub.address,
        };

        {
            let mut hooks = self.lock_hooks();
            // Racing creations of the same name are unsupported, but keep
            // the table consistent: the loser unpatches itself on drop.
            if hooks.iter().any(|h| h.name == name) {
                return Err(Error::DuplicateHook(name.to_string()));
            }
            hooks.push(hook);
        }

        info!(
            "Created hook '{}' at {:#x} (detour {:#x}, trampoline {:#x})",
            name,
            target,
            detour,
            trampoline.address()
        );
        Ok(trampoline)
    }

    /// Locate the hook target by pattern and install the hook.
    ///
    /// Compile failure, an unreadable scan region, or a missing pattern
    /// all fail the composition with no side effects.
    ///
    /// # Safety
    ///
    /// As for [`Self::create_hook`]; additionally `[base, base + size)`
    /// must stay mapped for the duration of the scan.
    pub unsafe fn create_hook_by_pattern(
        &self,
        name: &str,
        base: usize,
        size: usize,
        pattern_text: &str,
        offset: i64,
        detour: *const (),
    ) -> Result<Trampoline> {
        let pattern = Pattern::parse(pattern_text)?;

        if !self.cache.is_readable(base, size) {
            return Err(Error::UnreadableRegion {
                address: base,
                size,
            });
        }

        let found = unsafe { scan_region(base, size, &pattern) }.ok_or_else(|| {
            Error::PatternNotFound {
                pattern: pattern.to_string(),
            }
        })?;
        let target = found.wrapping_add_signed(offset as isize);
        debug!(
            "Pattern for '{}' matched at {:#x}; hook target {:#x}",
            name, found, target
        );

        unsafe { self.create_hook(name, target, detour) }
    }

    /// Install a hook described by a [`PatternSet`] entry of the same name.
    ///
    /// # Safety
    ///
    /// As for [`Self::create_hook_by_pattern`].
    pub unsafe fn create_hook_from_set(
        &self,
        set: &PatternSet,
        name: &str,
        base: usize,
        size: usize,
        detour: *const (),
    ) -> Result<Trampoline> {
        let entry = set
            .entry(name)
            .ok_or_else(|| Error::UnknownPatternEntry(name.to_string()))?;
        unsafe { self.create_hook_by_pattern(name, base, size, &entry.pattern, entry.offset, detour) }
    }

    /// Remove a hook by name, restoring the original bytes.
    ///
    /// Returns `false` for unknown names, so speculative cleanup calls are
    /// harmless.
    pub fn remove_hook(&self, name: &str) -> bool {
        let hook = {
            let mut hooks = self.lock_hooks();
            hooks
                .iter()
                .position(|h| h.name == name)
                .map(|idx| hooks.remove(idx))
        };

        match hook {
            Some(hook) => {
                // Unpatching happens on drop, outside the table lock.
                drop(hook);
                info!("Removed hook '{}'", name);
                true
            }
            None => {
                debug!("Hook '{}' not found for removal", name);
                false
            }
        }
    }

    /// Tear down every hook in registration order. Safe to call more than
    /// once; also runs on drop.
    pub fn remove_all(&self) {
        let drained = {
            let mut hooks = self.lock_hooks();
            std::mem::take(&mut *hooks)
        };
        if drained.is_empty() {
            return;
        }

        info!("Removing {} hook(s)", drained.len());
        for hook in drained {
            drop(hook);
        }
    }

    pub fn len(&self) -> usize {
        self.lock_hooks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_hooks().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock_hooks().iter().any(|h| h.name == name)
    }

    pub fn list(&self) -> Vec<HookSummary> {
        self.lock_hooks()
            .iter()
            .map(|h| HookSummary {
                name: h.name.clone(),
                target: h.target,
                detour: h.detour,
                trampoline: h.stub.address,
            })
            .collect()
    }

    fn check_site_free(&self, name: &str, target: usize) -> Result<()> {
        let hooks = self.lock_hooks();

        if hooks.iter().any(|h| h.name == name) {
            return Err(Error::DuplicateHook(name.to_string()));
        }

        // Nested hooks over the same bytes are unsupported. A patch never
        // exceeds the absolute jump width, so the check is conservative:
        // targets within that window of an existing patch are rejected.
        for h in hooks.iter() {
            let existing_end = h.target.saturating_add(h.patch_len);
            let new_end = target.saturating_add(JMP_ABS_SIZE);
            if target < existing_end && h.target < new_end {
                return Err(Error::OverlappingHook {
                    name: name.to_string(),
                    address: target,
                });
            }
        }

        Ok(())
    }

    // Teardown must proceed even if a panicking thread poisoned the table.
    fn lock_hooks(&self) -> MutexGuard<'_, Vec<Hook>> {
        match self.hooks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        self.remove_all();
    }
}
