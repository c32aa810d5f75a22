//! One-shot register capture via trap patching.
//!
//! Some pointers exist only as a register value at one fleeting moment of
//! execution. A [`TrapProbe`] overwrites the instruction at that moment
//! with breakpoint opcodes; when the process-wide fault filter sees the
//! resulting fault at exactly the armed address it reads the register out
//! of the captured context, restores the original bytes, and resumes the
//! thread at the restored instruction. Armed → Triggered → Disarmed is
//! strictly one way; a probe that never fires stays pending until its
//! owner disarms or drops it.

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub mod windows;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hook::TRAP_OPCODE;
use crate::mem::{PatchMemory, RegionCache};

/// Fault kind raised by the breakpoint opcode.
pub const BREAKPOINT_FAULT: u32 = 0x8000_0003;

/// x64 general-purpose registers a probe can capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const GPR_COUNT: usize = 16;

/// Portable snapshot of a faulting thread's context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub ip: u64,
    pub gpr: [u64; GPR_COUNT],
}

impl TrapFrame {
    pub fn register(&self, register: Register) -> u64 {
        self.gpr[register as usize]
    }

    pub fn set_register(&mut self, register: Register, value: u64) {
        self.gpr[register as usize] = value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Armed,
    Triggered,
    Disarmed,
}

const STATE_ARMED: u8 = 0;
const STATE_TRIGGERED: u8 = 1;
const STATE_DISARMED: u8 = 2;

/// What the platform handler should do with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Resume the faulting thread at `ip`; the fault was ours.
    Resume { ip: u64 },
    /// Not ours; hand the fault to the next handler in the chain.
    Pass,
}

struct ProbeShared {
    address: usize,
    register: Register,
    displacement: i64,
    saved: Vec<u8>,
    state: AtomicU8,
    captured: Mutex<Option<usize>>,
}

pub(crate) struct FilterInner {
    patcher: Arc<dyn PatchMemory>,
    probes: Mutex<HashMap<usize, Arc<ProbeShared>>>,
    installed: AtomicBool,
}

impl FilterInner {
    /// Decide a fault. Breakpoint faults at an armed address capture the
    /// register and restore the site; everything else — other kinds, other
    /// addresses — is passed through untouched.
    pub(crate) fn dispatch(&self, kind: u32, frame: &TrapFrame) -> FilterVerdict {
        if kind != BREAKPOINT_FAULT {
            return FilterVerdict::Pass;
        }

        let probe = {
            let probes = self.lock_probes();
            probes.get(&(frame.ip as usize)).cloned()
        };
        let Some(probe) = probe else {
            return FilterVerdict::Pass;
        };

        match probe.state.compare_exchange(
            STATE_ARMED,
            STATE_TRIGGERED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                let raw = frame.register(probe.register);
                if raw == 0 {
                    // The dynamic state is not there yet; rearm and let the
                    // chain have the fault.
                    probe.state.store(STATE_ARMED, Ordering::SeqCst);
                    return FilterVerdict::Pass;
                }

                let value = (raw as usize).wrapping_add_signed(probe.displacement as isize);

                // Restore first so the thread re-executes the real
                // instruction when it resumes.
                if let Err(e) = unsafe { self.patcher.patch(probe.address, &probe.saved) } {
                    debug!(
                        "Probe at {:#x}: restore failed after capture: {}",
                        probe.address, e
                    );
                }

                match probe.captured.lock() {
                    Ok(mut captured) => *captured = Some(value),
                    Err(poisoned) => *poisoned.into_inner() = Some(value),
                }
                probe.state.store(STATE_DISARMED, Ordering::SeqCst);

                debug!(
                    "Probe at {:#x}: captured {}={:#x} (value {:#x})",
                    probe.address, probe.register, raw, value
                );
                FilterVerdict::Resume {
                    ip: probe.address as u64,
                }
            }
            Err(_) => {
                // Another thread won the restore race, or the probe already
                // disarmed while this fault was in flight. The original
                // bytes are (being) restored, so re-executing is safe.
                FilterVerdict::Resume {
                    ip: probe.address as u64,
                }
            }
        }
    }

    fn lock_probes(&self) -> MutexGuard<'_, HashMap<usize, Arc<ProbeShared>>> {
        match self.probes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for FilterInner {
    fn drop(&mut self) {
        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        if self.installed.load(Ordering::SeqCst) {
            self::windows::unregister_filter(self as *const FilterInner);
        }
    }
}

/// Owner of the trap-probe table and (when installed) the single
/// process-wide fault-filter registration.
///
/// Construct one at startup and arm probes through it. The platform
/// handler is shared by every installed filter and removed once the last
/// filter and its probes are gone.
pub struct FaultFilter {
    inner: Arc<FilterInner>,
    cache: Arc<RegionCache>,
}

impl FaultFilter {
    /// A filter that is not wired into the platform fault chain. Faults
    /// must be delivered via `dispatch`; used for composition and tests.
    pub fn new(cache: Arc<RegionCache>, patcher: Arc<dyn PatchMemory>) -> Self {
        Self {
            inner: Arc::new(FilterInner {
                patcher,
                probes: Mutex::new(HashMap::new()),
                installed: AtomicBool::new(false),
            }),
            cache,
        }
    }

    /// A filter registered with the process-wide fault chain.
    #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
    pub fn install(cache: Arc<RegionCache>) -> Result<Self> {
        let filter = Self::new(cache, Arc::new(crate::mem::windows::SystemPatcher));
        self::windows::register_filter(&filter.inner)?;
        filter.inner.installed.store(true, Ordering::SeqCst);
        info!("Fault filter installed");
        Ok(filter)
    }

    /// Arm a one-shot probe: save `trap_len` bytes at `address` and
    /// overwrite them with breakpoint opcodes.
    ///
    /// # Safety
    ///
    /// `address` must be the start of one or more whole instructions
    /// totalling exactly `trap_len` bytes, in code this process may patch,
    /// and the instruction must be safe to re-execute after restoration.
    pub unsafe fn arm(
        &self,
        address: usize,
        trap_len: usize,
        register: Register,
    ) -> Result<TrapProbe> {
        unsafe { self.arm_with_displacement(address, trap_len, register, 0) }
    }

    /// Like [`Self::arm`], with `displacement` added to the captured
    /// register before the value is exposed.
    ///
    /// # Safety
    ///
    /// As for [`Self::arm`].
    pub unsafe fn arm_with_displacement(
        &self,
        address: usize,
        trap_len: usize,
        register: Register,
        displacement: i64,
    ) -> Result<TrapProbe> {
        if address == 0 {
            return Err(Error::NullTarget);
        }
        if trap_len == 0 {
            return Err(Error::ZeroTrapLength);
        }
        if !self.cache.is_readable(address, trap_len) {
            return Err(Error::UnreadableRegion {
                address,
                size: trap_len,
            });
        }
        if self.inner.lock_probes().contains_key(&address) {
            return Err(Error::ProbeAlreadyArmed { address });
        }

        let trap = vec![TRAP_OPCODE; trap_len];
        let saved = unsafe { self.inner.patcher.patch(address, &trap)? };

        let shared = Arc::new(ProbeShared {
            address,
            register,
            displacement,
            saved,
            state: AtomicU8::new(STATE_ARMED),
            captured: Mutex::new(None),
        });

        {
            let mut probes = self.inner.lock_probes();
            if probes.contains_key(&address) {
                // Lost an arming race; undo our patch and report.
                drop(probes);
                unsafe {
                    self.inner.patcher.patch(address, &shared.saved)?;
                }
                return Err(Error::ProbeAlreadyArmed { address });
            }
            probes.insert(address, Arc::clone(&shared));
        }

        info!(
            "Armed probe at {:#x} ({} bytes, capturing {}{:+})",
            address, trap_len, register, displacement
        );

        Ok(TrapProbe {
            shared,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Deliver a fault to this filter's probes, as the platform handler
    /// would.
    pub fn dispatch(&self, kind: u32, frame: &TrapFrame) -> FilterVerdict {
        self.inner.dispatch(kind, frame)
    }

    /// Probes currently tracked, pending or already disarmed.
    pub fn probe_count(&self) -> usize {
        self.inner.lock_probes().len()
    }

    /// Whether this filter participates in the process fault chain.
    pub fn is_installed(&self) -> bool {
        self.inner.installed.load(Ordering::SeqCst)
    }
}

/// Owning handle for one armed trap. Dropping it disarms (restores the
/// original bytes) if the probe never fired.
pub struct TrapProbe {
    shared: Arc<ProbeShared>,
    inner: Arc<FilterInner>,
}

impl std::fmt::Debug for TrapProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapProbe")
            .field("address", &self.shared.address)
            .finish()
    }
}

impl TrapProbe {
    pub fn address(&self) -> usize {
        self.shared.address
    }

    pub fn register(&self) -> Register {
        self.shared.register
    }

    pub fn state(&self) -> ProbeState {
        match self.shared.state.load(Ordering::SeqCst) {
            STATE_ARMED => ProbeState::Armed,
            STATE_TRIGGERED => ProbeState::Triggered,
            _ => ProbeState::Disarmed,
        }
    }

    /// The captured value, or `None` while the probe is still pending.
    pub fn captured(&self) -> Option<usize> {
        match self.shared.captured.lock() {
            Ok(captured) => *captured,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Poll for the captured value until `timeout` elapses.
    ///
    /// On timeout the trap stays installed; disarm or drop the probe to
    /// take it back out.
    pub fn wait(&self, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.captured() {
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Restore the original bytes if the probe is still armed.
    pub fn disarm(&self) -> Result<()> {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_ARMED,
                STATE_DISARMED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            unsafe {
                self.inner.patcher.patch(self.shared.address, &self.shared.saved)?;
            }
            debug!("Probe at {:#x} disarmed without firing", self.shared.address);
        }
        Ok(())
    }
}

impl Drop for TrapProbe {
    fn drop(&mut self) {
        let _ = self.disarm();
        // The table entry stays alive until here so that late faults from
        // the capture window still resolve to a verdict.
        self.inner.lock_probes().remove(&self.shared.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::mock::{CountingQuery, RawPatcher};
    use crate::mem::{RegionReport, protect};

    const ACCESS_VIOLATION: u32 = 0xC000_0005;

    fn filter_for(buffer: &[u8]) -> FaultFilter {
        let region = RegionReport {
            base: buffer.as_ptr() as usize,
            size: buffer.len(),
            protection: protect::EXECUTE_READWRITE,
            committed: true,
        };
        let cache = Arc::new(RegionCache::new(Box::new(CountingQuery::shared(vec![
            region,
        ]))));
        FaultFilter::new(cache, Arc::new(RawPatcher))
    }

    fn frame_at(ip: usize, register: Register, value: u64) -> TrapFrame {
        let mut frame = TrapFrame {
            ip: ip as u64,
            ..Default::default()
        };
        frame.set_register(register, value);
        frame
    }

    #[test]
    fn test_arm_writes_trap_bytes() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);

        let probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };
        assert_eq!(&buffer[..3], &[0xCC, 0xCC, 0xCC]);
        assert_eq!(buffer[3], 0x90);
        assert_eq!(probe.state(), ProbeState::Armed);
        assert_eq!(probe.captured(), None);
    }

    #[test]
    fn test_fault_at_other_address_passes_through() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };

        let verdict = filter.dispatch(
            BREAKPOINT_FAULT,
            &frame_at(address + 8, Register::R9, 0x5000),
        );

        assert_eq!(verdict, FilterVerdict::Pass);
        assert_eq!(probe.state(), ProbeState::Armed);
        assert_eq!(&buffer[..3], &[0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn test_other_fault_kind_passes_through() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };

        let verdict =
            filter.dispatch(ACCESS_VIOLATION, &frame_at(address, Register::R9, 0x5000));

        assert_eq!(verdict, FilterVerdict::Pass);
        assert_eq!(probe.state(), ProbeState::Armed);
    }

    #[test]
    fn test_matching_fault_captures_and_restores() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe {
            filter
                .arm_with_displacement(address, 3, Register::R9, 0x38)
                .unwrap()
        };

        let verdict = filter.dispatch(
            BREAKPOINT_FAULT,
            &frame_at(address, Register::R9, 0x7F00_0000),
        );

        assert_eq!(
            verdict,
            FilterVerdict::Resume {
                ip: address as u64
            }
        );
        assert_eq!(probe.state(), ProbeState::Disarmed);
        assert_eq!(probe.captured(), Some(0x7F00_0038));
        // Original bytes back in place for the re-execution.
        assert_eq!(&buffer[..3], &[0x8B, 0x43, 0x38]);
    }

    #[test]
    fn test_negative_displacement() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe {
            filter
                .arm_with_displacement(address, 1, Register::Rbx, -0x10)
                .unwrap()
        };

        filter.dispatch(BREAKPOINT_FAULT, &frame_at(address, Register::Rbx, 0x2000));
        assert_eq!(probe.captured(), Some(0x1FF0));
    }

    #[test]
    fn test_late_fault_after_capture_still_resumes() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let _probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };

        filter.dispatch(BREAKPOINT_FAULT, &frame_at(address, Register::R9, 0x5000));
        let snapshot = buffer.clone();

        // A thread that hit the trap before the restore faults afterwards:
        // it must be resumed, and the bytes must not be rewritten.
        let verdict =
            filter.dispatch(BREAKPOINT_FAULT, &frame_at(address, Register::R9, 0x9000));
        assert_eq!(
            verdict,
            FilterVerdict::Resume {
                ip: address as u64
            }
        );
        assert_eq!(buffer, snapshot);
    }

    #[test]
    fn test_zero_register_leaves_probe_armed() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };

        let verdict = filter.dispatch(BREAKPOINT_FAULT, &frame_at(address, Register::R9, 0));
        assert_eq!(verdict, FilterVerdict::Pass);
        assert_eq!(probe.state(), ProbeState::Armed);
        assert_eq!(&buffer[..3], &[0xCC, 0xCC, 0xCC]);

        // The next visit with live state captures normally.
        filter.dispatch(BREAKPOINT_FAULT, &frame_at(address, Register::R9, 0x4000));
        assert_eq!(probe.captured(), Some(0x4000));
    }

    #[test]
    fn test_second_probe_at_same_address_rejected() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let _probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };

        let err = unsafe { filter.arm(address, 3, Register::Rax).unwrap_err() };
        assert!(matches!(err, Error::ProbeAlreadyArmed { .. }));
    }

    #[test]
    fn test_zero_inputs_rejected() {
        let mut buffer = vec![0x90u8; 4];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);

        assert!(matches!(
            unsafe { filter.arm(0, 3, Register::R9) },
            Err(Error::NullTarget)
        ));
        assert!(matches!(
            unsafe { filter.arm(address, 0, Register::R9) },
            Err(Error::ZeroTrapLength)
        ));
    }

    #[test]
    fn test_unreadable_target_rejected() {
        let buffer = vec![0x90u8; 4];
        let filter = filter_for(&buffer);
        let err = unsafe { filter.arm(0x4000_0000, 3, Register::R9).unwrap_err() };
        assert!(matches!(err, Error::UnreadableRegion { .. }));
    }

    #[test]
    fn test_drop_disarms_pending_probe() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);

        let probe = unsafe { filter.arm(address, 3, Register::R9).unwrap() };
        assert_eq!(&buffer[..3], &[0xCC, 0xCC, 0xCC]);
        drop(probe);

        assert_eq!(&buffer[..3], &[0x8B, 0x43, 0x38]);
        assert_eq!(filter.probe_count(), 0);

        // The address is free for a new probe now.
        let again = unsafe { filter.arm(address, 3, Register::R9) };
        assert!(again.is_ok());
    }

    #[test]
    fn test_explicit_disarm_is_idempotent() {
        let mut buffer = vec![0x8B, 0x43, 0x38, 0x90, 0x90];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe { filter.arm(address, 2, Register::Rcx).unwrap() };

        probe.disarm().unwrap();
        assert_eq!(probe.state(), ProbeState::Disarmed);
        assert_eq!(&buffer[..2], &[0x8B, 0x43]);

        // Second disarm is a no-op.
        probe.disarm().unwrap();
        assert_eq!(&buffer[..2], &[0x8B, 0x43]);
    }

    #[test]
    fn test_wait_times_out_while_pending() {
        let mut buffer = vec![0x90u8; 4];
        let address = buffer.as_mut_ptr() as usize;
        let filter = filter_for(&buffer);
        let probe = unsafe { filter.arm(address, 1, Register::R9).unwrap() };

        assert_eq!(probe.wait(Duration::from_millis(10)), None);
        assert_eq!(probe.state(), ProbeState::Armed);
    }

    #[test]
    fn test_detached_filter_is_not_installed() {
        let buffer = vec![0x90u8; 4];
        let filter = filter_for(&buffer);
        assert!(!filter.is_installed());
    }

    #[test]
    fn test_register_name_roundtrip() {
        assert_eq!("r9".parse::<Register>().unwrap(), Register::R9);
        assert_eq!("rbx".parse::<Register>().unwrap(), Register::Rbx);
        assert_eq!(Register::R12.to_string(), "r12");
        assert!("xmm0".parse::<Register>().is_err());
    }
}
