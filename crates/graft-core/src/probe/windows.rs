//! Platform glue for the shared fault filter.
//!
//! The platform invokes one handler chain per process and passes it no
//! user data, so installed filters are tracked in a process-wide list of
//! weak references that the handler walks on every fault. The handler
//! itself is registered when the first filter installs and removed when
//! the last one (and its probes) are gone.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, CONTEXT, EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
};

use super::{FilterInner, FilterVerdict, Register, TrapFrame};
use crate::error::{Error, Result};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

static FILTER_CHAIN: Mutex<Vec<Weak<FilterInner>>> = Mutex::new(Vec::new());
static VEH_HANDLE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

fn lock_chain() -> MutexGuard<'static, Vec<Weak<FilterInner>>> {
    match FILTER_CHAIN.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn register_filter(inner: &Arc<FilterInner>) -> Result<()> {
    let mut chain = lock_chain();
    chain.retain(|weak| weak.strong_count() > 0);
    chain.push(Arc::downgrade(inner));

    if VEH_HANDLE.load(Ordering::SeqCst).is_null() {
        // First consumer: register the single process-wide handler, ahead
        // of the default handling.
        let handle = unsafe { AddVectoredExceptionHandler(1, Some(fault_filter)) };
        if handle.is_null() {
            chain.pop();
            return Err(Error::FilterRegistration);
        }
        VEH_HANDLE.store(handle, Ordering::SeqCst);
    }

    Ok(())
}

pub(crate) fn unregister_filter(inner: *const FilterInner) {
    let mut chain = lock_chain();
    chain.retain(|weak| weak.as_ptr() != inner && weak.strong_count() > 0);

    if chain.is_empty() {
        let handle = VEH_HANDLE.swap(std::ptr::null_mut(), Ordering::SeqCst);
        if !handle.is_null() {
            unsafe {
                RemoveVectoredExceptionHandler(handle);
            }
        }
    }
}

fn frame_from_context(context: &CONTEXT) -> TrapFrame {
    let mut frame = TrapFrame {
        ip: context.Rip,
        ..Default::default()
    };
    frame.set_register(Register::Rax, context.Rax);
    frame.set_register(Register::Rbx, context.Rbx);
    frame.set_register(Register::Rcx, context.Rcx);
    frame.set_register(Register::Rdx, context.Rdx);
    frame.set_register(Register::Rsi, context.Rsi);
    frame.set_register(Register::Rdi, context.Rdi);
    frame.set_register(Register::Rbp, context.Rbp);
    frame.set_register(Register::Rsp, context.Rsp);
    frame.set_register(Register::R8, context.R8);
    frame.set_register(Register::R9, context.R9);
    frame.set_register(Register::R10, context.R10);
    frame.set_register(Register::R11, context.R11);
    frame.set_register(Register::R12, context.R12);
    frame.set_register(Register::R13, context.R13);
    frame.set_register(Register::R14, context.R14);
    frame.set_register(Register::R15, context.R15);
    frame
}

unsafe extern "system" fn fault_filter(info: *mut EXCEPTION_POINTERS) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let record = unsafe { (*info).ExceptionRecord };
    let context = unsafe { (*info).ContextRecord };
    if record.is_null() || context.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let kind = unsafe { (*record).ExceptionCode.0 } as u32;
    let frame = frame_from_context(unsafe { &*context });

    // Snapshot the chain, then dispatch with the lock released: dropping
    // an upgraded reference here may run the filter's teardown, which
    // takes the chain lock itself.
    let snapshot: Vec<Weak<FilterInner>> = lock_chain().clone();
    for weak in snapshot {
        let Some(filter) = weak.upgrade() else {
            continue;
        };
        if let FilterVerdict::Resume { ip } = filter.dispatch(kind, &frame) {
            // Only the resume address is written back; the faulting
            // thread re-executes the restored instruction.
            unsafe {
                (*context).Rip = ip;
            }
            return EXCEPTION_CONTINUE_EXECUTION;
        }
    }

    EXCEPTION_CONTINUE_SEARCH
}
