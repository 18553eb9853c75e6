//! Scoped interrupt masking.
//!
//! [`InterruptGuard`] masks on construction and restores the saved state on
//! drop, so every exit path out of a critical section (including `?` and
//! panics) restores interrupts. Guards nest: an inner guard saves the already
//! masked state and restores exactly that.

use crate::arch::{self, IrqState};
use std::cell::Cell;
use std::marker::PhantomData;

/// Mask/restore primitive behind [`InterruptGuard`].
pub trait InterruptControl {
    /// Mask interrupts, returning the state to restore.
    fn save_and_disable() -> IrqState;
    /// Restore a state previously returned by `save_and_disable`.
    fn restore(state: IrqState);
}

/// Architectural masking (flags on x86, DAIF on AArch64, CPSR on ARMv7,
/// mstatus on RISC-V, MSR\[EE\] on PowerPC).
///
/// Only usable in a privileged execution context; a user-mode process
/// faults on the first mask instruction.
#[derive(Debug)]
pub struct NativeInterrupts;

impl InterruptControl for NativeInterrupts {
    #[inline]
    #[allow(unsafe_code)]
    fn save_and_disable() -> IrqState {
        // SAFETY: callers selected this control for a privileged context
        unsafe { arch::irq::save_and_disable() }
    }

    #[inline]
    #[allow(unsafe_code)]
    fn restore(state: IrqState) {
        // SAFETY: state came from save_and_disable on this CPU
        unsafe {
            arch::irq::restore(state);
        }
    }
}

thread_local! {
    static MASK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Per-thread software mask used in hosted builds.
///
/// Tracks nesting depth so code can assert it runs masked; mutual exclusion
/// with the hosted ISR thread comes from the lock around the task table.
#[derive(Debug)]
pub struct SoftInterrupts;

impl SoftInterrupts {
    /// Current nesting depth on this thread.
    #[must_use]
    pub fn depth() -> u32 {
        MASK_DEPTH.with(Cell::get)
    }

    /// Whether this thread is inside a masked section.
    #[must_use]
    pub fn is_masked() -> bool {
        Self::depth() > 0
    }
}

impl InterruptControl for SoftInterrupts {
    #[inline]
    fn save_and_disable() -> IrqState {
        MASK_DEPTH.with(|depth| {
            let previous = depth.get();
            depth.set(previous.saturating_add(1));
            IrqState(previous as usize)
        })
    }

    #[inline]
    fn restore(state: IrqState) {
        #[allow(clippy::cast_possible_truncation)]
        MASK_DEPTH.with(|depth| depth.set(state.0 as u32));
    }
}

/// Interrupt control used by the runtime on this build.
#[cfg(feature = "privileged")]
pub type DefaultInterrupts = NativeInterrupts;

/// Interrupt control used by the runtime on this build.
#[cfg(not(feature = "privileged"))]
pub type DefaultInterrupts = SoftInterrupts;

/// RAII interrupt mask. Not `Send`: it must be dropped on the CPU/thread
/// that created it.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct InterruptGuard<I: InterruptControl = DefaultInterrupts> {
    saved: IrqState,
    _marker: PhantomData<(I, *const ())>,
}

impl<I: InterruptControl> InterruptGuard<I> {
    /// Mask interrupts until the guard is dropped.
    #[inline]
    pub fn new() -> Self {
        Self {
            saved: I::save_and_disable(),
            _marker: PhantomData,
        }
    }
}

impl<I: InterruptControl> Default for InterruptGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> Drop for InterruptGuard<I> {
    #[inline]
    fn drop(&mut self) {
        I::restore(self.saved);
    }
}

impl<I: InterruptControl> std::fmt::Debug for InterruptGuard<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptGuard")
            .field("saved", &self.saved)
            .finish()
    }
}

/// Run `f` with interrupts masked.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = InterruptGuard::<DefaultInterrupts>::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallible(fail: bool) -> Result<u32, ()> {
        let _guard = InterruptGuard::<SoftInterrupts>::new();
        assert!(SoftInterrupts::is_masked());
        if fail {
            return Err(());
        }
        Ok(SoftInterrupts::depth())
    }

    #[test]
    fn test_guard_nests_and_restores() {
        assert_eq!(SoftInterrupts::depth(), 0);
        {
            let _outer = InterruptGuard::<SoftInterrupts>::new();
            assert_eq!(SoftInterrupts::depth(), 1);
            {
                let _inner = InterruptGuard::<SoftInterrupts>::new();
                assert_eq!(SoftInterrupts::depth(), 2);
            }
            assert_eq!(SoftInterrupts::depth(), 1);
        }
        assert!(!SoftInterrupts::is_masked());
    }

    #[test]
    fn test_early_return_restores() {
        assert!(fallible(true).is_err());
        assert_eq!(SoftInterrupts::depth(), 0);
        assert_eq!(fallible(false), Ok(1));
        assert_eq!(SoftInterrupts::depth(), 0);
    }

    #[test]
    fn test_panic_restores() {
        let result = std::panic::catch_unwind(|| {
            let _guard = InterruptGuard::<SoftInterrupts>::new();
            panic!("inside masked section");
        });
        assert!(result.is_err());
        assert_eq!(SoftInterrupts::depth(), 0);
    }

    #[test]
    fn test_mask_is_per_thread() {
        let _guard = InterruptGuard::<SoftInterrupts>::new();
        let other = std::thread::spawn(SoftInterrupts::depth).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(SoftInterrupts::depth(), 1);
    }

    #[test]
    fn test_without_interrupts_returns_value() {
        let value = without_interrupts(|| 42);
        assert_eq!(value, 42);
    }
}
