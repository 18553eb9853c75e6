//! Architectural interrupt mask save/disable/restore.
//!
//! These execute privileged instructions. In a user-mode process they fault,
//! so hosted builds route masking through the software mask in
//! [`crate::guard`] unless the `privileged` feature is enabled.

#![allow(unsafe_code)]

/// Saved interrupt-enable state, restored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub usize);

/// x86 EFLAGS.IF
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const EFLAGS_IF: usize = 1 << 9;

/// Save the flags register and clear IF.
///
/// # Safety
///
/// Requires ring 0.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    let flags: u64;
    core::arch::asm!("pushfq", "pop {}", "cli", out(reg) flags, options(nomem));
    #[allow(clippy::cast_possible_truncation)]
    IrqState(flags as usize)
}

/// Save the flags register and clear IF.
///
/// # Safety
///
/// Requires ring 0.
#[cfg(target_arch = "x86")]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    let flags: u32;
    core::arch::asm!("pushfd", "pop {}", "cli", out(reg) flags, options(nomem));
    IrqState(flags as usize)
}

/// Re-enable interrupts if they were enabled when `state` was saved.
///
/// # Safety
///
/// Requires ring 0; `state` must come from [`save_and_disable`].
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub unsafe fn restore(state: IrqState) {
    if state.0 & EFLAGS_IF != 0 {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Save DAIF and mask IRQs.
///
/// # Safety
///
/// Requires EL1 or higher.
#[cfg(target_arch = "aarch64")]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    let daif: u64;
    core::arch::asm!(
        "mrs {}, daif",
        "msr daifset, #2",
        out(reg) daif,
        options(nomem, nostack, preserves_flags)
    );
    #[allow(clippy::cast_possible_truncation)]
    IrqState(daif as usize)
}

/// Write back the saved DAIF.
///
/// # Safety
///
/// Requires EL1 or higher; `state` must come from [`save_and_disable`].
#[cfg(target_arch = "aarch64")]
#[inline]
pub unsafe fn restore(state: IrqState) {
    core::arch::asm!(
        "msr daif, {}",
        in(reg) state.0 as u64,
        options(nomem, nostack, preserves_flags)
    );
}

/// Save CPSR and set the I bit.
///
/// # Safety
///
/// Requires a privileged mode.
#[cfg(target_arch = "arm")]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    let cpsr: u32;
    core::arch::asm!(
        "mrs {}, cpsr",
        "cpsid i",
        out(reg) cpsr,
        options(nomem, nostack, preserves_flags)
    );
    IrqState(cpsr as usize)
}

/// Restore the control field of CPSR.
///
/// # Safety
///
/// Requires a privileged mode; `state` must come from [`save_and_disable`].
#[cfg(target_arch = "arm")]
#[inline]
pub unsafe fn restore(state: IrqState) {
    core::arch::asm!(
        "msr cpsr_c, {}",
        in(reg) state.0 as u32,
        options(nomem, nostack, preserves_flags)
    );
}

/// mstatus.MIE
#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
const MSTATUS_MIE: usize = 1 << 3;

/// Clear mstatus.MIE and return the previous mstatus.
///
/// # Safety
///
/// Requires machine mode.
#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    let mstatus: usize;
    core::arch::asm!(
        "csrrci {}, mstatus, 8",
        out(reg) mstatus,
        options(nomem, nostack, preserves_flags)
    );
    IrqState(mstatus)
}

/// Set mstatus.MIE again if it was set.
///
/// # Safety
///
/// Requires machine mode; `state` must come from [`save_and_disable`].
#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
#[inline]
pub unsafe fn restore(state: IrqState) {
    if state.0 & MSTATUS_MIE != 0 {
        core::arch::asm!("csrsi mstatus, 8", options(nomem, nostack, preserves_flags));
    }
}

/// Save MSR and clear MSR[EE].
///
/// # Safety
///
/// Requires supervisor state.
#[cfg(all(
    feature = "nightly-asm",
    any(target_arch = "powerpc", target_arch = "powerpc64")
))]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    let msr: usize;
    core::arch::asm!("mfmsr {}", "wrteei 0", out(reg) msr, options(nomem, nostack));
    IrqState(msr)
}

/// Write back the saved MSR.
///
/// # Safety
///
/// Requires supervisor state; `state` must come from [`save_and_disable`].
#[cfg(all(
    feature = "nightly-asm",
    any(target_arch = "powerpc", target_arch = "powerpc64")
))]
#[inline]
pub unsafe fn restore(state: IrqState) {
    core::arch::asm!("mtmsr {}", in(reg) state.0, options(nomem, nostack));
}

/// No architectural mask on this target.
///
/// # Safety
///
/// Always safe; kept `unsafe` for a uniform signature.
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv32",
    target_arch = "riscv64",
    all(
        feature = "nightly-asm",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
#[inline]
pub unsafe fn save_and_disable() -> IrqState {
    IrqState(0)
}

/// No architectural mask on this target.
///
/// # Safety
///
/// Always safe; kept `unsafe` for a uniform signature.
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv32",
    target_arch = "riscv64",
    all(
        feature = "nightly-asm",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
#[inline]
pub unsafe fn restore(_state: IrqState) {}
