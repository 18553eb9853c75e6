//! Per-architecture monotonic counter reads.
//!
//! | target | source |
//! |---|---|
//! | x86 / x86-64 | `rdtsc` |
//! | AArch64 | `CNTVCT_EL0` (frequency from `CNTFRQ_EL0`) |
//! | RISC-V 64 | `rdcycle` (privileged) or `rdtime` |
//! | RISC-V 32 | `rdcycleh`/`rdcycle` pair with high-half retry |
//! | PowerPC | `mftbu`/`mftb` pair with retry (`nightly-asm`) |
//! | 32-bit ARM, others | software pseudo-counter |

#![allow(unsafe_code)]

#[allow(unused_imports)]
use std::sync::atomic::{AtomicU64, Ordering};

/// Read a 64-bit counter exposed as two 32-bit halves.
///
/// Re-reads the high half after the low half and retries if it moved, so a
/// carry between the two reads never produces a torn value.
#[inline]
pub fn read_split<H, L>(mut read_hi: H, mut read_lo: L) -> u64
where
    H: FnMut() -> u32,
    L: FnMut() -> u32,
{
    loop {
        let hi = read_hi();
        let lo = read_lo();
        if read_hi() == hi {
            return (u64::from(hi) << 32) | u64::from(lo);
        }
    }
}

#[allow(dead_code)]
static PSEUDO_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Software counter advancing by one on every read.
#[allow(dead_code)]
#[inline]
fn pseudo_counter() -> u64 {
    PSEUDO_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Short name of the counter source compiled for this target.
#[must_use]
pub const fn counter_source() -> &'static str {
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        "tsc"
    } else if cfg!(target_arch = "aarch64") {
        "cntvct"
    } else if cfg!(all(target_arch = "riscv64", not(feature = "privileged"))) {
        "time"
    } else if cfg!(any(target_arch = "riscv32", target_arch = "riscv64")) {
        "cycle"
    } else if cfg!(all(
        feature = "nightly-asm",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )) {
        "timebase"
    } else {
        "pseudo"
    }
}

/// Read the raw counter.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtsc only writes edx:eax and touches no memory
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Read the raw counter.
#[cfg(target_arch = "aarch64")]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    let value: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on every supported OS; isb
    // keeps the read from being hoisted above earlier instructions
    unsafe {
        core::arch::asm!(
            "isb",
            "mrs {}, cntvct_el0",
            out(reg) value,
            options(nomem, nostack, preserves_flags)
        );
    }
    value
}

/// Read the raw counter.
#[cfg(target_arch = "riscv64")]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    let value: u64;
    // SAFETY: CSR reads have no side effects. Hosted kernels usually trap user
    // access to the cycle CSR, so only privileged builds use it.
    #[cfg(feature = "privileged")]
    unsafe {
        core::arch::asm!("rdcycle {}", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(feature = "privileged"))]
    unsafe {
        core::arch::asm!("rdtime {}", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Read the raw counter.
#[cfg(target_arch = "riscv32")]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    read_split(
        || {
            let hi: u32;
            // SAFETY: CSR read without side effects
            unsafe {
                core::arch::asm!("rdcycleh {}", out(reg) hi, options(nomem, nostack, preserves_flags));
            }
            hi
        },
        || {
            let lo: u32;
            // SAFETY: CSR read without side effects
            unsafe {
                core::arch::asm!("rdcycle {}", out(reg) lo, options(nomem, nostack, preserves_flags));
            }
            lo
        },
    )
}

/// Read the raw counter.
#[cfg(all(feature = "nightly-asm", target_arch = "powerpc"))]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    read_split(
        || {
            let hi: u32;
            // SAFETY: time base reads have no side effects
            unsafe {
                core::arch::asm!("mftbu {}", out(reg) hi, options(nomem, nostack, preserves_flags));
            }
            hi
        },
        || {
            let lo: u32;
            // SAFETY: time base reads have no side effects
            unsafe {
                core::arch::asm!("mftb {}", out(reg) lo, options(nomem, nostack, preserves_flags));
            }
            lo
        },
    )
}

/// Read the raw counter.
#[cfg(all(feature = "nightly-asm", target_arch = "powerpc64"))]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    let value: u64;
    // SAFETY: time base reads have no side effects
    unsafe {
        core::arch::asm!("mftb {}", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Read the raw counter.
#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv32",
    target_arch = "riscv64",
    all(
        feature = "nightly-asm",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
#[inline]
#[must_use]
pub fn read_counter() -> u64 {
    pseudo_counter()
}

/// Architected counter frequency, when the hardware publishes one.
#[cfg(target_arch = "aarch64")]
#[must_use]
pub fn nominal_frequency() -> Option<u64> {
    let freq: u64;
    // SAFETY: CNTFRQ_EL0 is a read-only register accessible from EL0
    unsafe {
        core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    // Only the low 32 bits are defined
    let freq = freq & 0xFFFF_FFFF;
    (freq != 0).then_some(freq)
}

/// Architected counter frequency, when the hardware publishes one.
#[cfg(not(target_arch = "aarch64"))]
#[must_use]
pub fn nominal_frequency() -> Option<u64> {
    None
}
