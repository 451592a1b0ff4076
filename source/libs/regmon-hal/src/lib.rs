// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams used by the register access monitor
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 4 unit tests + `tests/bus.rs`
//! PUBLIC API: Bus, Tlb, InsnFetch, MmioBus, SfenceTlb, KernelText
//! INVARIANTS: Raw accessors are only constructible through `unsafe` constructors

#![cfg_attr(not(test), no_std)]

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

/// Basic bus access trait for device register windows.
pub trait Bus {
    fn read(&self, addr: usize) -> u32;
    fn write(&self, addr: usize, value: u32);
}

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache on every hart that may hold a stale entry.
    fn flush_all(&self);
}

/// Reads instruction bytes out of the faulting context's text.
pub trait InsnFetch {
    /// Returns the byte at `addr`, or `None` if it cannot be read safely.
    fn fetch_byte(&self, addr: usize) -> Option<u8>;
}

impl<T: Bus + ?Sized> Bus for &T {
    fn read(&self, addr: usize) -> u32 {
        (**self).read(addr)
    }

    fn write(&self, addr: usize, value: u32) {
        (**self).write(addr, value)
    }
}

impl<T: Tlb + ?Sized> Tlb for &T {
    fn flush_all(&self) {
        (**self).flush_all()
    }
}

impl<T: InsnFetch + ?Sized> InsnFetch for &T {
    fn fetch_byte(&self, addr: usize) -> Option<u8> {
        (**self).fetch_byte(addr)
    }
}

/// Volatile word access to physically mapped device registers.
pub struct MmioBus {
    _private: (),
}

impl MmioBus {
    /// # Safety
    /// Every address handed to [`Bus::read`]/[`Bus::write`] must be a mapped,
    /// 4-byte aligned device register for the lifetime of the bus.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Bus for MmioBus {
    fn read(&self, addr: usize) -> u32 {
        // SAFETY: guaranteed by the contract of `MmioBus::new`.
        unsafe { read_volatile(addr as *const u32) }
    }

    fn write(&self, addr: usize, value: u32) {
        // SAFETY: guaranteed by the contract of `MmioBus::new`.
        unsafe { write_volatile(addr as *mut u32, value) }
        fence(Ordering::SeqCst);
    }
}

/// Sv39 TLB helper issuing `sfence.vma` when compiled for RISC-V.
pub struct SfenceTlb;

impl Tlb for SfenceTlb {
    fn flush_all(&self) {
        fence(Ordering::SeqCst);
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        unsafe {
            core::arch::asm!("sfence.vma x0, x0", options(nostack));
        }
    }
}

/// Fetches instruction bytes straight out of the current address space.
pub struct KernelText {
    _private: (),
}

impl KernelText {
    /// # Safety
    /// Program counters passed to the monitor must point into mapped, readable text.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl InsnFetch for KernelText {
    fn fetch_byte(&self, addr: usize) -> Option<u8> {
        if addr == 0 {
            return None;
        }
        // SAFETY: guaranteed by the contract of `KernelText::new`.
        Some(unsafe { read_volatile(addr as *const u8) })
    }
}
