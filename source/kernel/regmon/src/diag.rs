// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap counters for the register monitor
//! OWNERS: @kernel-team
//! PUBLIC API: TrapStats, TrapStatsSnapshot
//! INVARIANTS: Counters only grow; relaxed ordering, no cross-counter consistency

use core::sync::atomic::{AtomicU64, Ordering};

/// Per-dispatcher fault counters.
#[derive(Debug, Default)]
pub struct TrapStats {
    resolved: AtomicU64,
    bypassed: AtomicU64,
    denied: AtomicU64,
    overflowed: AtomicU64,
    unmatched: AtomicU64,
    unsupported: AtomicU64,
    misconfigured: AtomicU64,
    written_back: AtomicU64,
}

/// Point-in-time copy of [`TrapStats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrapStatsSnapshot {
    /// Faults that ended with `FaultOutcome::Resolved`.
    pub resolved: u64,
    /// Writes inside a bypass sub-range.
    pub bypassed: u64,
    /// Writes refused by a validator or by `BypassPolicy::Deny`.
    pub denied: u64,
    /// Two-byte writes at the last register offset.
    pub overflowed: u64,
    /// Faults outside every guarded region.
    pub unmatched: u64,
    /// Reads and stores whose instruction could not be fetched.
    pub unsupported: u64,
    /// Regions whose device the policy engine does not track.
    pub misconfigured: u64,
    /// Words forwarded to the device.
    pub written_back: u64,
}

impl TrapStats {
    pub const fn new() -> Self {
        Self {
            resolved: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            unsupported: AtomicU64::new(0),
            misconfigured: AtomicU64::new(0),
            written_back: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn bump_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_overflowed(&self) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_misconfigured(&self) {
        self.misconfigured.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump_written_back(&self) {
        self.written_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrapStatsSnapshot {
        TrapStatsSnapshot {
            resolved: self.resolved.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            misconfigured: self.misconfigured.load(Ordering::Relaxed),
            written_back: self.written_back.load(Ordering::Relaxed),
        }
    }
}
