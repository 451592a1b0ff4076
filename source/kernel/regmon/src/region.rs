// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Static table of guarded register windows and containment lookup
//! OWNERS: @kernel-team
//! PUBLIC API: ProtectedRegion, RegionRegistry, RegionMatch, RegionError, BUILTIN_REGIONS
//! DEPENDS_ON: mm::{PermissionController, PageState}
//! INVARIANTS: Regions are non-empty, pairwise disjoint and fixed after construction;
//!             a bypass cutoff lies inside its region
//!
//! The bypass cutoff exists because register offsets are one byte wide: the
//! low sub-range of some windows cannot be expressed to the policy engine and
//! is excluded from checking. That is a protocol limitation, not a policy
//! decision; see `config::BypassPolicy`.

use alloc::vec::Vec;

use crate::mm::{PageState, PermissionController, TranslationError, PAGE_SIZE};
use crate::types::DeviceId;

/// One guarded register window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtectedRegion {
    pub base: usize,
    /// Exclusive.
    pub end: usize,
    pub device: DeviceId,
    /// Addresses in `[base, bypass_cutoff)` skip policy checks.
    pub bypass_cutoff: Option<usize>,
}

impl ProtectedRegion {
    pub const fn new(base: usize, end: usize, device: DeviceId, bypass_cutoff: Option<usize>) -> Self {
        Self { base, end, device, bypass_cutoff }
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    #[inline]
    pub fn overlaps(&self, other: &ProtectedRegion) -> bool {
        self.base < other.end && other.base < self.end
    }

    /// Page-aligned addresses covering the region.
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        let first = self.base & !(PAGE_SIZE - 1);
        (first..self.end).step_by(PAGE_SIZE)
    }
}

/// Built-in windows: vibrator, camera, vibrator driver IC, vibrator clock.
pub const BUILTIN_REGIONS: [ProtectedRegion; 4] = [
    ProtectedRegion::new(0xf901_6000, 0xf901_7000, DeviceId::VIBRATOR, None),
    ProtectedRegion::new(0xf901_7000, 0xf901_8000, DeviceId::CAMERA, None),
    ProtectedRegion::new(0xfa01_8000, 0xfa01_9000, DeviceId::VIB_DRIVER, Some(0xfa01_8300)),
    ProtectedRegion::new(0xf901_b000, 0xf901_c000, DeviceId::VIB_CLOCK, Some(0xf901_b400)),
];

/// Result of a successful lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionMatch {
    pub device: DeviceId,
    pub bypass: bool,
    pub region: ProtectedRegion,
}

/// Errors raised while validating a region table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region table is empty")]
    Empty,
    #[error("region {base:#x}..{end:#x} is empty or inverted")]
    Inverted { base: usize, end: usize },
    #[error("bypass cutoff {cutoff:#x} outside region {base:#x}..{end:#x}")]
    CutoffOutOfRange { base: usize, end: usize, cutoff: usize },
    #[error("regions at {first:#x} and {second:#x} overlap")]
    Overlap { first: usize, second: usize },
}

/// Address → device map for the guarded windows.
#[derive(Clone, Debug)]
pub struct RegionRegistry {
    regions: Vec<ProtectedRegion>,
}

impl RegionRegistry {
    /// Validates and adopts `regions`.
    pub fn new(regions: Vec<ProtectedRegion>) -> Result<Self, RegionError> {
        if regions.is_empty() {
            return Err(RegionError::Empty);
        }
        for region in &regions {
            if region.base >= region.end {
                return Err(RegionError::Inverted { base: region.base, end: region.end });
            }
            if let Some(cutoff) = region.bypass_cutoff {
                if cutoff <= region.base || cutoff > region.end {
                    return Err(RegionError::CutoffOutOfRange {
                        base: region.base,
                        end: region.end,
                        cutoff,
                    });
                }
            }
        }
        for (i, first) in regions.iter().enumerate() {
            if let Some(second) = regions[i + 1..].iter().find(|other| first.overlaps(other)) {
                return Err(RegionError::Overlap { first: first.base, second: second.base });
            }
        }
        Ok(Self { regions })
    }

    /// Registry over [`BUILTIN_REGIONS`].
    pub fn builtin() -> Self {
        Self { regions: BUILTIN_REGIONS.to_vec() }
    }

    pub fn regions(&self) -> &[ProtectedRegion] {
        &self.regions
    }

    /// Finds the region containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<RegionMatch> {
        self.regions.iter().find(|region| region.contains(addr)).map(|region| RegionMatch {
            device: region.device,
            bypass: region.bypass_cutoff.is_some_and(|cutoff| addr < cutoff),
            region: *region,
        })
    }

    /// Distinct device ids, ascending.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.regions.iter().map(|r| r.device).collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    /// Moves every page of every region into `state`.
    ///
    /// All pages are checked first, so a missing translation aborts before any
    /// page changes.
    pub fn apply_state<C: PermissionController>(
        &self,
        ctrl: &mut C,
        state: PageState,
    ) -> Result<usize, TranslationError> {
        for page in self.regions.iter().flat_map(ProtectedRegion::pages) {
            ctrl.state(page)?;
        }
        let mut changed = 0;
        for page in self.regions.iter().flat_map(ProtectedRegion::pages) {
            ctrl.set_state(page, state)?;
            changed += 1;
        }
        Ok(changed)
    }
}
