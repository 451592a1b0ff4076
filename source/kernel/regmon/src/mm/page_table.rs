// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page table backing the guarded register windows.
//!
//! Leaf entries keep their physical page number when they lose `VALID`, so a
//! guarded page can be toggled between present and not-present without being
//! remapped.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const LEVELS: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    #[error("address not page aligned")]
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    #[error("address outside the canonical Sv39 range")]
    OutOfRange,
    /// Mapping violates the W^X policy.
    #[error("writable and executable mapping rejected")]
    PermissionDenied,
    /// Mapping collides with an existing entry.
    #[error("mapping overlaps an existing entry")]
    Overlap,
    /// Flags do not describe a valid leaf entry.
    #[error("flags do not describe a leaf entry")]
    InvalidFlags,
}

/// Why a walk did not end on a 4 KiB leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkError {
    /// No entry exists at the given level (0 = root).
    Missing { level: usize },
    /// A superpage leaf covers the address; it cannot be re-permissioned per page.
    Superpage { level: usize },
}

const PPN_SHIFT: usize = 10;

#[repr(align(4096))]
struct TablePage([usize; PT_ENTRIES]);

/// Software Sv39 table for the guarded windows; intermediate levels appear on first map.
pub struct PageTable {
    root: NonNull<TablePage>,
    pages: Vec<NonNull<TablePage>>,
}

// SAFETY: the table exclusively owns every page reachable from `root`.
unsafe impl Send for PageTable {}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    pub fn new() -> Self {
        let root = Self::fresh_page();
        Self { root, pages: vec![root] }
    }

    /// Leaf entry for `va` if it is currently present.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        self.entry(va).ok().filter(|raw| raw & PageFlags::VALID.bits() != 0)
    }

    /// Raw leaf entry for the page containing `va`, present or parked.
    pub fn entry(&self, va: usize) -> Result<usize, WalkError> {
        let slot = self.leaf_slot(va)?;
        // SAFETY: `leaf_slot` only yields slots inside pages owned by this table.
        Ok(unsafe { *slot })
    }

    /// Mutable leaf entry for the page containing `va`.
    pub fn entry_mut(&mut self, va: usize) -> Result<&mut usize, WalkError> {
        let slot = self.leaf_slot(va)?;
        // SAFETY: as in `entry`; `&mut self` makes the borrow exclusive.
        Ok(unsafe { &mut *slot })
    }

    /// Maps the 4 KiB page at `va` onto `pa`.
    pub fn map(&mut self, va: usize, pa: usize, flags: PageFlags) -> Result<(), MapError> {
        if (va | pa) % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PageFlags::VALID) || !flags.intersects(LEAF_PERMS) {
            return Err(MapError::InvalidFlags);
        }
        if flags.contains(PageFlags::WRITE | PageFlags::EXECUTE) {
            return Err(MapError::PermissionDenied);
        }

        let [vpn2, vpn1, vpn0] = vpn_indices(va);
        let mut table = self.root;
        for index in [vpn2, vpn1] {
            table = self.descend_or_alloc(table, index)?;
        }
        // SAFETY: `table` is a leaf-level page owned by this table.
        let leaf = unsafe { &mut (*table.as_ptr()).0[vpn0] };
        // Parked (not-present) leaves keep their slot.
        if *leaf != 0 {
            return Err(MapError::Overlap);
        }
        *leaf = pte(pa, flags);
        Ok(())
    }

    /// Installs a 2 MiB leaf at level 1 to exercise superpage walks.
    #[cfg(test)]
    pub(crate) fn map_megapage(&mut self, va: usize, pa: usize, flags: PageFlags) {
        let [vpn2, vpn1, _] = vpn_indices(va);
        let mid = self.descend_or_alloc(self.root, vpn2).expect("level-1 table");
        unsafe { (*mid.as_ptr()).0[vpn1] = pte(pa, flags) };
    }

    /// Follows the pointer in `table[index]`, allocating the next level if empty.
    fn descend_or_alloc(
        &mut self,
        table: NonNull<TablePage>,
        index: usize,
    ) -> Result<NonNull<TablePage>, MapError> {
        // SAFETY: `table` is owned by this table and `&mut self` is exclusive.
        let slot = unsafe { &mut (*table.as_ptr()).0[index] };
        if *slot & PageFlags::VALID.bits() == 0 {
            let next = Self::fresh_page();
            self.pages.push(next);
            *slot = pte(next.as_ptr() as usize, PageFlags::VALID);
            return Ok(next);
        }
        if *slot & LEAF_PERMS.bits() != 0 {
            return Err(MapError::Overlap);
        }
        child(*slot).ok_or(MapError::OutOfRange)
    }

    fn leaf_slot(&self, va: usize) -> Result<*mut usize, WalkError> {
        if !is_canonical_sv39(va) {
            return Err(WalkError::Missing { level: 0 });
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.into_iter().enumerate() {
            // SAFETY: `table` is the root or a page from `fresh_page`.
            let slot = unsafe { (*table.as_ptr()).0.as_mut_ptr().add(index) };
            let raw = unsafe { *slot };
            if level == LEVELS - 1 {
                return if raw == 0 { Err(WalkError::Missing { level }) } else { Ok(slot) };
            }
            if raw & PageFlags::VALID.bits() == 0 {
                return Err(WalkError::Missing { level });
            }
            if raw & LEAF_PERMS.bits() != 0 {
                return Err(WalkError::Superpage { level });
            }
            table = child(raw).ok_or(WalkError::Missing { level })?;
        }
        Err(WalkError::Missing { level: LEVELS - 1 })
    }

    fn fresh_page() -> NonNull<TablePage> {
        NonNull::from(Box::leak(Box::new(TablePage([0; PT_ENTRIES]))))
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            // SAFETY: each page came from `Box::leak` in `fresh_page` and is listed once.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

pub(crate) const LEAF_PERMS: PageFlags =
    PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

#[inline]
fn pte(pa: usize, flags: PageFlags) -> usize {
    ((pa / PAGE_SIZE) << PPN_SHIFT) | flags.bits()
}

fn child(raw: usize) -> Option<NonNull<TablePage>> {
    NonNull::new(((raw >> PPN_SHIFT) * PAGE_SIZE) as *mut TablePage)
}

/// `[vpn2, vpn1, vpn0]` for `va`.
fn vpn_indices(va: usize) -> [usize; LEVELS] {
    [2usize, 1, 0].map(|level| (va >> (12 + 9 * level)) & (PT_ENTRIES - 1))
}

/// Bits 63..39 must all equal bit 38.
pub(crate) fn is_canonical_sv39(va: usize) -> bool {
    let high = (va as isize) >> 38;
    high == 0 || high == -1
}
