// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-permission state machine used to arm and disarm register traps
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageState, PermissionController, Sv39Controller, TranslationError
//! DEPENDS_ON: page_table::PageTable, regmon_hal::Tlb
//! INVARIANTS: A leaf is always exactly Shared, Modified or Invalid after set_state;
//!             every successful change is followed by a global TLB flush;
//!             a failed change leaves the entry untouched

pub mod page_table;

use core::fmt;

use log::{debug, error};
use regmon_hal::Tlb;

pub use page_table::{MapError, PageFlags, PageTable, WalkError, PAGE_SIZE};

/// Logical permission state of a guarded page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PageState {
    /// Present and read-only: reads succeed, writes trap.
    Shared,
    /// Present and writable: nothing traps.
    Modified,
    /// Not present and write-protected: every access traps.
    Invalid,
}

impl PageState {
    pub const ALL: [PageState; 3] = [PageState::Shared, PageState::Modified, PageState::Invalid];

    /// Bits that must be set and bits that must be clear for this state.
    ///
    /// READ stays set in every state: a VALID entry without R/W/X is an
    /// intermediate-table pointer on Sv39.
    pub const fn bits(self) -> (PageFlags, PageFlags) {
        match self {
            PageState::Shared => (PageFlags::VALID.union(PageFlags::READ), PageFlags::WRITE),
            PageState::Modified => (
                PageFlags::VALID.union(PageFlags::READ).union(PageFlags::WRITE),
                PageFlags::empty(),
            ),
            PageState::Invalid => (PageFlags::READ, PageFlags::VALID.union(PageFlags::WRITE)),
        }
    }

    /// Classifies a raw leaf entry; `None` if its bits match no state.
    pub fn from_entry(entry: usize) -> Option<Self> {
        let flags = PageFlags::from_bits_truncate(entry);
        Self::ALL.into_iter().find(|state| {
            let (set, clear) = state.bits();
            flags.contains(set) && !flags.intersects(clear)
        })
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PageState::Shared => "shared",
            PageState::Modified => "modified",
            PageState::Invalid => "invalid",
        })
    }
}

/// Errors reported by permission controllers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    /// No page-table entry backs the address, or it cannot be mapped per page.
    #[error("no translation for {addr:#x}")]
    NoTranslation { addr: usize },
}

/// Capability to change the effective permissions of a single page.
pub trait PermissionController {
    /// Moves the page containing `addr` into `state` and flushes cached translations.
    fn set_state(&mut self, addr: usize, state: PageState) -> Result<(), TranslationError>;

    /// Reports the current state of the page containing `addr`.
    fn state(&self, addr: usize) -> Result<Option<PageState>, TranslationError>;
}

/// Permission controller over a software-walked Sv39 table.
pub struct Sv39Controller<T: Tlb> {
    table: PageTable,
    tlb: T,
}

impl<T: Tlb> Sv39Controller<T> {
    pub fn new(table: PageTable, tlb: T) -> Self {
        Self { table, tlb }
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }
}

impl<T: Tlb> PermissionController for Sv39Controller<T> {
    fn set_state(&mut self, addr: usize, state: PageState) -> Result<(), TranslationError> {
        let entry = match self.table.entry_mut(addr) {
            Ok(entry) => entry,
            Err(walk) => {
                error!(target: "regmon::mm", "set_state {:#x} -> {}: {:?}", addr, state, walk);
                return Err(TranslationError::NoTranslation { addr });
            }
        };
        let (set, clear) = state.bits();
        let before = *entry;
        *entry = (before | set.bits()) & !clear.bits();
        debug!(target: "regmon::mm", "page {:#x}: {:#x} -> {:#x} ({})", addr, before, *entry, state);
        self.tlb.flush_all();
        Ok(())
    }

    fn state(&self, addr: usize) -> Result<Option<PageState>, TranslationError> {
        self.table
            .entry(addr)
            .map(PageState::from_entry)
            .map_err(|_| TranslationError::NoTranslation { addr })
    }
}
