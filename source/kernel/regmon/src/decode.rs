// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Store-instruction decoding for trapped register writes
//! OWNERS: @kernel-team
//! PUBLIC API: FaultContext, FaultStatus, StoreDecoder, A32Store, DecodedWrite, DecodeError
//! DEPENDS_ON: regmon_hal::InsnFetch
//! INVARIANTS: Offsets never wrap: a high byte at offset 0x100 is an error, not 0x00
//!
//! Only the fixed-width A32 single-register store is understood. Its `Rt` field
//! sits in bits [15:12], i.e. the high nibble of the second instruction byte.

use bitflags::bitflags;
use regmon_hal::InsnFetch;

use crate::types::{AccessRequest, DeviceId};

/// Width of one machine register.
pub type Word = u32;

/// Register file captured by the host fault path.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultContext {
    /// r0..r15 at the time of the fault.
    pub regs: [Word; 16],
    /// Address of the faulting instruction.
    pub pc: usize,
    /// Saved program status.
    pub psr: Word,
}

impl FaultContext {
    pub fn new(pc: usize) -> Self {
        Self { pc, ..Self::default() }
    }

    /// Builder used by host shims and tests.
    pub fn with_reg(mut self, index: usize, value: Word) -> Self {
        if let Some(slot) = self.regs.get_mut(index) {
            *slot = value;
        }
        self
    }
}

bitflags! {
    /// Data fault status word (ARMv7 short-descriptor DFSR subset).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultStatus: u32 {
        const FS_LOW = 0b1111;
        const DOMAIN = 0b1111 << 4;
        const FS_HIGH = 1 << 10;
        /// Set when the access was a write.
        const WNR = 1 << 11;
        const EXT = 1 << 12;
    }
}

impl FaultStatus {
    /// Page translation fault on a write.
    pub const WRITE_TRANSLATION: Self = Self::from_bits_truncate(0b0111 | (1 << 11));
    /// Page permission fault on a write.
    pub const WRITE_PERMISSION: Self = Self::from_bits_truncate(0b1111 | (1 << 11));

    #[inline]
    pub fn is_write(self) -> bool {
        self.contains(Self::WNR)
    }
}

/// Errors produced while decoding a trapped store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The instruction byte could not be read.
    #[error("instruction fetch failed at {pc:#x}")]
    InsnFetch { pc: usize },
    /// The high byte of a two-byte write would land past offset 0xff.
    #[error("offset {offset:#x} has no room for a second byte")]
    OffsetOverflow { offset: u8 },
}

/// Decoded store: the original word plus the one or two byte requests it implies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedWrite {
    pub source_reg: usize,
    /// Full register value; this, not the split bytes, is written through.
    pub word: Word,
    pub low: AccessRequest,
    pub high: Option<AccessRequest>,
}

impl DecodedWrite {
    /// Requests in commit order: low byte first.
    pub fn requests(&self) -> impl Iterator<Item = AccessRequest> {
        core::iter::once(self.low).chain(self.high)
    }
}

/// Instruction encoding understood by the dispatcher.
pub trait StoreDecoder {
    /// Bytes to advance the program counter by once the store is emulated.
    const INSN_WIDTH: usize;

    /// Index of the register whose value the store writes.
    fn source_register<F: InsnFetch>(&self, fetch: &F, pc: usize) -> Result<usize, DecodeError>;

    /// Register value only; used when policy checks are skipped.
    fn source_word<F: InsnFetch>(&self, fetch: &F, ctx: &FaultContext) -> Result<Word, DecodeError> {
        let reg = self.source_register(fetch, ctx.pc)?;
        Ok(ctx.regs[reg & 0xf])
    }

    /// Full decode into byte requests for `device`.
    fn decode<F: InsnFetch>(
        &self,
        fetch: &F,
        ctx: &FaultContext,
        fault_addr: usize,
        device: DeviceId,
    ) -> Result<DecodedWrite, DecodeError> {
        let source_reg = self.source_register(fetch, ctx.pc)? & 0xf;
        let word = ctx.regs[source_reg];
        let offset = (fault_addr & 0xff) as u8;
        let low = AccessRequest::new(device, offset, word as u8);
        let high = if word > 0xff {
            let next = offset.checked_add(1).ok_or(DecodeError::OffsetOverflow { offset })?;
            Some(AccessRequest::new(device, next, (word >> 8) as u8))
        } else {
            None
        };
        Ok(DecodedWrite { source_reg, word, low, high })
    }
}

/// A32 `STR Rt, [Rn, #imm]` family, little-endian text.
#[derive(Copy, Clone, Debug, Default)]
pub struct A32Store;

impl StoreDecoder for A32Store {
    const INSN_WIDTH: usize = 4;

    fn source_register<F: InsnFetch>(&self, fetch: &F, pc: usize) -> Result<usize, DecodeError> {
        let byte = pc
            .checked_add(1)
            .and_then(|addr| fetch.fetch_byte(addr))
            .ok_or(DecodeError::InsnFetch { pc })?;
        Ok(usize::from(byte >> 4))
    }
}
