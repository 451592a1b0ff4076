// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault dispatcher: region match, decode, policy check, writeback, resume
//! OWNERS: @kernel-team
//! PUBLIC API: TrapDispatcher, FaultOutcome, Resolution, ApprovedWrite, TrapError, TrapState
//! DEPENDS_ON: region, decode, policy, config, diag; regmon_hal::{Bus, InsnFetch}
//! INVARIANTS: Only an ApprovedWrite reaches the device bus;
//!             a suppressed write advances the PC but never touches the device;
//!             a fault that is not ours leaves the context untouched
//!
//! The dispatcher is a small state machine:
//!
//! ```text
//! Idle -> Unmatched
//! Idle -> RegionMatched -> Bypassed      -> WrittenBack -> Resumed
//!                       -> PolicyChecked -> WrittenBack -> Resumed
//!                       -> Resumed                      (suppressed)
//!         RegionMatched -> Bypassed      -> Resumed     (bypass denied)
//! ```

use log::{debug, error, info, trace, warn};
use regmon_hal::{Bus, InsnFetch};

use crate::config::{BypassPolicy, MonitorConfig};
use crate::decode::{A32Store, DecodeError, FaultContext, FaultStatus, StoreDecoder, Word};
use crate::diag::TrapStats;
use crate::mm::{PageState, PermissionController, TranslationError};
use crate::policy::{AccessPolicyEngine, PolicyError};
use crate::region::RegionRegistry;

/// Host error number returned when a fault is not handled here.
pub const ENOMEM: i32 = 12;

/// What the host fault path should do next.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The store was emulated or suppressed; resume at the updated PC.
    Resolved,
    /// Let the host handle the fault.
    NotOurs,
}

impl FaultOutcome {
    /// Host return convention: `0` or `-ENOMEM`.
    pub const fn host_code(self) -> i32 {
        match self {
            FaultOutcome::Resolved => 0,
            FaultOutcome::NotOurs => -ENOMEM,
        }
    }
}

/// Dispatcher states; transitions are traced under `regmon::trap`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapState {
    Idle,
    RegionMatched,
    Unmatched,
    Bypassed,
    PolicyChecked,
    WrittenBack,
    Resumed,
}

impl TrapState {
    pub const fn can_transition(self, next: TrapState) -> bool {
        matches!(
            (self, next),
            (TrapState::Idle, TrapState::RegionMatched)
                | (TrapState::Idle, TrapState::Unmatched)
                | (TrapState::RegionMatched, TrapState::Bypassed)
                | (TrapState::RegionMatched, TrapState::PolicyChecked)
                | (TrapState::RegionMatched, TrapState::Resumed)
                | (TrapState::Bypassed, TrapState::WrittenBack)
                | (TrapState::Bypassed, TrapState::Resumed)
                | (TrapState::PolicyChecked, TrapState::WrittenBack)
                | (TrapState::WrittenBack, TrapState::Resumed)
        )
    }
}

/// Reasons a fault was not emulated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TrapError {
    #[error("no guarded region contains {addr:#x}")]
    NoMapping { addr: usize },
    #[error("read access at {addr:#x} is not emulated")]
    ReadAccess { addr: usize },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("write to bypass range at {addr:#x} refused")]
    BypassDenied { addr: usize },
}

/// How a fault that belonged to the monitor was settled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The original word was forwarded to `target`.
    WrittenBack { target: usize, word: Word, bypassed: bool },
    /// The store was skipped without reaching the device.
    Suppressed(TrapError),
}

/// Permission to forward one word to the device; only the dispatcher mints these.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct ApprovedWrite {
    addr: usize,
    word: Word,
    bypassed: bool,
}

impl ApprovedWrite {
    fn checked(addr: usize, word: Word) -> Self {
        Self { addr, word, bypassed: false }
    }

    fn bypassed(addr: usize, word: Word) -> Self {
        Self { addr, word, bypassed: true }
    }

    /// Faulting (guarded) address.
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn word(&self) -> Word {
        self.word
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }
}

/// Emulates trapped stores to guarded register windows.
pub struct TrapDispatcher<B, F, D = A32Store> {
    regions: RegionRegistry,
    engine: AccessPolicyEngine,
    bus: B,
    fetch: F,
    decoder: D,
    writeback_offset: usize,
    bypass: BypassPolicy,
    stats: TrapStats,
}

static_assertions::assert_impl_all!(
    TrapDispatcher<regmon_hal::MmioBus, regmon_hal::KernelText>: Send, Sync
);

impl<B: Bus, F: InsnFetch> TrapDispatcher<B, F, A32Store> {
    /// Dispatcher with the built-in validator chain over the configured devices.
    pub fn new(config: MonitorConfig, bus: B, fetch: F) -> Self {
        let engine = AccessPolicyEngine::with_default_rules(&config.regions().devices());
        Self::with_parts(config, engine, bus, fetch, A32Store)
    }
}

impl<B: Bus, F: InsnFetch, D: StoreDecoder> TrapDispatcher<B, F, D> {
    pub fn with_parts(config: MonitorConfig, engine: AccessPolicyEngine, bus: B, fetch: F, decoder: D) -> Self {
        let (regions, writeback_offset, bypass) = config.into_parts();
        Self { regions, engine, bus, fetch, decoder, writeback_offset, bypass, stats: TrapStats::new() }
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    pub fn engine(&self) -> &AccessPolicyEngine {
        &self.engine
    }

    pub fn stats(&self) -> &TrapStats {
        &self.stats
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bypass_policy(&self) -> BypassPolicy {
        self.bypass
    }

    pub fn writeback_offset(&self) -> usize {
        self.writeback_offset
    }

    /// Write-protects every guarded page so stores start trapping.
    pub fn arm<C: PermissionController>(&self, ctrl: &mut C) -> Result<usize, TranslationError> {
        let pages = self.regions.apply_state(ctrl, PageState::Shared)?;
        info!(target: "regmon::trap", "armed {} page(s)", pages);
        Ok(pages)
    }

    /// Makes every guarded page writable again.
    pub fn disarm<C: PermissionController>(&self, ctrl: &mut C) -> Result<usize, TranslationError> {
        let pages = self.regions.apply_state(ctrl, PageState::Modified)?;
        info!(target: "regmon::trap", "disarmed {} page(s)", pages);
        Ok(pages)
    }

    /// Entry point for the host data-abort path.
    pub fn handle_fault(&self, addr: usize, status: FaultStatus, ctx: &mut FaultContext) -> FaultOutcome {
        match self.dispatch(addr, status, ctx) {
            Ok(_) => FaultOutcome::Resolved,
            Err(err) => {
                debug!(target: "regmon::trap", "{:#x}: not handled: {}", addr, err);
                FaultOutcome::NotOurs
            }
        }
    }

    /// Runs one fault through the state machine.
    ///
    /// `Err` means the fault is not ours and `ctx` is untouched. `Ok` means the
    /// PC has been advanced past the store, whether or not the device saw it.
    pub fn dispatch(
        &self,
        addr: usize,
        status: FaultStatus,
        ctx: &mut FaultContext,
    ) -> Result<Resolution, TrapError> {
        if !status.is_write() {
            self.stats.bump_unsupported();
            return Err(TrapError::ReadAccess { addr });
        }

        let mut state = TrapState::Idle;
        let Some(hit) = self.regions.lookup(addr) else {
            advance(&mut state, TrapState::Unmatched, addr);
            self.stats.bump_unmatched();
            return Err(TrapError::NoMapping { addr });
        };
        advance(&mut state, TrapState::RegionMatched, addr);

        let resolution = if hit.bypass {
            advance(&mut state, TrapState::Bypassed, addr);
            let word = self.decoder.source_word(&self.fetch, ctx).map_err(|err| self.unsupported(err))?;
            self.stats.bump_bypassed();
            warn!(
                target: "regmon::trap",
                "{:#x}: {} write {:#x} in bypass range, not policy checked",
                addr,
                hit.device,
                word
            );
            if self.bypass == BypassPolicy::Deny {
                self.stats.bump_denied();
                return Ok(self.suppress(ctx, &mut state, addr, TrapError::BypassDenied { addr }));
            }
            self.write_back(ApprovedWrite::bypassed(addr, word), &mut state)
        } else {
            let write = match self.decoder.decode(&self.fetch, ctx, addr, hit.device) {
                Ok(write) => write,
                Err(err @ DecodeError::OffsetOverflow { .. }) => {
                    self.stats.bump_overflowed();
                    error!(target: "regmon::trap", "{:#x}: {}", addr, err);
                    return Ok(self.suppress(ctx, &mut state, addr, err.into()));
                }
                Err(err) => return Err(self.unsupported(err)),
            };
            // Shadow locks stay held across the device write.
            let committed = self.engine.commit_write_then(&write, || {
                advance(&mut state, TrapState::PolicyChecked, addr);
                self.write_back(ApprovedWrite::checked(addr, write.word), &mut state)
            });
            match committed {
                Ok(resolution) => resolution,
                Err(err @ PolicyError::Denied(_)) => {
                    self.stats.bump_denied();
                    return Ok(self.suppress(ctx, &mut state, addr, err.into()));
                }
                Err(err @ PolicyError::UnknownDevice(_)) => {
                    self.stats.bump_misconfigured();
                    error!(target: "regmon::trap", "{:#x}: region and policy engine disagree: {}", addr, err);
                    return Ok(self.suppress(ctx, &mut state, addr, err.into()));
                }
            }
        };

        self.resume(ctx, &mut state, addr);
        Ok(resolution)
    }

    fn write_back(&self, approved: ApprovedWrite, state: &mut TrapState) -> Resolution {
        // MonitorConfig guarantees every region end plus the offset fits.
        let target = approved.addr + self.writeback_offset;
        self.bus.write(target, approved.word);
        self.stats.bump_written_back();
        advance(state, TrapState::WrittenBack, approved.addr);
        Resolution::WrittenBack { target, word: approved.word, bypassed: approved.bypassed }
    }

    fn suppress(
        &self,
        ctx: &mut FaultContext,
        state: &mut TrapState,
        addr: usize,
        reason: TrapError,
    ) -> Resolution {
        debug!(target: "regmon::trap", "{:#x}: store at pc {:#x} suppressed: {}", addr, ctx.pc, reason);
        self.resume(ctx, state, addr);
        Resolution::Suppressed(reason)
    }

    fn resume(&self, ctx: &mut FaultContext, state: &mut TrapState, addr: usize) {
        ctx.pc = ctx.pc.wrapping_add(D::INSN_WIDTH);
        advance(state, TrapState::Resumed, addr);
        self.stats.bump_resolved();
    }

    fn unsupported(&self, err: DecodeError) -> TrapError {
        self.stats.bump_unsupported();
        err.into()
    }
}

fn advance(state: &mut TrapState, next: TrapState, addr: usize) {
    debug_assert!(state.can_transition(next), "{:?} -> {:?}", state, next);
    trace!(target: "regmon::trap", "{:#x}: {:?} -> {:?}", addr, state, next);
    *state = next;
}
