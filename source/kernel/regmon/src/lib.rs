// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault-driven register access monitor for guarded device windows
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, proptest in mm/policy/decode, `tests/` integration
//! PUBLIC API: TrapDispatcher, MonitorConfig, AccessPolicyEngine, RegionRegistry, Sv39Controller
//! DEPENDS_ON: regmon-hal (Bus, Tlb, InsnFetch), spin, bitflags, log, thiserror
//! INVARIANTS: No device write happens without policy approval or an explicit bypass range
//!
//! Guarded register pages are kept write-protected. A store into one of them
//! faults; the dispatcher decodes the store, runs it past the policy engine and
//! replays the original word through a writable alias before resuming the
//! faulting context. Denied stores are skipped.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod config;
pub mod decode;
pub mod diag;
pub mod mm;
pub mod policy;
pub mod region;
pub mod trap;
pub mod types;

pub use config::{BypassPolicy, ConfigError, MonitorConfig};
#[cfg(feature = "std")]
pub use config::LoadError;
pub use decode::{A32Store, DecodeError, FaultContext, FaultStatus, StoreDecoder};
pub use diag::{TrapStats, TrapStatsSnapshot};
pub use mm::{PageState, PermissionController, Sv39Controller, TranslationError};
pub use policy::{AccessPolicyEngine, DeviceShadow, PolicyDenied, PolicyError, Validator};
pub use region::{ProtectedRegion, RegionRegistry};
pub use trap::{FaultOutcome, Resolution, TrapDispatcher, TrapError};
pub use types::{AccessRequest, DeviceId};
