// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Access policy engine: per-device shadow registers + ordered validator chain
//! OWNERS: @kernel-team
//! PUBLIC API: AccessPolicyEngine, DeviceShadow, PolicyError, PolicyDenied, Validator
//! DEPENDS_ON: spin::{Once, Mutex}, rules::default_chain
//! INVARIANTS: Each shadow is allocated at most once and starts zeroed;
//!             a denied request leaves every shadow unchanged;
//!             shadow locks are always taken in ascending device-id order

pub mod rules;

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, trace};
use spin::{Mutex, MutexGuard, Once};

use crate::decode::DecodedWrite;
use crate::types::{AccessRequest, DeviceId, SHADOW_LEN};

pub use rules::{default_chain, ControlBit, Interlock, Validator, Veto};

/// Byte-indexed mirror of a device's register file.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceShadow {
    bytes: [u8; SHADOW_LEN],
}

impl DeviceShadow {
    pub const fn new() -> Self {
        Self { bytes: [0; SHADOW_LEN] }
    }

    #[inline]
    pub fn get(&self, offset: u8) -> u8 {
        self.bytes[usize::from(offset)]
    }

    #[inline]
    pub fn set(&mut self, offset: u8, value: u8) {
        self.bytes[usize::from(offset)] = value;
    }

    pub fn as_bytes(&self) -> &[u8; SHADOW_LEN] {
        &self.bytes
    }
}

impl Default for DeviceShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DeviceShadow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let live = self.bytes.iter().filter(|b| **b != 0).count();
        f.debug_struct("DeviceShadow").field("nonzero", &live).finish()
    }
}

/// Which validator refused a request, and why.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("not allowed by policy module {module} ({validator}): {reason}")]
pub struct PolicyDenied {
    /// 1-based position in the chain.
    pub module: usize,
    pub validator: &'static str,
    pub reason: &'static str,
    pub request: AccessRequest,
}

/// Errors returned by the policy engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Denied(#[from] PolicyDenied),
    #[error("device {0} is not tracked by the policy engine")]
    UnknownDevice(DeviceId),
}

struct ShadowSlot {
    device: DeviceId,
    cell: Once<Mutex<Box<DeviceShadow>>>,
}

/// Shadows locked for one request, ascending by device id.
struct LockedShadows<'a> {
    guards: Vec<(DeviceId, MutexGuard<'a, Box<DeviceShadow>>)>,
}

impl LockedShadows<'_> {
    fn get(&self, device: DeviceId) -> Option<&DeviceShadow> {
        self.guards.iter().find(|(id, _)| *id == device).map(|(_, guard)| &***guard)
    }

    fn get_mut(&mut self, device: DeviceId) -> Option<&mut DeviceShadow> {
        self.guards.iter_mut().find(|(id, _)| *id == device).map(|(_, guard)| &mut ***guard)
    }
}

/// Stateful reference monitor for byte-wide register writes.
pub struct AccessPolicyEngine {
    slots: Vec<ShadowSlot>,
    validators: Vec<Box<dyn Validator>>,
    allocations: AtomicUsize,
}

static_assertions::assert_impl_all!(AccessPolicyEngine: Send, Sync);

impl AccessPolicyEngine {
    /// Tracks `devices` plus every device named by `validators`.
    pub fn new(devices: &[DeviceId], validators: Vec<Box<dyn Validator>>) -> Self {
        let mut ids: Vec<DeviceId> = devices.to_vec();
        for validator in &validators {
            let (master, slave) = validator.pair();
            ids.push(master);
            ids.push(slave);
        }
        ids.sort_unstable();
        ids.dedup();
        let slots = ids.into_iter().map(|device| ShadowSlot { device, cell: Once::new() }).collect();
        Self { slots, validators, allocations: AtomicUsize::new(0) }
    }

    /// Engine over `devices` with the built-in validator chain.
    pub fn with_default_rules(devices: &[DeviceId]) -> Self {
        Self::new(devices, default_chain())
    }

    /// Device ids tracked by this engine, ascending.
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.slots.iter().map(|slot| slot.device)
    }

    pub fn validators(&self) -> impl Iterator<Item = &dyn Validator> + '_ {
        self.validators.iter().map(|v| v.as_ref())
    }

    /// Number of shadows allocated so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self, device: DeviceId) -> bool {
        self.slot(device).is_some_and(|slot| slot.cell.is_completed())
    }

    /// Allocates the shadow for `device` if this is its first use.
    pub fn ensure_shadow(&self, device: DeviceId) -> Result<(), PolicyError> {
        self.shadow(device).map(|_| ())
    }

    /// Copy of the current shadow for `device`.
    pub fn snapshot(&self, device: DeviceId) -> Result<DeviceShadow, PolicyError> {
        Ok((**self.shadow(device)?.lock()).clone())
    }

    /// Runs the chain for one request and commits it on approval.
    pub fn check_and_commit(&self, request: AccessRequest) -> Result<(), PolicyError> {
        let mut locked = self.lock_for(request.device)?;
        self.run_chain(&locked, &request)?;
        Self::commit(&mut locked, &request);
        Ok(())
    }

    /// Checks and commits every request of a decoded store as one unit.
    ///
    /// The low byte is checked and staged first; if the high byte is then
    /// refused the staged low byte is restored before returning.
    pub fn commit_write(&self, write: &DecodedWrite) -> Result<(), PolicyError> {
        self.commit_write_then(write, || ())
    }

    /// Like [`commit_write`](Self::commit_write), then runs `apply` before the
    /// shadow locks are released.
    ///
    /// The device write goes in `apply`, so stores to one device reach the
    /// hardware in the same order their shadow commits happened.
    pub fn commit_write_then<R>(
        &self,
        write: &DecodedWrite,
        apply: impl FnOnce() -> R,
    ) -> Result<R, PolicyError> {
        let device = write.low.device;
        let mut locked = self.lock_for(device)?;

        self.run_chain(&locked, &write.low)?;
        let previous = Self::commit(&mut locked, &write.low);

        if let Some(high) = write.high {
            if let Err(err) = self.run_chain(&locked, &high) {
                if let Some(shadow) = locked.get_mut(device) {
                    shadow.set(write.low.offset, previous);
                }
                return Err(err);
            }
            Self::commit(&mut locked, &high);
        }
        let applied = apply();
        drop(locked);
        Ok(applied)
    }

    fn run_chain(&self, locked: &LockedShadows<'_>, request: &AccessRequest) -> Result<(), PolicyError> {
        for (index, validator) in self.validators.iter().enumerate() {
            if !validator.involves(request.device) {
                continue;
            }
            let (master, slave) = validator.pair();
            let (Some(master), Some(slave)) = (locked.get(master), locked.get(slave)) else {
                return Err(PolicyError::UnknownDevice(request.device));
            };
            if let Err(veto) = validator.check(master, slave, request) {
                let denied = PolicyDenied {
                    module: index + 1,
                    validator: validator.name(),
                    reason: veto.reason,
                    request: *request,
                };
                error!(target: "regmon::policy", "{}", denied);
                return Err(denied.into());
            }
        }
        trace!(
            target: "regmon::policy",
            "allow {} [{:#04x}] = {:#04x}",
            request.device,
            request.offset,
            request.value
        );
        Ok(())
    }

    /// Writes `request` into its shadow and returns the byte it replaced.
    fn commit(locked: &mut LockedShadows<'_>, request: &AccessRequest) -> u8 {
        match locked.get_mut(request.device) {
            Some(shadow) => {
                let previous = shadow.get(request.offset);
                shadow.set(request.offset, request.value);
                previous
            }
            None => 0,
        }
    }

    /// Locks `device` and every device it is paired with, in ascending id order.
    fn lock_for(&self, device: DeviceId) -> Result<LockedShadows<'_>, PolicyError> {
        if self.slot(device).is_none() {
            return Err(PolicyError::UnknownDevice(device));
        }
        let needed = |id: DeviceId| {
            id == device
                || self.validators.iter().any(|v| {
                    let (master, slave) = v.pair();
                    v.involves(device) && (id == master || id == slave)
                })
        };
        let mut guards = Vec::new();
        for slot in self.slots.iter().filter(|slot| needed(slot.device)) {
            guards.push((slot.device, self.init(slot).lock()));
        }
        Ok(LockedShadows { guards })
    }

    fn slot(&self, device: DeviceId) -> Option<&ShadowSlot> {
        self.slots
            .binary_search_by_key(&device, |slot| slot.device)
            .ok()
            .map(|index| &self.slots[index])
    }

    fn shadow(&self, device: DeviceId) -> Result<&Mutex<Box<DeviceShadow>>, PolicyError> {
        self.slot(device).map(|slot| self.init(slot)).ok_or(PolicyError::UnknownDevice(device))
    }

    fn init<'a>(&'a self, slot: &'a ShadowSlot) -> &'a Mutex<Box<DeviceShadow>> {
        slot.cell.call_once(|| {
            self.allocations.fetch_add(1, Ordering::AcqRel);
            debug!(target: "regmon::policy", "allocating shadow for {}", slot.device);
            Mutex::new(Box::new(DeviceShadow::new()))
        })
    }
}

#[cfg(test)]
mod tests_prop;
