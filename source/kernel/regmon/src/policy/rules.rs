// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-device validators and the register bits they watch
//! OWNERS: @kernel-team
//! PUBLIC API: Validator, Interlock, ControlBit, default_chain, regs::*
//! INVARIANTS: Validators are pure functions of (master shadow, slave shadow, request)

use alloc::{boxed::Box, vec, vec::Vec};

use super::DeviceShadow;
use crate::types::{AccessRequest, DeviceId};

/// Control registers observed by the built-in rules (byte offsets within each shadow).
pub mod regs {
    /// Camera: capture control; bit 0 starts streaming.
    pub const CAMERA_CTRL: u8 = 0x04;
    pub const CAMERA_STREAM_ON: u8 = 1 << 0;

    /// Vibrator: output control; bit 0 drives the motor.
    pub const VIB_CTRL: u8 = 0x00;
    pub const VIB_ENABLE: u8 = 1 << 0;
    /// Vibrator: 16-bit duty cycle, low byte then high byte.
    pub const VIB_DUTY_LO: u8 = 0x10;
    pub const VIB_DUTY_HI: u8 = 0x11;

    /// Driver IC: control register; bit 0 powers the output stage.
    pub const DRIVER_CTRL: u8 = 0x00;
    pub const DRIVER_ENABLE: u8 = 1 << 0;

    /// Clock controller: branch clock control; bit 0 ungates the clock.
    pub const CLOCK_CBCR: u8 = 0x00;
    pub const CLOCK_ENABLE: u8 = 1 << 0;
}

/// Reason a validator refused a write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Veto {
    pub reason: &'static str,
}

/// One check in the policy chain.
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Devices whose shadows this validator reads, as (master, slave).
    fn pair(&self) -> (DeviceId, DeviceId);

    /// Inspects the current shadows and the proposed request.
    fn check(
        &self,
        master: &DeviceShadow,
        slave: &DeviceShadow,
        request: &AccessRequest,
    ) -> Result<(), Veto>;

    fn involves(&self, device: DeviceId) -> bool {
        let (master, slave) = self.pair();
        device == master || device == slave
    }
}

/// A single bit in a device register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlBit {
    pub device: DeviceId,
    pub offset: u8,
    pub mask: u8,
}

impl ControlBit {
    pub const fn new(device: DeviceId, offset: u8, mask: u8) -> Self {
        Self { device, offset, mask }
    }

    fn is_set(&self, shadow: &DeviceShadow) -> bool {
        shadow.get(self.offset) & self.mask != 0
    }

    /// `Some(new bit value)` if `request` writes this bit.
    fn written_by(&self, request: &AccessRequest) -> Option<bool> {
        (request.device == self.device && request.offset == self.offset)
            .then_some(request.value & self.mask != 0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Coupling {
    /// Master may only be set while slave is set.
    Requires,
    /// Master and slave may never be set together.
    Excludes,
}

/// Two control bits coupled by a fixed rule.
#[derive(Copy, Clone, Debug)]
pub struct Interlock {
    name: &'static str,
    master: ControlBit,
    slave: ControlBit,
    coupling: Coupling,
}

impl Interlock {
    /// `master` may only be set while `slave` is set; `slave` may not drop while `master` is set.
    pub const fn requires(name: &'static str, master: ControlBit, slave: ControlBit) -> Self {
        Self { name, master, slave, coupling: Coupling::Requires }
    }

    /// `master` and `slave` are mutually exclusive.
    pub const fn excludes(name: &'static str, master: ControlBit, slave: ControlBit) -> Self {
        Self { name, master, slave, coupling: Coupling::Excludes }
    }
}

impl Validator for Interlock {
    fn name(&self) -> &'static str {
        self.name
    }

    fn pair(&self) -> (DeviceId, DeviceId) {
        (self.master.device, self.slave.device)
    }

    fn check(
        &self,
        master: &DeviceShadow,
        slave: &DeviceShadow,
        request: &AccessRequest,
    ) -> Result<(), Veto> {
        let master_on = self.master.is_set(master);
        let slave_on = self.slave.is_set(slave);
        match self.coupling {
            Coupling::Requires => {
                if self.master.written_by(request) == Some(true) && !slave_on {
                    return Err(Veto { reason: "enable requires its dependency to be running" });
                }
                if self.slave.written_by(request) == Some(false) && master_on {
                    return Err(Veto { reason: "dependency cannot stop while its user is enabled" });
                }
            }
            Coupling::Excludes => {
                if self.master.written_by(request) == Some(true) && slave_on {
                    return Err(Veto { reason: "mutually exclusive device is active" });
                }
                if self.slave.written_by(request) == Some(true) && master_on {
                    return Err(Veto { reason: "mutually exclusive device is active" });
                }
            }
        }
        Ok(())
    }
}

/// Driver IC output requires the vibrator clock.
pub const IC_CLOCK: Interlock = Interlock::requires(
    "ic-clk",
    ControlBit::new(DeviceId::VIB_DRIVER, regs::DRIVER_CTRL, regs::DRIVER_ENABLE),
    ControlBit::new(DeviceId::VIB_CLOCK, regs::CLOCK_CBCR, regs::CLOCK_ENABLE),
);

/// Vibrator output requires a powered driver IC.
pub const VIBRATOR_IC: Interlock = Interlock::requires(
    "vib-ic",
    ControlBit::new(DeviceId::VIBRATOR, regs::VIB_CTRL, regs::VIB_ENABLE),
    ControlBit::new(DeviceId::VIB_DRIVER, regs::DRIVER_CTRL, regs::DRIVER_ENABLE),
);

/// The camera never streams while the vibrator is running, and vice versa.
pub const CAMERA_VIBRATOR: Interlock = Interlock::excludes(
    "cam-vib",
    ControlBit::new(DeviceId::CAMERA, regs::CAMERA_CTRL, regs::CAMERA_STREAM_ON),
    ControlBit::new(DeviceId::VIBRATOR, regs::VIB_CTRL, regs::VIB_ENABLE),
);

/// Built-in chain, in evaluation order.
pub fn default_chain() -> Vec<Box<dyn Validator>> {
    vec![Box::new(IC_CLOCK), Box::new(VIBRATOR_IC), Box::new(CAMERA_VIBRATOR)]
}
