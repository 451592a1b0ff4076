// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the decoder, policy engine and dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: DeviceId, AccessRequest, SHADOW_LEN
//! INVARIANTS: Register offsets are one byte wide; a shadow has exactly 256 entries

use core::fmt;

/// Number of byte registers mirrored per device.
pub const SHADOW_LEN: usize = 256;

static_assertions::const_assert_eq!(SHADOW_LEN, u8::MAX as usize + 1);

/// Identifier of a guarded device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Camera subsystem.
    pub const CAMERA: Self = Self(0x4);
    /// PWM vibrator block.
    pub const VIBRATOR: Self = Self(0x5);
    /// Vibrator driver IC.
    pub const VIB_DRIVER: Self = Self(0x6);
    /// Vibrator clock controller.
    pub const VIB_CLOCK: Self = Self(0x7);

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CAMERA => f.write_str("camera"),
            Self::VIBRATOR => f.write_str("vibrator"),
            Self::VIB_DRIVER => f.write_str("vib-driver"),
            Self::VIB_CLOCK => f.write_str("vib-clock"),
            Self(raw) => write!(f, "dev{:#x}", raw),
        }
    }
}

/// Single byte-wide register write proposed to the policy engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AccessRequest {
    pub device: DeviceId,
    pub offset: u8,
    pub value: u8,
}

impl AccessRequest {
    #[inline]
    pub const fn new(device: DeviceId, offset: u8, value: u8) -> Self {
        Self { device, offset, value }
    }
}
