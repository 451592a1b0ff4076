// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the policy engine
//! OWNERS: @kernel-team
//! NOTE: Tests only; no engine logic. Ensures denials are atomic and interlocks hold.
//!
//! TEST_SCOPE:
//!   - Denied requests leave every shadow unchanged
//!   - Approved requests change exactly one byte of one shadow
//!   - Interlock invariants hold after any request sequence
//!
//! TEST_SCENARIOS:
//!   - denial_is_atomic(): snapshots before and after a veto are identical
//!   - approval_touches_one_byte(): only the requested byte differs after commit
//!   - interlocks_hold_for_any_sequence(): driver => clock, vibrator => driver, !(camera && vibrator)

use super::rules::regs;
use super::{AccessPolicyEngine, DeviceShadow, PolicyError};
use crate::types::{AccessRequest, DeviceId};
use proptest::prelude::*;

const DEVICES: [DeviceId; 4] =
    [DeviceId::CAMERA, DeviceId::VIBRATOR, DeviceId::VIB_DRIVER, DeviceId::VIB_CLOCK];

fn arb_device() -> impl Strategy<Value = DeviceId> {
    (0usize..DEVICES.len()).prop_map(|i| DEVICES[i])
}

/// Requests biased toward the control registers the rules watch.
fn arb_request() -> impl Strategy<Value = AccessRequest> {
    prop_oneof![
        3 => (arb_device(), 0u8..2).prop_map(|(device, value)| {
            let offset = match device {
                DeviceId::CAMERA => regs::CAMERA_CTRL,
                DeviceId::VIBRATOR => regs::VIB_CTRL,
                DeviceId::VIB_DRIVER => regs::DRIVER_CTRL,
                _ => regs::CLOCK_CBCR,
            };
            AccessRequest::new(device, offset, value)
        }),
        1 => (arb_device(), any::<u8>(), any::<u8>())
            .prop_map(|(device, offset, value)| AccessRequest::new(device, offset, value)),
    ]
}

fn snapshots(engine: &AccessPolicyEngine) -> Vec<DeviceShadow> {
    DEVICES.iter().map(|d| engine.snapshot(*d).expect("tracked device")).collect()
}

fn bit(engine: &AccessPolicyEngine, device: DeviceId, offset: u8, mask: u8) -> bool {
    engine.snapshot(device).expect("tracked device").get(offset) & mask != 0
}

proptest! {
    #[test]
    fn denial_is_atomic(history in prop::collection::vec(arb_request(), 0..32), candidate in arb_request()) {
        let engine = AccessPolicyEngine::with_default_rules(&DEVICES);
        for request in history {
            let _ = engine.check_and_commit(request);
        }
        let before = snapshots(&engine);
        if let Err(err) = engine.check_and_commit(candidate) {
            prop_assert!(matches!(err, PolicyError::Denied(_)));
            prop_assert_eq!(snapshots(&engine), before);
        }
    }

    #[test]
    fn approval_touches_one_byte(history in prop::collection::vec(arb_request(), 0..32), candidate in arb_request()) {
        let engine = AccessPolicyEngine::with_default_rules(&DEVICES);
        for request in history {
            let _ = engine.check_and_commit(request);
        }
        let before = snapshots(&engine);
        if engine.check_and_commit(candidate).is_ok() {
            let after = snapshots(&engine);
            for (i, device) in DEVICES.iter().enumerate() {
                for offset in 0..=u8::MAX {
                    let expected = if *device == candidate.device && offset == candidate.offset {
                        candidate.value
                    } else {
                        before[i].get(offset)
                    };
                    prop_assert_eq!(after[i].get(offset), expected);
                }
            }
        }
    }

    #[test]
    fn interlocks_hold_for_any_sequence(sequence in prop::collection::vec(arb_request(), 1..64)) {
        let engine = AccessPolicyEngine::with_default_rules(&DEVICES);
        for request in sequence {
            let _ = engine.check_and_commit(request);
            let clock = bit(&engine, DeviceId::VIB_CLOCK, regs::CLOCK_CBCR, regs::CLOCK_ENABLE);
            let driver = bit(&engine, DeviceId::VIB_DRIVER, regs::DRIVER_CTRL, regs::DRIVER_ENABLE);
            let vibrator = bit(&engine, DeviceId::VIBRATOR, regs::VIB_CTRL, regs::VIB_ENABLE);
            let camera = bit(&engine, DeviceId::CAMERA, regs::CAMERA_CTRL, regs::CAMERA_STREAM_ON);
            prop_assert!(!driver || clock);
            prop_assert!(!vibrator || driver);
            prop_assert!(!(camera && vibrator));
        }
    }
}
