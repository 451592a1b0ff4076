// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Concurrent faults against a shared dispatcher
//! OWNERS: @kernel-team
//! STATUS: Functional
//! TEST_COVERAGE: 4 integration tests
//!
//! TEST_SCENARIOS:
//!   - first_faults_race_to_initialise(): every shadow allocated exactly once
//!   - parallel_stores_all_resolve(): every approved store written back once
//!   - same_register_stores_serialize(): shadow byte equals the last device write
//!   - stalled_writeback_holds_back_later_store(): a slow device write cannot be overtaken

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{RecordingBus, StallingBus, Text};
use regmon::policy::rules::regs;
use regmon::{
    DeviceId, FaultContext, FaultOutcome, FaultStatus, MonitorConfig, Resolution, TrapDispatcher,
};

const PC: usize = 0xc000_2000;
const SCRATCH: [usize; 4] = [0xf901_6080, 0xf901_7080, 0xfa01_8380, 0xf901_b480];
const ALIAS: usize = 0x70_0000;
const VIB_CTRL: usize = 0xf901_6000 + regs::VIB_CTRL as usize;
const CAM_CTRL: usize = 0xf901_7000 + regs::CAMERA_CTRL as usize;
const DRIVER_CTRL: usize = 0xfa01_8300 + regs::DRIVER_CTRL as usize;
const CLOCK_CTRL: usize = 0xf901_b400 + regs::CLOCK_CBCR as usize;

fn shared() -> Arc<TrapDispatcher<RecordingBus, Text>> {
    Arc::new(TrapDispatcher::new(
        MonitorConfig::default(),
        RecordingBus::default(),
        Text::default().with_store(PC, 0),
    ))
}

#[test]
fn first_faults_race_to_initialise() {
    let d = shared();
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let d = Arc::clone(&d);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut ctx = FaultContext::new(PC).with_reg(0, 0x5a);
                d.handle_fault(SCRATCH[i % SCRATCH.len()], FaultStatus::WRITE_PERMISSION, &mut ctx)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), FaultOutcome::Resolved);
    }
    assert_eq!(d.engine().allocations(), 4);
    for device in [DeviceId::CAMERA, DeviceId::VIBRATOR, DeviceId::VIB_DRIVER, DeviceId::VIB_CLOCK] {
        assert_eq!(d.engine().snapshot(device).unwrap().get(0x80), 0x5a);
    }
}

#[test]
fn parallel_stores_all_resolve() {
    let d = shared();
    let handles: Vec<_> = SCRATCH
        .into_iter()
        .map(|addr| {
            let d = Arc::clone(&d);
            thread::spawn(move || {
                for value in 0..64u32 {
                    let mut ctx = FaultContext::new(PC).with_reg(0, value);
                    assert_eq!(
                        d.handle_fault(addr, FaultStatus::WRITE_PERMISSION, &mut ctx),
                        FaultOutcome::Resolved
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let writes = d.bus().writes();
    assert_eq!(writes.len(), 4 * 64);
    for addr in SCRATCH {
        let last = writes.iter().rev().find(|(a, _)| *a == addr + 0x70_0000).map(|(_, v)| *v);
        assert_eq!(last, Some(63));
    }
    assert_eq!(d.stats().snapshot().written_back, 256);
}

fn store<B: regmon_hal::Bus>(d: &TrapDispatcher<B, Text>, addr: usize, value: u32) -> FaultOutcome {
    let mut ctx = FaultContext::new(PC).with_reg(0, value);
    d.handle_fault(addr, FaultStatus::WRITE_PERMISSION, &mut ctx)
}

#[test]
fn same_register_stores_serialize() {
    let d = shared();
    let target = SCRATCH[0];
    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let d = Arc::clone(&d);
            thread::spawn(move || {
                for i in 0..64u32 {
                    assert_eq!(store(&*d, target, t * 64 + i), FaultOutcome::Resolved);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let last = d.bus().writes().iter().rev().find(|(a, _)| *a == target + ALIAS).map(|(_, v)| *v);
    let shadow = d.engine().snapshot(DeviceId::VIBRATOR).unwrap().get(0x80);
    assert_eq!(last, Some(u32::from(shadow)));
}

#[test]
fn stalled_writeback_holds_back_later_store() {
    let (bus, entered, release) = StallingBus::new(VIB_CTRL + ALIAS, 1);
    let d = Arc::new(TrapDispatcher::new(
        MonitorConfig::default(),
        bus,
        Text::default().with_store(PC, 0),
    ));
    assert_eq!(store(&*d, CLOCK_CTRL, 1), FaultOutcome::Resolved);
    assert_eq!(store(&*d, DRIVER_CTRL, 1), FaultOutcome::Resolved);

    let motor_on = {
        let d = Arc::clone(&d);
        thread::spawn(move || store(&*d, VIB_CTRL, 1))
    };
    entered.recv().unwrap();

    let motor_off = {
        let d = Arc::clone(&d);
        thread::spawn(move || store(&*d, VIB_CTRL, 0))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!motor_off.is_finished(), "second store overtook a parked device write");

    release.send(()).unwrap();
    assert_eq!(motor_on.join().unwrap(), FaultOutcome::Resolved);
    assert_eq!(motor_off.join().unwrap(), FaultOutcome::Resolved);

    let device: Vec<u32> = d
        .bus()
        .writes()
        .iter()
        .filter(|(a, _)| *a == VIB_CTRL + ALIAS)
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(device, vec![1, 0]);
    let shadow = d.engine().snapshot(DeviceId::VIBRATOR).unwrap().get(regs::VIB_CTRL);
    assert_eq!(u32::from(shadow), *device.last().unwrap());

    // Motor is off on the device and in the shadow, so the camera may stream.
    let mut ctx = FaultContext::new(PC).with_reg(0, 1);
    assert_eq!(
        d.dispatch(CAM_CTRL, FaultStatus::WRITE_PERMISSION, &mut ctx),
        Ok(Resolution::WrittenBack { target: CAM_CTRL + ALIAS, word: 1, bypassed: false })
    );
}
