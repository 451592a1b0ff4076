// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recording HAL mocks shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use regmon_hal::{Bus, InsnFetch, Tlb};

#[derive(Default)]
pub struct RecordingBus {
    writes: Mutex<Vec<(usize, u32)>>,
}

impl RecordingBus {
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().unwrap().clone()
    }
}

impl Bus for RecordingBus {
    fn read(&self, addr: usize) -> u32 {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    fn write(&self, addr: usize, value: u32) {
        self.writes.lock().unwrap().push((addr, value));
    }
}

/// Recording bus that parks the first write of `value` to `addr` until released.
pub struct StallingBus {
    inner: RecordingBus,
    stall_at: (usize, u32),
    armed: AtomicBool,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl StallingBus {
    /// Returns the bus, a receiver signalled once the write is parked, and
    /// the sender that lets it complete.
    pub fn new(addr: usize, value: u32) -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let bus = Self {
            inner: RecordingBus::default(),
            stall_at: (addr, value),
            armed: AtomicBool::new(true),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        (bus, entered_rx, release_tx)
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.inner.writes()
    }
}

impl Bus for StallingBus {
    fn read(&self, addr: usize) -> u32 {
        self.inner.read(addr)
    }

    fn write(&self, addr: usize, value: u32) {
        if (addr, value) == self.stall_at && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.inner.write(addr, value);
    }
}

/// Sparse instruction memory.
#[derive(Default)]
pub struct Text {
    bytes: BTreeMap<usize, u8>,
}

impl Text {
    /// Places `str r<rt>, [r3]` (little-endian A32) at `pc`.
    pub fn with_store(mut self, pc: usize, rt: u8) -> Self {
        for (i, byte) in [0x00, (rt << 4) | 0x3, 0x83, 0xe5].into_iter().enumerate() {
            self.bytes.insert(pc + i, byte);
        }
        self
    }
}

impl InsnFetch for Text {
    fn fetch_byte(&self, addr: usize) -> Option<u8> {
        self.bytes.get(&addr).copied()
    }
}

#[derive(Default)]
pub struct CountingTlb(AtomicUsize);

impl CountingTlb {
    pub fn flushes(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Tlb for CountingTlb {
    fn flush_all(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}
