// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Side-effect interface to the hardware abstraction: powerwash scheduling,
//! the warm-reset flag, and the verified-boot digest for the inactive slot.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};

pub trait Hardware: Send + Sync {
    /// Schedule a factory reset that clears user data on the next boot.
    /// Returns whether the intent was recorded.
    fn schedule_powerwash(&self) -> bool;

    /// Cancel a previously scheduled powerwash.
    fn cancel_powerwash(&self) -> bool;

    /// Hint the bootloader to perform a warm reset on the upcoming reboot.
    fn set_warm_reset(&self, enabled: bool);

    /// Update the verified-boot digest for the slot we're about to boot into.
    /// `reset` clears the stored digest instead of computing a new one.
    fn set_vbmeta_digest_for_inactive_slot(&self, reset: bool);

    /// Extra mount options for a partition's postinstall mount.
    fn partition_mount_options(&self, partition_name: &str) -> String;
}

/// Recording fake for tests.
#[derive(Default)]
pub struct FakeHardware {
    powerwash_scheduled: AtomicBool,
    powerwash_cancel_calls: AtomicU32,
    fail_powerwash: AtomicBool,
    warm_reset: Mutex<Option<bool>>,
    vbmeta_digest_reset: Mutex<Option<bool>>,
}

impl FakeHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_powerwash(&self, fail: bool) {
        self.fail_powerwash.store(fail, Ordering::SeqCst);
    }

    pub fn is_powerwash_scheduled(&self) -> bool {
        self.powerwash_scheduled.load(Ordering::SeqCst)
    }

    pub fn powerwash_cancel_calls(&self) -> u32 {
        self.powerwash_cancel_calls.load(Ordering::SeqCst)
    }

    /// The last value passed to `set_warm_reset`, if any.
    pub fn warm_reset(&self) -> Option<bool> {
        *self.warm_reset.lock().unwrap()
    }

    /// The last value passed to `set_vbmeta_digest_for_inactive_slot`, if any.
    pub fn vbmeta_digest_reset(&self) -> Option<bool> {
        *self.vbmeta_digest_reset.lock().unwrap()
    }
}

impl Hardware for FakeHardware {
    fn schedule_powerwash(&self) -> bool {
        if self.fail_powerwash.load(Ordering::SeqCst) {
            return false;
        }
        self.powerwash_scheduled.store(true, Ordering::SeqCst);
        true
    }

    fn cancel_powerwash(&self) -> bool {
        self.powerwash_cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.powerwash_scheduled.store(false, Ordering::SeqCst);
        true
    }

    fn set_warm_reset(&self, enabled: bool) {
        *self.warm_reset.lock().unwrap() = Some(enabled);
    }

    fn set_vbmeta_digest_for_inactive_slot(&self, reset: bool) {
        *self.vbmeta_digest_reset.lock().unwrap() = Some(reset);
    }

    fn partition_mount_options(&self, _partition_name: &str) -> String {
        String::new()
    }
}
