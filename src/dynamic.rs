// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Narrow interface to the dynamic-partition (logical volume) manager. The
//! manager itself lives outside this crate; the update pipeline only needs to
//! prepare space, map/unmap the block devices, and finalize the update.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};

use crate::{boot::Slot, protobuf::chromeos_update_engine::DeltaArchiveManifest};

pub trait DynamicPartitionControl: Send + Sync {
    /// Allocate or resize the target slot's partitions for the update
    /// described by `manifest`. On failure, `required_size` receives the total
    /// number of bytes needed when the problem is insufficient space, or zero
    /// otherwise. May block for a long time.
    fn prepare_partitions_for_update(
        &self,
        source_slot: Slot,
        target_slot: Slot,
        manifest: &DeltaArchiveManifest,
        update: bool,
        required_size: &mut u64,
    ) -> bool;

    /// Map all target partitions so their block devices exist.
    fn map_all_partitions(&self) -> bool;

    /// Unmap all target partitions previously mapped.
    fn unmap_all_partitions(&self) -> bool;

    /// Finalize the update before the slot switch is committed.
    fn finish_update(&self, powerwash_required: bool) -> bool;
}

/// No-op implementation for devices without dynamic partitions.
pub struct StubDynamicPartitionControl;

impl DynamicPartitionControl for StubDynamicPartitionControl {
    fn prepare_partitions_for_update(
        &self,
        _source_slot: Slot,
        _target_slot: Slot,
        _manifest: &DeltaArchiveManifest,
        _update: bool,
        required_size: &mut u64,
    ) -> bool {
        *required_size = 0;
        true
    }

    fn map_all_partitions(&self) -> bool {
        true
    }

    fn unmap_all_partitions(&self) -> bool {
        true
    }

    fn finish_update(&self, _powerwash_required: bool) -> bool {
        true
    }
}

/// Recording fake for tests. Each operation succeeds unless a failure is
/// injected, and call counts are observable.
#[derive(Default)]
pub struct FakeDynamicPartitionControl {
    pub map_calls: AtomicU32,
    pub unmap_calls: AtomicU32,
    pub finish_calls: AtomicU32,
    finish_powerwash: Mutex<Vec<bool>>,
    fail_map: AtomicBool,
    fail_finish: AtomicBool,
    required_size: AtomicU32,
}

impl FakeDynamicPartitionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }

    /// Make `prepare_partitions_for_update` fail, reporting `size` bytes as
    /// required.
    pub fn set_required_size(&self, size: u32) {
        self.required_size.store(size, Ordering::SeqCst);
    }

    pub fn finish_powerwash_args(&self) -> Vec<bool> {
        self.finish_powerwash.lock().unwrap().clone()
    }
}

impl DynamicPartitionControl for FakeDynamicPartitionControl {
    fn prepare_partitions_for_update(
        &self,
        _source_slot: Slot,
        _target_slot: Slot,
        _manifest: &DeltaArchiveManifest,
        _update: bool,
        required_size: &mut u64,
    ) -> bool {
        let required = self.required_size.load(Ordering::SeqCst);
        *required_size = u64::from(required);
        required == 0
    }

    fn map_all_partitions(&self) -> bool {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        !self.fail_map.load(Ordering::SeqCst)
    }

    fn unmap_all_partitions(&self) -> bool {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn finish_update(&self, powerwash_required: bool) -> bool {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        self.finish_powerwash.lock().unwrap().push(powerwash_required);
        !self.fail_finish.load(Ordering::SeqCst)
    }
}
