// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory [`BootControl`] used for testing.

use std::{
    collections::HashMap,
    path::Path,
    sync::Mutex,
};

use crate::boot::{BootControl, PartitionDevice, Slot, INVALID_SLOT};

pub struct FakeBootControl {
    state: Mutex<FakeState>,
}

struct FakeState {
    num_slots: u32,
    current_slot: Slot,
    active_slot: Slot,
    is_bootable: Vec<bool>,
    is_successful: Vec<bool>,
    devices: Vec<HashMap<String, PartitionDevice>>,
    set_active_history: Vec<Slot>,
    set_active_result: bool,
}

impl Default for FakeBootControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBootControl {
    pub fn new() -> Self {
        let mut state = FakeState {
            num_slots: 2,
            current_slot: 0,
            active_slot: 0,
            is_bootable: vec![false; 2],
            is_successful: vec![false; 2],
            devices: vec![HashMap::new(); 2],
            set_active_history: vec![],
            set_active_result: true,
        };
        // The current slot should be bootable.
        state.is_bootable[0] = true;

        Self {
            state: Mutex::new(state),
        }
    }

    pub fn set_num_slots(&self, num_slots: u32) {
        let mut state = self.state.lock().unwrap();
        state.num_slots = num_slots;
        state.is_bootable.resize(num_slots as usize, false);
        state.is_successful.resize(num_slots as usize, false);
        state.devices.resize(num_slots as usize, HashMap::new());
    }

    pub fn set_current_slot(&self, slot: Slot) {
        self.state.lock().unwrap().current_slot = slot;
    }

    pub fn set_partition_device(&self, partition_name: &str, slot: Slot, device: &Path) {
        let mut state = self.state.lock().unwrap();
        assert!(slot < state.num_slots);

        state.devices[slot as usize].insert(
            partition_name.to_owned(),
            PartitionDevice {
                rw_device_path: device.to_owned(),
                readonly_device_path: device.to_owned(),
                is_dynamic: false,
            },
        );
    }

    pub fn set_slot_bootable(&self, slot: Slot, bootable: bool) {
        let mut state = self.state.lock().unwrap();
        assert!(slot < state.num_slots);
        state.is_bootable[slot as usize] = bootable;
    }

    /// Make subsequent [`BootControl::set_active_boot_slot`] calls fail.
    pub fn set_active_result(&self, result: bool) {
        self.state.lock().unwrap().set_active_result = result;
    }

    /// Every slot passed to [`BootControl::set_active_boot_slot`], in order,
    /// including failed calls.
    pub fn set_active_history(&self) -> Vec<Slot> {
        self.state.lock().unwrap().set_active_history.clone()
    }
}

impl BootControl for FakeBootControl {
    fn num_slots(&self) -> u32 {
        self.state.lock().unwrap().num_slots
    }

    fn current_slot(&self) -> Slot {
        self.state.lock().unwrap().current_slot
    }

    fn partition_device(
        &self,
        partition_name: &str,
        slot: Slot,
        _current_slot: Slot,
        _not_in_payload: bool,
    ) -> Option<PartitionDevice> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(slot as usize)?
            .get(partition_name)
            .cloned()
    }

    fn is_slot_bootable(&self, slot: Slot) -> bool {
        let state = self.state.lock().unwrap();
        slot < state.num_slots && state.is_bootable[slot as usize]
    }

    fn mark_slot_unbootable(&self, slot: Slot) -> bool {
        let mut state = self.state.lock().unwrap();
        if slot >= state.num_slots {
            return false;
        }
        state.is_bootable[slot as usize] = false;
        true
    }

    fn set_active_boot_slot(&self, slot: Slot) -> bool {
        let mut state = self.state.lock().unwrap();
        state.set_active_history.push(slot);
        if !state.set_active_result {
            return false;
        }
        state.active_slot = slot;
        true
    }

    fn get_active_boot_slot(&self) -> Slot {
        self.state.lock().unwrap().active_slot
    }

    fn mark_boot_successful_async(&self, callback: Box<dyn FnOnce(bool) + Send>) -> bool {
        // Run the callback directly to avoid a helper thread in tests.
        let mut state = self.state.lock().unwrap();
        let current = state.current_slot;
        if current == INVALID_SLOT || current >= state.num_slots {
            return false;
        }
        state.is_successful[current as usize] = true;
        drop(state);

        callback(true);
        true
    }

    fn is_slot_marked_successful(&self, slot: Slot) -> bool {
        let state = self.state.lock().unwrap();
        slot < state.num_slots && state.is_successful[slot as usize]
    }
}
