// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The boot-slot controller abstraction. It hides the vendor-specific
//! bootloader interaction behind a narrow capability set: querying slots,
//! flipping the bootable/successful flags, and selecting the slot to try on
//! the next reboot.

pub mod ab;
pub mod fake;

use std::path::PathBuf;

/// Index of an A/B slot.
pub type Slot = u32;

/// Sentinel for "no valid slot".
pub const INVALID_SLOT: Slot = Slot::MAX;

/// Human-readable slot name for logging.
pub fn slot_name(slot: Slot) -> String {
    if slot == INVALID_SLOT {
        return "INVALID".to_owned();
    }
    if slot < 26 {
        return char::from(b'A' + slot as u8).to_string();
    }
    "TOO_BIG".to_owned()
}

/// Block-device paths backing a partition in a particular slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDevice {
    pub rw_device_path: PathBuf,
    pub readonly_device_path: PathBuf,
    /// Dynamic partitions must be mapped before the paths are usable and
    /// unmapped afterward.
    pub is_dynamic: bool,
}

/// Interaction with the platform bootloader. Mutating operations are expected
/// to be serialized by the caller; the update-attempter only issues them from
/// its completion path.
pub trait BootControl: Send + Sync {
    /// Number of slots in the system. Updating requires at least two.
    fn num_slots(&self) -> u32;

    /// The slot the running system booted from, or [`INVALID_SLOT`] on
    /// failure. This never changes until the next reboot.
    fn current_slot(&self) -> Slot;

    /// Translate a logical partition name to its block devices for `slot`.
    /// Returns `None` when the slot is invalid or the partition is unknown.
    fn partition_device(
        &self,
        partition_name: &str,
        slot: Slot,
        current_slot: Slot,
        not_in_payload: bool,
    ) -> Option<PartitionDevice>;

    /// Whether `slot` is marked bootable. False for invalid slots.
    fn is_slot_bootable(&self, slot: Slot) -> bool;

    /// Clear the bootable flag of `slot`. No other flags are modified.
    fn mark_slot_unbootable(&self, slot: Slot) -> bool;

    /// Select the slot the bootloader tries on the next reboot. Does not
    /// affect [`Self::current_slot`] for the running system.
    fn set_active_boot_slot(&self, slot: Slot) -> bool;

    /// The slot that will be tried on the next reboot, or [`INVALID_SLOT`]
    /// when the bootloader does not support querying it.
    fn get_active_boot_slot(&self) -> Slot;

    /// Mark the current slot as successfully booted, asynchronously. Returns
    /// whether the operation could be scheduled; the callback receives the
    /// result. Must be idempotent.
    fn mark_boot_successful_async(&self, callback: Box<dyn FnOnce(bool) + Send>) -> bool;

    /// Whether `slot` is marked as successfully booted.
    fn is_slot_marked_successful(&self, slot: Slot) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names() {
        assert_eq!(slot_name(0), "A");
        assert_eq!(slot_name(1), "B");
        assert_eq!(slot_name(25), "Z");
        assert_eq!(slot_name(26), "TOO_BIG");
        assert_eq!(slot_name(INVALID_SLOT), "INVALID");

        for s in 0..26 {
            let name = slot_name(s);
            assert_eq!(name.len(), 1);
            assert_eq!(name.as_bytes()[0], b'A' + s as u8);
        }
    }
}
