// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Slot state machine walks across simulated reboots.

use std::path::Path;

use otapply::boot::{ab::AbBootControl, slot_name, BootControl, INVALID_SLOT};

#[test]
fn full_update_cycle_across_reboots() {
    let dir = tempfile::tempdir().unwrap();
    let metadata_path = dir.path().join("slot_metadata");
    let dev_dir = Path::new("/dev/block/by-name");

    // First boot: running from slot A, slot B unused.
    {
        let control = AbBootControl::open(&metadata_path, dev_dir, 0).unwrap();
        assert_eq!(control.num_slots(), 2);
        assert_eq!(control.current_slot(), 0);
        assert!(control.is_slot_bootable(0));
        assert!(!control.is_slot_bootable(1));

        // Update applied; B becomes the active slot.
        assert!(control.set_active_boot_slot(1));
        assert_eq!(control.get_active_boot_slot(), 1);
        assert!(control.is_slot_bootable(1));
        assert!(!control.is_slot_marked_successful(1));
    }

    // "Reboot" into slot B and mark the boot successful.
    {
        let control = AbBootControl::open(&metadata_path, dev_dir, 1).unwrap();
        assert_eq!(control.current_slot(), 1);

        let (tx, rx) = std::sync::mpsc::channel();
        assert!(control.mark_boot_successful_async(Box::new(move |ok| tx.send(ok).unwrap())));
        assert!(rx.recv().unwrap());
        assert!(control.is_slot_marked_successful(1));
        assert!(control.is_slot_bootable(1));

        // Marking successful twice is fine.
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(control.mark_boot_successful_async(Box::new(move |ok| tx.send(ok).unwrap())));
        assert!(rx.recv().unwrap());
    }

    // The next update goes back to slot A. Activating A must not disturb B's
    // successful flag, and activating B again later clears it.
    {
        let control = AbBootControl::open(&metadata_path, dev_dir, 1).unwrap();

        assert!(control.set_active_boot_slot(0));
        assert!(control.is_slot_marked_successful(1));

        assert!(control.set_active_boot_slot(1));
        assert!(!control.is_slot_marked_successful(1));
    }
}

#[test]
fn every_state_accepts_mark_unbootable() {
    let dir = tempfile::tempdir().unwrap();
    let metadata_path = dir.path().join("slot_metadata");

    let control = AbBootControl::open(&metadata_path, Path::new("/dev"), 0).unwrap();

    // Unused slot.
    assert!(control.mark_slot_unbootable(1));
    assert!(!control.is_slot_bootable(1));

    // Active slot.
    assert!(control.set_active_boot_slot(1));
    assert!(control.mark_slot_unbootable(1));
    assert!(!control.is_slot_bootable(1));

    // Successful (current) slot.
    let (tx, rx) = std::sync::mpsc::channel();
    assert!(control.mark_boot_successful_async(Box::new(move |ok| tx.send(ok).unwrap())));
    assert!(rx.recv().unwrap());
    assert!(control.mark_slot_unbootable(0));
    assert!(!control.is_slot_bootable(0));
    assert!(control.is_slot_marked_successful(0));

    // Out-of-range slots are rejected.
    assert!(!control.mark_slot_unbootable(2));
    assert!(!control.is_slot_bootable(INVALID_SLOT));
}

#[test]
fn slot_name_encoding() {
    assert_eq!(slot_name(0), "A");
    assert_eq!(slot_name(1), "B");
    assert_eq!(slot_name(25), "Z");
    assert_eq!(slot_name(26), "TOO_BIG");
    assert_eq!(slot_name(INVALID_SLOT), "INVALID");
}
