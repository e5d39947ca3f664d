// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! A/B driver backed by a small on-disk slot-metadata record. The record is
//! replaced atomically on every mutation so an abrupt reboot either sees the
//! old state or the new state, never a torn one.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    boot::{slot_name, BootControl, PartitionDevice, Slot},
    osutil,
};

const METADATA_MAGIC: &[u8; 4] = b"ABSM";
const METADATA_VERSION: u8 = 1;
const MAX_SLOTS: u32 = 4;

const FLAG_BOOTABLE: u8 = 1 << 0;
const FLAG_SUCCESSFUL: u8 = 1 << 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown slot metadata magic: {}", hex::encode(.0))]
    UnknownMagic([u8; 4]),
    #[error("Unsupported slot metadata version: {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid slot count: {0}")]
    InvalidSlotCount(u8),
    #[error("Slot out of range: {0}")]
    SlotOutOfRange(Slot),
    #[error("Slot metadata is truncated")]
    Truncated,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SlotFlags {
    bootable: bool,
    successful: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SlotMetadata {
    active: Slot,
    slots: Vec<SlotFlags>,
}

impl SlotMetadata {
    fn new(num_slots: u32, current_slot: Slot) -> Self {
        let mut slots = vec![SlotFlags::default(); num_slots as usize];
        // The slot we're running from is necessarily bootable.
        if let Some(flags) = slots.get_mut(current_slot as usize) {
            flags.bootable = true;
        }

        Self {
            active: current_slot,
            slots,
        }
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(Error::Truncated);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[..4]);
        if magic != *METADATA_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = data[4];
        if version != METADATA_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let num_slots = data[5];
        if num_slots == 0 || u32::from(num_slots) > MAX_SLOTS {
            return Err(Error::InvalidSlotCount(num_slots));
        }

        let active = Slot::from(data[6]);

        let flags_raw = &data[7..];
        if flags_raw.len() < num_slots as usize {
            return Err(Error::Truncated);
        }

        let slots = flags_raw[..num_slots as usize]
            .iter()
            .map(|&raw| SlotFlags {
                bootable: raw & FLAG_BOOTABLE != 0,
                successful: raw & FLAG_SUCCESSFUL != 0,
            })
            .collect();

        Ok(Self { active, slots })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(7 + self.slots.len());
        data.extend_from_slice(METADATA_MAGIC);
        data.push(METADATA_VERSION);
        data.push(self.slots.len() as u8);
        data.push(self.active as u8);

        for flags in &self.slots {
            let mut raw = 0;
            if flags.bootable {
                raw |= FLAG_BOOTABLE;
            }
            if flags.successful {
                raw |= FLAG_SUCCESSFUL;
            }
            data.push(raw);
        }

        data
    }
}

struct Inner {
    metadata_path: PathBuf,
    state: Mutex<SlotMetadata>,
}

impl Inner {
    /// Persist the current state. Mutating operations report failure to the
    /// caller instead of leaving memory and disk out of sync silently.
    fn persist(&self, state: &SlotMetadata) -> bool {
        match osutil::write_file_atomic(&self.metadata_path, &state.to_bytes()) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist slot metadata to {:?}: {e}", self.metadata_path);
                false
            }
        }
    }
}

/// [`BootControl`] implementation for A/B devices whose bootloader consumes
/// the slot-metadata record written by this driver.
pub struct AbBootControl {
    inner: Arc<Inner>,
    block_dev_dir: PathBuf,
    current_slot: Slot,
}

impl AbBootControl {
    /// Load the slot metadata from `metadata_path`, initializing a fresh
    /// two-slot record when none exists. `block_dev_dir` is the directory
    /// containing the by-name partition links (`<name>_<suffix>`).
    pub fn open(metadata_path: &Path, block_dev_dir: &Path, current_slot: Slot) -> Result<Self> {
        let state = match fs::read(metadata_path) {
            Ok(data) => SlotMetadata::from_bytes(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Initializing slot metadata at {metadata_path:?}");
                let state = SlotMetadata::new(2, current_slot);
                osutil::write_file_atomic(metadata_path, &state.to_bytes())?;
                state
            }
            Err(e) => return Err(e.into()),
        };

        if current_slot as usize >= state.slots.len() {
            return Err(Error::SlotOutOfRange(current_slot));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                metadata_path: metadata_path.to_owned(),
                state: Mutex::new(state),
            }),
            block_dev_dir: block_dev_dir.to_owned(),
            current_slot,
        })
    }
}

impl BootControl for AbBootControl {
    fn num_slots(&self) -> u32 {
        self.inner.state.lock().unwrap().slots.len() as u32
    }

    fn current_slot(&self) -> Slot {
        self.current_slot
    }

    fn partition_device(
        &self,
        partition_name: &str,
        slot: Slot,
        _current_slot: Slot,
        _not_in_payload: bool,
    ) -> Option<PartitionDevice> {
        if slot as usize >= self.inner.state.lock().unwrap().slots.len() || slot >= 26 {
            warn!("Invalid slot for partition {partition_name}: {}", slot_name(slot));
            return None;
        }

        let suffix = char::from(b'a' + slot as u8);
        let path = self.block_dev_dir.join(format!("{partition_name}_{suffix}"));

        Some(PartitionDevice {
            rw_device_path: path.clone(),
            readonly_device_path: path,
            is_dynamic: false,
        })
    }

    fn is_slot_bootable(&self, slot: Slot) -> bool {
        let state = self.inner.state.lock().unwrap();
        state
            .slots
            .get(slot as usize)
            .is_some_and(|flags| flags.bootable)
    }

    fn mark_slot_unbootable(&self, slot: Slot) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        let Some(flags) = state.slots.get_mut(slot as usize) else {
            return false;
        };
        flags.bootable = false;

        info!("Marked slot {} unbootable", slot_name(slot));
        self.inner.persist(&state)
    }

    fn set_active_boot_slot(&self, slot: Slot) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        let Some(flags) = state.slots.get_mut(slot as usize) else {
            return false;
        };
        // Activation starts a fresh trial boot: the slot must be bootable and
        // its previous success no longer counts.
        flags.bootable = true;
        flags.successful = false;
        state.active = slot;

        info!("Marked slot {} active for the next boot", slot_name(slot));
        self.inner.persist(&state)
    }

    fn get_active_boot_slot(&self) -> Slot {
        self.inner.state.lock().unwrap().active
    }

    fn mark_boot_successful_async(&self, callback: Box<dyn FnOnce(bool) + Send>) -> bool {
        let inner = self.inner.clone();
        let slot = self.current_slot;

        thread::spawn(move || {
            let ok = {
                let mut state = inner.state.lock().unwrap();

                match state.slots.get_mut(slot as usize) {
                    Some(flags) if flags.successful => true,
                    Some(flags) => {
                        flags.bootable = true;
                        flags.successful = true;
                        info!("Marked slot {} as booted successfully", slot_name(slot));
                        inner.persist(&state)
                    }
                    None => false,
                }
            };

            callback(ok);
        });

        true
    }

    fn is_slot_marked_successful(&self, slot: Slot) -> bool {
        let state = self.inner.state.lock().unwrap();
        state
            .slots
            .get(slot as usize)
            .is_some_and(|flags| flags.successful)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn metadata_round_trip() {
        let metadata = SlotMetadata {
            active: 1,
            slots: vec![
                SlotFlags {
                    bootable: true,
                    successful: true,
                },
                SlotFlags {
                    bootable: true,
                    successful: false,
                },
            ],
        };

        let data = metadata.to_bytes();
        assert_eq!(SlotMetadata::from_bytes(&data).unwrap(), metadata);
    }

    #[test]
    fn metadata_rejects_garbage() {
        assert_matches!(SlotMetadata::from_bytes(b"ABSM"), Err(Error::Truncated));
        assert_matches!(
            SlotMetadata::from_bytes(b"XXXX\x01\x02\x00\x01\x01"),
            Err(Error::UnknownMagic(_)),
        );
        assert_matches!(
            SlotMetadata::from_bytes(b"ABSM\x02\x02\x00\x01\x01"),
            Err(Error::UnsupportedVersion(2)),
        );
        assert_matches!(
            SlotMetadata::from_bytes(b"ABSM\x01\x00\x00"),
            Err(Error::InvalidSlotCount(0)),
        );
    }

    #[test]
    fn activation_restarts_trial_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot_metadata");

        let control = AbBootControl::open(&path, Path::new("/dev/block/by-name"), 0).unwrap();
        assert_eq!(control.num_slots(), 2);
        assert!(control.is_slot_bootable(0));
        assert!(!control.is_slot_bootable(1));

        assert!(control.set_active_boot_slot(1));
        assert_eq!(control.get_active_boot_slot(), 1);
        assert!(control.is_slot_bootable(1));
        assert!(!control.is_slot_marked_successful(1));
    }

    #[test]
    fn unbootable_preserves_other_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot_metadata");

        let control = AbBootControl::open(&path, Path::new("/dev"), 1).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        assert!(control.mark_boot_successful_async(Box::new(move |ok| tx.send(ok).unwrap())));
        assert!(rx.recv().unwrap());
        assert!(control.is_slot_marked_successful(1));

        assert!(control.mark_slot_unbootable(1));
        assert!(!control.is_slot_bootable(1));
        assert!(control.is_slot_marked_successful(1));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot_metadata");

        {
            let control = AbBootControl::open(&path, Path::new("/dev"), 0).unwrap();
            assert!(control.set_active_boot_slot(1));
        }

        let control = AbBootControl::open(&path, Path::new("/dev"), 0).unwrap();
        assert_eq!(control.get_active_boot_slot(), 1);
        assert!(control.is_slot_bootable(1));
    }

    #[test]
    fn partition_devices_are_suffixed()  {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot_metadata");

        let control =
            AbBootControl::open(&path, Path::new("/dev/block/by-name"), 0).unwrap();

        let device = control.partition_device("system", 1, 0, false).unwrap();
        assert_eq!(
            device.readonly_device_path,
            Path::new("/dev/block/by-name/system_b"),
        );
        assert!(!device.is_dynamic);

        assert_eq!(control.partition_device("system", 2, 0, false), None);
    }
}
