// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The install plan is the contract between the payload-processing stages: it
//! is built once from the verified manifest and then consumed by the
//! postinstall runner.

use std::path::PathBuf;

use tracing::info;

use crate::{
    boot::{slot_name, BootControl, Slot, INVALID_SLOT},
    errorcode::ErrorCode,
    protobuf::chromeos_update_engine::DeltaArchiveManifest,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    /// Whether the postinstall step runs for this partition. Derived from the
    /// manifest and downgraded at runtime for optional partitions when the
    /// plan disables postinstall.
    pub run_postinstall: bool,
    /// Path of the postinstall program, relative to the mounted partition
    /// root. Must not be absolute.
    pub postinstall_path: String,
    /// Filesystem type hint for mounting. Empty means probe.
    pub filesystem_type: String,
    /// Whether a postinstall failure for this partition is non-fatal.
    pub postinstall_optional: bool,
    /// Block device to mount read-only for the postinstall step.
    pub readonly_target_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallPlan {
    /// Where the payload came from. An empty URL skips postinstall entirely.
    pub download_url: String,
    pub source_slot: Slot,
    pub target_slot: Slot,
    pub partitions: Vec<Partition>,
    pub switch_slot_on_reboot: bool,
    pub run_post_install: bool,
    pub powerwash_required: bool,
    pub is_resume: bool,
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            download_url: String::new(),
            source_slot: INVALID_SLOT,
            target_slot: INVALID_SLOT,
            partitions: vec![],
            switch_slot_on_reboot: true,
            run_post_install: true,
            powerwash_required: false,
            is_resume: false,
        }
    }
}

impl InstallPlan {
    /// Populate [`Self::partitions`] from the manifest, resolving each
    /// partition's target-slot block device.
    pub fn parse_partitions(
        &mut self,
        manifest: &DeltaArchiveManifest,
        boot_control: &dyn BootControl,
    ) -> Result<(), ErrorCode> {
        let current_slot = boot_control.current_slot();

        for partition in &manifest.partitions {
            let device = boot_control
                .partition_device(
                    &partition.partition_name,
                    self.target_slot,
                    current_slot,
                    false,
                )
                .ok_or(ErrorCode::InstallDeviceOpenError)?;

            self.partitions.push(Partition {
                name: partition.partition_name.clone(),
                run_postinstall: partition.run_postinstall.unwrap_or(false),
                postinstall_path: partition.postinstall_path.clone().unwrap_or_default(),
                filesystem_type: partition.filesystem_type.clone().unwrap_or_default(),
                postinstall_optional: partition.postinstall_optional.unwrap_or(false),
                readonly_target_path: device.readonly_device_path,
            });
        }

        Ok(())
    }

    pub fn dump(&self) {
        info!(
            "InstallPlan: {}, source_slot: {}, target_slot: {}, url: {}, \
             switch_slot_on_reboot: {}, run_post_install: {}, powerwash_required: {}",
            if self.is_resume { "RESUME" } else { "new_update" },
            slot_name(self.source_slot),
            slot_name(self.target_slot),
            self.download_url,
            self.switch_slot_on_reboot,
            self.run_post_install,
            self.powerwash_required,
        );

        for partition in &self.partitions {
            info!(
                "Partition: {}, device: {:?}, run_postinstall: {}, postinstall_path: {}, \
                 optional: {}",
                partition.name,
                partition.readonly_target_path,
                partition.run_postinstall,
                partition.postinstall_path,
                partition.postinstall_optional,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::{
        boot::fake::FakeBootControl,
        protobuf::chromeos_update_engine::PartitionUpdate,
    };

    use super::*;

    #[test]
    fn partitions_resolve_target_devices() {
        let boot_control = FakeBootControl::new();
        boot_control.set_partition_device("system", 1, Path::new("/dev/fake/system_b"));

        let manifest = DeltaArchiveManifest {
            partitions: vec![PartitionUpdate {
                partition_name: "system".to_owned(),
                run_postinstall: Some(true),
                postinstall_path: Some("bin/postinst".to_owned()),
                filesystem_type: Some("ext4".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut plan = InstallPlan {
            target_slot: 1,
            ..Default::default()
        };
        plan.parse_partitions(&manifest, &boot_control).unwrap();

        assert_eq!(plan.partitions.len(), 1);
        let partition = &plan.partitions[0];
        assert_eq!(partition.name, "system");
        assert!(partition.run_postinstall);
        assert_eq!(partition.postinstall_path, "bin/postinst");
        assert_eq!(partition.filesystem_type, "ext4");
        assert_eq!(
            partition.readonly_target_path,
            Path::new("/dev/fake/system_b"),
        );
    }

    #[test]
    fn unknown_partition_fails() {
        let boot_control = FakeBootControl::new();

        let manifest = DeltaArchiveManifest {
            partitions: vec![PartitionUpdate {
                partition_name: "vendor".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut plan = InstallPlan {
            target_slot: 1,
            ..Default::default()
        };
        assert_eq!(
            plan.parse_partitions(&manifest, &boot_control),
            Err(ErrorCode::InstallDeviceOpenError),
        );
    }
}
