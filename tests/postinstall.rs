// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Postinstall runner scenarios, driven with a privilege-free mounter and
//! real child processes.

use std::{
    fs,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;

use otapply::{
    boot::{fake::FakeBootControl, BootControl, PartitionDevice, Slot},
    dynamic::DynamicPartitionControl,
    errorcode::ErrorCode,
    hardware::{FakeHardware, Hardware},
    install_plan::{InstallPlan, Partition},
    osutil::{FakeMounter, Mounter},
    postinstall::{PostinstallRunner, ProgressDelegate},
    protobuf::chromeos_update_engine::DeltaArchiveManifest,
};

#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct LoggingBoot {
    inner: FakeBootControl,
    log: Arc<EventLog>,
}

impl BootControl for LoggingBoot {
    fn num_slots(&self) -> u32 {
        self.inner.num_slots()
    }

    fn current_slot(&self) -> Slot {
        self.inner.current_slot()
    }

    fn partition_device(
        &self,
        partition_name: &str,
        slot: Slot,
        current_slot: Slot,
        not_in_payload: bool,
    ) -> Option<PartitionDevice> {
        self.inner
            .partition_device(partition_name, slot, current_slot, not_in_payload)
    }

    fn is_slot_bootable(&self, slot: Slot) -> bool {
        self.inner.is_slot_bootable(slot)
    }

    fn mark_slot_unbootable(&self, slot: Slot) -> bool {
        self.inner.mark_slot_unbootable(slot)
    }

    fn set_active_boot_slot(&self, slot: Slot) -> bool {
        self.log.push(format!("set_active_boot_slot({slot})"));
        self.inner.set_active_boot_slot(slot)
    }

    fn get_active_boot_slot(&self) -> Slot {
        self.inner.get_active_boot_slot()
    }

    fn mark_boot_successful_async(&self, callback: Box<dyn FnOnce(bool) + Send>) -> bool {
        self.inner.mark_boot_successful_async(callback)
    }

    fn is_slot_marked_successful(&self, slot: Slot) -> bool {
        self.inner.is_slot_marked_successful(slot)
    }
}

struct LoggingDynamic {
    log: Arc<EventLog>,
}

impl DynamicPartitionControl for LoggingDynamic {
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
        self.log.push("map_all_partitions");
        true
    }

    fn unmap_all_partitions(&self) -> bool {
        self.log.push("unmap_all_partitions");
        true
    }

    fn finish_update(&self, powerwash_required: bool) -> bool {
        self.log.push(format!("finish_update({powerwash_required})"));
        true
    }
}

struct LoggingHardware {
    inner: FakeHardware,
    log: Arc<EventLog>,
}

impl Hardware for LoggingHardware {
    fn schedule_powerwash(&self) -> bool {
        self.log.push("schedule_powerwash");
        self.inner.schedule_powerwash()
    }

    fn cancel_powerwash(&self) -> bool {
        self.log.push("cancel_powerwash");
        self.inner.cancel_powerwash()
    }

    fn set_warm_reset(&self, enabled: bool) {
        self.log.push(format!("set_warm_reset({enabled})"));
        self.inner.set_warm_reset(enabled);
    }

    fn set_vbmeta_digest_for_inactive_slot(&self, reset: bool) {
        self.log
            .push(format!("set_vbmeta_digest_for_inactive_slot({reset})"));
        self.inner.set_vbmeta_digest_for_inactive_slot(reset);
    }

    fn partition_mount_options(&self, partition_name: &str) -> String {
        self.inner.partition_mount_options(partition_name)
    }
}

struct LoggingMounter {
    inner: FakeMounter,
    log: Arc<EventLog>,
}

impl Mounter for LoggingMounter {
    fn mount_ro(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: &str,
    ) -> io::Result<()> {
        let result = self.inner.mount_ro(device, mount_point, fs_type, options);
        if result.is_ok() {
            self.log.push(format!(
                "mount({})",
                device.file_name().unwrap().to_string_lossy(),
            ));
        }
        result
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        let result = self.inner.unmount(mount_point);
        if result.is_ok() {
            self.log.push("unmount");
        }
        result
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        self.inner.is_mountpoint(path)
    }
}

#[derive(Default)]
struct ProgressCollector(Mutex<Vec<f64>>);

impl ProgressCollector {
    fn values(&self) -> Vec<f64> {
        self.0.lock().unwrap().clone()
    }
}

impl ProgressDelegate for ProgressCollector {
    fn progress_update(&self, progress: f64) {
        self.0.lock().unwrap().push(progress);
    }
}

struct TestEnv {
    log: Arc<EventLog>,
    boot: Arc<LoggingBoot>,
    hardware: Arc<LoggingHardware>,
    dynamic: Arc<LoggingDynamic>,
    mounter: Arc<LoggingMounter>,
    progress: Arc<ProgressCollector>,
    mount_dir: TempDir,
    _devices: TempDir,
    device_root: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let log = Arc::new(EventLog::default());
        let devices = TempDir::new().unwrap();
        let device_root = devices.path().to_owned();

        Self {
            boot: Arc::new(LoggingBoot {
                inner: FakeBootControl::new(),
                log: log.clone(),
            }),
            hardware: Arc::new(LoggingHardware {
                inner: FakeHardware::new(),
                log: log.clone(),
            }),
            dynamic: Arc::new(LoggingDynamic { log: log.clone() }),
            mounter: Arc::new(LoggingMounter {
                inner: FakeMounter::new(),
                log: log.clone(),
            }),
            progress: Arc::new(ProgressCollector::default()),
            mount_dir: TempDir::new().unwrap(),
            _devices: devices,
            device_root,
            log,
        }
    }

    /// Create a fake partition "device": a directory holding a postinstall
    /// script at `bin/postinst`.
    fn make_device(&self, name: &str, script_body: &str) -> PathBuf {
        let device = self.device_root.join(name);
        fs::create_dir_all(device.join("bin")).unwrap();

        let script = device.join("bin/postinst");
        fs::write(&script, script_body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        device
    }

    fn partition(&self, name: &str, device: &Path) -> Partition {
        Partition {
            name: name.to_owned(),
            run_postinstall: true,
            postinstall_path: "bin/postinst".to_owned(),
            filesystem_type: "ext4".to_owned(),
            postinstall_optional: false,
            readonly_target_path: device.to_owned(),
        }
    }

    fn plan(&self, partitions: Vec<Partition>) -> InstallPlan {
        InstallPlan {
            download_url: "file:///data/payload.bin".to_owned(),
            source_slot: 0,
            target_slot: 1,
            partitions,
            ..Default::default()
        }
    }

    fn runner(&self) -> PostinstallRunner {
        let mut runner = PostinstallRunner::with_mounter(
            self.boot.clone(),
            self.hardware.clone(),
            self.dynamic.clone(),
            self.mounter.clone(),
            self.mount_dir.path().to_owned(),
        );
        runner.set_delegate(self.progress.clone());
        runner
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

const SUCCESS_SCRIPT: &str = "#!/bin/sh\n\
    echo \"global_progress 0.5\" >&3\n\
    echo \"global_progress 1.0\" >&3\n\
    exit 0\n";

#[test]
fn happy_path_two_partitions_switches_slot() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", SUCCESS_SCRIPT);
    let d1 = env.make_device("vendor_b", SUCCESS_SCRIPT);

    let plan = env.plan(vec![
        env.partition("system", &d0),
        env.partition("vendor", &d1),
    ]);

    let code = env.runner().perform(plan);
    assert_eq!(code, ErrorCode::Success);

    assert_eq!(
        env.log.events(),
        vec![
            "map_all_partitions",
            "mount(system_b)",
            "unmount",
            "mount(vendor_b)",
            "unmount",
            "finish_update(false)",
            "set_active_boot_slot(1)",
            "set_warm_reset(true)",
            "set_vbmeta_digest_for_inactive_slot(false)",
            "unmap_all_partitions",
        ],
    );

    let progress = env.progress.values();
    assert_eq!(progress, vec![0.0, 0.25, 0.5, 0.5, 0.75, 1.0, 1.0]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn updated_but_not_active_without_slot_switch() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", SUCCESS_SCRIPT);

    let mut plan = env.plan(vec![env.partition("system", &d0)]);
    plan.switch_slot_on_reboot = false;

    let code = env.runner().perform(plan);
    assert_eq!(code, ErrorCode::UpdatedButNotActive);

    let events = env.log.events();
    assert!(!events.iter().any(|e| e.starts_with("set_active_boot_slot")));
    assert!(!events.iter().any(|e| e.starts_with("finish_update")));
}

#[test]
fn optional_postinstall_failure_is_ignored() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", "#!/bin/sh\nexit 7\n");

    let mut partition = env.partition("system", &d0);
    partition.postinstall_optional = true;

    let code = env.runner().perform(env.plan(vec![partition]));
    assert_eq!(code, ErrorCode::Success);

    // The slot switch still happened.
    let events = env.log.events();
    assert!(events.contains(&"set_active_boot_slot(1)".to_owned()));
}

#[test]
fn exit_code_3_reports_firmware_b() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", "#!/bin/sh\nexit 3\n");

    let code = env.runner().perform(env.plan(vec![env.partition("system", &d0)]));
    assert_eq!(code, ErrorCode::PostinstallBootedFromFirmwareB);

    // No slot switch was performed.
    let events = env.log.events();
    assert!(!events.iter().any(|e| e.starts_with("set_active_boot_slot")));
}

#[test]
fn exit_code_4_reports_firmware_ro() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", "#!/bin/sh\nexit 4\n");

    let code = env.runner().perform(env.plan(vec![env.partition("system", &d0)]));
    assert_eq!(code, ErrorCode::PostinstallFirmwareRONotUpdatable);
}

#[test]
fn absolute_postinstall_path_never_launches() {
    let env = TestEnv::new();
    let d0 = env.make_device(
        "system_b",
        "#!/bin/sh\ntouch \"$(dirname \"$0\")/ran\"\nexit 0\n",
    );

    let mut partition = env.partition("system", &d0);
    partition.postinstall_path = "/bin/postinst".to_owned();

    let code = env.runner().perform(env.plan(vec![partition]));
    assert_eq!(code, ErrorCode::PostinstallRunnerError);

    // The child was never spawned and the mount was released.
    assert!(!d0.join("bin/ran").exists());
    assert!(!env.mounter.is_mountpoint(env.mount_dir.path()));
}

#[test]
fn parent_dir_escape_never_launches() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", SUCCESS_SCRIPT);

    let mut partition = env.partition("system", &d0);
    partition.postinstall_path = "../postinst".to_owned();

    let code = env.runner().perform(env.plan(vec![partition]));
    assert_eq!(code, ErrorCode::PostinstallRunnerError);
    assert!(!env.mounter.is_mountpoint(env.mount_dir.path()));
}

#[test]
fn skipped_partition_is_still_mount_checked() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", SUCCESS_SCRIPT);

    let mut partition = env.partition("system", &d0);
    partition.run_postinstall = false;

    let code = env.runner().perform(env.plan(vec![partition]));
    assert_eq!(code, ErrorCode::Success);

    // Mounted and unmounted once as a sanity probe, then the slot switch.
    let events = env.log.events();
    assert_eq!(
        events,
        vec![
            "map_all_partitions",
            "mount(system_b)",
            "unmount",
            "finish_update(false)",
            "set_active_boot_slot(1)",
            "set_warm_reset(true)",
            "set_vbmeta_digest_for_inactive_slot(false)",
            "unmap_all_partitions",
        ],
    );
}

#[test]
fn skipped_partition_mount_failure_aborts() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", SUCCESS_SCRIPT);
    env.mounter.inner.fail_device(&d0);

    let mut partition = env.partition("system", &d0);
    partition.run_postinstall = false;

    let code = env.runner().perform(env.plan(vec![partition]));
    assert_eq!(code, ErrorCode::PostInstallMountError);
}

#[test]
fn run_post_install_false_downgrades_optional_partitions() {
    let env = TestEnv::new();
    let d0 = env.make_device(
        "system_b",
        "#!/bin/sh\ntouch \"$(dirname \"$0\")/ran\"\nexit 1\n",
    );

    let mut partition = env.partition("system", &d0);
    partition.postinstall_optional = true;

    let mut plan = env.plan(vec![partition]);
    plan.run_post_install = false;

    let code = env.runner().perform(plan);
    assert_eq!(code, ErrorCode::Success);

    // The script never ran; the partition was only mount-checked.
    assert!(!d0.join("bin/ran").exists());
    assert!(env.log.events().contains(&"mount(system_b)".to_owned()));
}

#[test]
fn empty_download_url_skips_postinstall_but_switches() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", "#!/bin/sh\nexit 1\n");

    let mut plan = env.plan(vec![env.partition("system", &d0)]);
    plan.download_url = String::new();

    let code = env.runner().perform(plan);
    assert_eq!(code, ErrorCode::Success);

    let events = env.log.events();
    assert!(!events.contains(&"mount(system_b)".to_owned()));
    assert!(events.contains(&"set_active_boot_slot(1)".to_owned()));
}

#[test]
fn progress_values_are_clamped() {
    let env = TestEnv::new();
    let d0 = env.make_device(
        "system_b",
        "#!/bin/sh\n\
         echo \"global_progress nan\" >&3\n\
         echo \"global_progress inf\" >&3\n\
         echo \"global_progress -1\" >&3\n\
         echo \"global_progress 2\" >&3\n\
         echo \"global_progress 0.5\" >&3\n\
         echo \"not a progress line\" >&3\n\
         exit 0\n",
    );

    let code = env.runner().perform(env.plan(vec![env.partition("system", &d0)]));
    assert_eq!(code, ErrorCode::Success);

    let progress = env.progress.values();
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(progress.contains(&0.5));
}

#[test]
fn powerwash_failure_aborts_before_any_mount() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", SUCCESS_SCRIPT);
    env.hardware.inner.set_fail_powerwash(true);

    let mut plan = env.plan(vec![env.partition("system", &d0)]);
    plan.powerwash_required = true;

    let code = env.runner().perform(plan);
    assert_eq!(code, ErrorCode::PostinstallPowerwashError);
    assert!(!env.log.events().contains(&"mount(system_b)".to_owned()));
}

#[test]
fn failure_after_scheduled_powerwash_cancels_it() {
    let env = TestEnv::new();
    let d0 = env.make_device("system_b", "#!/bin/sh\nexit 5\n");

    let mut plan = env.plan(vec![env.partition("system", &d0)]);
    plan.powerwash_required = true;

    let code = env.runner().perform(plan);
    assert_eq!(code, ErrorCode::PostinstallRunnerError);

    assert_eq!(env.hardware.inner.powerwash_cancel_calls(), 1);
    assert!(!env.hardware.inner.is_powerwash_scheduled());
}

#[test]
fn cancel_mid_partition() {
    let env = TestEnv::new();
    let d0 = env.make_device(
        "system_b",
        "#!/bin/sh\n\
         echo \"global_progress 0.5\" >&3\n\
         sleep 30\n\
         exit 0\n",
    );

    let mut plan = env.plan(vec![env.partition("system", &d0)]);
    plan.powerwash_required = true;

    let mut runner = env.runner();
    let handle = runner.handle();

    let worker = thread::spawn(move || runner.perform(plan));

    // Wait for the first progress line to arrive, then suspend and cancel.
    assert!(wait_until(Duration::from_secs(10), || {
        env.progress.values().contains(&0.5)
    }));

    handle.suspend();
    handle.terminate();

    let code = worker.join().unwrap();
    assert_eq!(code, ErrorCode::UserCanceled);

    // The scheduled powerwash was compensated and no slot switch happened.
    assert_eq!(env.hardware.inner.powerwash_cancel_calls(), 1);
    assert!(!env
        .log
        .events()
        .iter()
        .any(|e| e.starts_with("set_active_boot_slot")));

    // No further progress was reported after termination.
    assert_eq!(env.progress.values(), vec![0.0, 0.5]);
}

#[test]
fn suspend_and_resume_complete_normally() {
    let env = TestEnv::new();
    let d0 = env.make_device(
        "system_b",
        "#!/bin/sh\n\
         echo \"global_progress 0.5\" >&3\n\
         sleep 1\n\
         echo \"global_progress 1.0\" >&3\n\
         exit 0\n",
    );

    let plan = env.plan(vec![env.partition("system", &d0)]);

    let mut runner = env.runner();
    let handle = runner.handle();

    let worker = thread::spawn(move || runner.perform(plan));

    assert!(wait_until(Duration::from_secs(10), || {
        env.progress.values().contains(&0.5)
    }));

    handle.suspend();
    thread::sleep(Duration::from_millis(200));
    handle.resume();

    let code = worker.join().unwrap();
    assert_eq!(code, ErrorCode::Success);
    assert!(env.progress.values().contains(&1.0));
}
