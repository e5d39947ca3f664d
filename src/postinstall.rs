// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The postinstall runner. For each partition in the install plan it mounts
//! the freshly written filesystem read-only, runs the vendor postinstall
//! program with a status pipe for progress reporting, interprets the exit
//! code, and finally drives the boot-slot switch.
//!
//! The runner executes synchronously on its caller's thread. A cloneable
//! [`RunnerHandle`] delivers suspend/resume/terminate from other threads by
//! signalling the child process directly, so a suspend is observed before the
//! next progress line is produced.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    os::fd::{AsFd, AsRawFd, OwnedFd},
    os::unix::{
        fs::FileTypeExt,
        process::{CommandExt, ExitStatusExt},
    },
    path::{Component, Path, PathBuf},
    process::{Child, ChildStdout, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use rustix::{
    event::{poll, PollFd, PollFlags},
    fs::OFlags,
    pipe::pipe,
    process::{Pid, Signal},
};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::{
    boot::BootControl,
    dynamic::DynamicPartitionControl,
    errorcode::ErrorCode,
    hardware::Hardware,
    install_plan::{InstallPlan, Partition},
    osutil::{self, Mounter, RealMounter},
};

/// The file descriptor number from the postinstall program's perspective where
/// it can report status updates. This can be any number greater than 2
/// (stderr), but must be kept in sync with the vendor script contract.
pub const POSTINSTALL_STATUS_FD: i32 = 3;

/// Download URLs with this scheme carry the manifest bytes directly. Such
/// plans come from the external postinstall trigger rather than a full update.
pub const MANIFEST_BYTES_URL_PREFIX: &str = "manifest-bytes://";

/// Fixed mount point used when running as the device daemon.
const DEVICE_MOUNT_DIR: &str = "/postinstall";

const PROGRESS_CHUNK_SIZE: usize = 1024;
const POLL_INTERVAL_MS: i32 = 100;
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Receiver for aggregated progress in `[0, 1]`.
pub trait ProgressDelegate: Send + Sync {
    fn progress_update(&self, progress: f64);
}

struct RunnerControl {
    cancel: AtomicBool,
    suspended: AtomicBool,
    child_pid: Mutex<Option<Pid>>,
}

impl RunnerControl {
    fn signal_child(&self, signal: Signal) -> bool {
        let pid = self.child_pid.lock().unwrap();

        if let Some(pid) = *pid {
            match rustix::process::kill_process(pid, signal) {
                Ok(()) => return true,
                Err(e) => warn!("Couldn't signal child process {pid:?}: {e}"),
            }
        }

        false
    }
}

/// Control surface for a running [`PostinstallRunner`]. All operations are
/// safe to call from any thread and are no-ops when no child is running.
#[derive(Clone)]
pub struct RunnerHandle {
    control: Arc<RunnerControl>,
}

impl RunnerHandle {
    /// Stop the current child. Takes effect before the child produces another
    /// progress line.
    pub fn suspend(&self) {
        if self.control.signal_child(Signal::Stop) {
            self.control.suspended.store(true, Ordering::SeqCst);
        }
    }

    pub fn resume(&self) {
        if self.control.signal_child(Signal::Cont) {
            self.control.suspended.store(false, Ordering::SeqCst);
        }
    }

    /// Abort the run. The current child receives SIGTERM; a suspended child is
    /// continued afterward so it can observe the signal. No further progress
    /// is reported once termination is requested.
    pub fn terminate(&self) {
        self.control.cancel.store(true, Ordering::SeqCst);
        self.control.signal_child(Signal::Term);

        if self.control.suspended.swap(false, Ordering::SeqCst) {
            self.control.signal_child(Signal::Cont);
        }
    }
}

pub struct PostinstallRunner {
    boot_control: Arc<dyn BootControl>,
    hardware: Arc<dyn Hardware>,
    dynamic_control: Arc<dyn DynamicPartitionControl>,
    mounter: Arc<dyn Mounter>,
    delegate: Option<Arc<dyn ProgressDelegate>>,
    fs_mount_dir: PathBuf,
    // Host mode only; removing the TempDir deletes the mount point.
    _temp_dir: Option<TempDir>,
    control: Arc<RunnerControl>,

    plan: InstallPlan,
    current_partition: usize,
    partition_weight: Vec<u32>,
    total_weight: u32,
    accumulated_weight: u32,
    powerwash_scheduled: bool,
}

impl PostinstallRunner {
    /// Create a runner using the real mount syscalls. The mount point is the
    /// fixed daemon location when it exists, otherwise a fresh temporary
    /// directory that is deleted when the runner is dropped.
    pub fn new(
        boot_control: Arc<dyn BootControl>,
        hardware: Arc<dyn Hardware>,
        dynamic_control: Arc<dyn DynamicPartitionControl>,
    ) -> io::Result<Self> {
        let (fs_mount_dir, temp_dir) = if Path::new(DEVICE_MOUNT_DIR).is_dir() {
            (PathBuf::from(DEVICE_MOUNT_DIR), None)
        } else {
            let temp_dir = TempDir::with_prefix("au_postint_mount.")?;
            (temp_dir.path().to_owned(), Some(temp_dir))
        };

        Ok(Self::with_environment(
            boot_control,
            hardware,
            dynamic_control,
            Arc::new(RealMounter),
            fs_mount_dir,
            temp_dir,
        ))
    }

    /// Create a runner with an explicit mounter and mount point. This is the
    /// injection seam used by tests.
    pub fn with_mounter(
        boot_control: Arc<dyn BootControl>,
        hardware: Arc<dyn Hardware>,
        dynamic_control: Arc<dyn DynamicPartitionControl>,
        mounter: Arc<dyn Mounter>,
        fs_mount_dir: PathBuf,
    ) -> Self {
        Self::with_environment(boot_control, hardware, dynamic_control, mounter, fs_mount_dir, None)
    }

    fn with_environment(
        boot_control: Arc<dyn BootControl>,
        hardware: Arc<dyn Hardware>,
        dynamic_control: Arc<dyn DynamicPartitionControl>,
        mounter: Arc<dyn Mounter>,
        fs_mount_dir: PathBuf,
        temp_dir: Option<TempDir>,
    ) -> Self {
        Self {
            boot_control,
            hardware,
            dynamic_control,
            mounter,
            delegate: None,
            fs_mount_dir,
            _temp_dir: temp_dir,
            control: Arc::new(RunnerControl {
                cancel: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                child_pid: Mutex::new(None),
            }),
            plan: InstallPlan::default(),
            current_partition: 0,
            partition_weight: vec![],
            total_weight: 0,
            accumulated_weight: 0,
            powerwash_scheduled: false,
        }
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn ProgressDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            control: self.control.clone(),
        }
    }

    /// Run the postinstall steps for every partition in the plan and, on full
    /// success, commit the slot switch. Returns the single terminal code for
    /// the whole action.
    pub fn perform(&mut self, plan: InstallPlan) -> ErrorCode {
        info!("postinstall mount point: {:?}", self.fs_mount_dir);

        self.plan = plan;
        self.current_partition = 0;
        self.accumulated_weight = 0;
        self.powerwash_scheduled = false;

        self.ensure_unmounted();

        let code = self.perform_inner();
        self.complete(code)
    }

    fn perform_inner(&mut self) -> ErrorCode {
        // Switching slots requires finish_update(), which requires all
        // partitions to be mapped.
        if !self.plan.partitions.is_empty() || self.plan.switch_slot_on_reboot {
            if !self.dynamic_control.map_all_partitions() {
                error!("Failed to map all partitions; this would cause the update to fail later, aborting early");
                return ErrorCode::PostInstallMountError;
            }
        }

        if self.plan.powerwash_required {
            if self.hardware.schedule_powerwash() {
                self.powerwash_scheduled = true;
            } else {
                return ErrorCode::PostinstallPowerwashError;
            }
        }

        let run_post_install = self.plan.run_post_install;
        for partition in &mut self.plan.partitions {
            if !run_post_install && partition.postinstall_optional {
                partition.run_postinstall = false;
                info!(
                    "Skipping optional post-install for partition {} according to install plan",
                    partition.name,
                );
            }
        }

        self.partition_weight = self
            .plan
            .partitions
            .iter()
            .map(|p| u32::from(p.run_postinstall))
            .collect();
        self.total_weight = self.partition_weight.iter().sum();
        self.accumulated_weight = 0;
        self.report_progress(0.0);

        self.run_partitions()
    }

    fn run_partitions(&mut self) -> ErrorCode {
        if self.plan.download_url.is_empty() {
            info!("Skipping post-install");
            return ErrorCode::Success;
        }

        loop {
            if self.control.cancel.load(Ordering::SeqCst) {
                return ErrorCode::UserCanceled;
            }

            if self.current_partition >= self.plan.partitions.len() {
                return ErrorCode::Success;
            }

            let partition = self.plan.partitions[self.current_partition].clone();

            if !partition.run_postinstall {
                debug!("Skipping post-install on partition {}", partition.name);

                // Still mount a partition that has a postinstall program
                // configured. A device that fails to mount here would likely
                // fail to mount during boot as well, so catch it early.
                if !partition.postinstall_path.is_empty() {
                    if !self.mount_partition(&partition) {
                        return ErrorCode::PostInstallMountError;
                    }
                    self.log_build_info();

                    if let Err(e) = self.mounter.unmount(&self.fs_mount_dir) {
                        error!(
                            "Error unmounting the device {:?}: {e}",
                            partition.readonly_target_path,
                        );
                        if let Some(code) = self.finish_partition(&partition, 1) {
                            return code;
                        }
                        continue;
                    }
                }

                self.current_partition += 1;
                continue;
            }

            match self.run_one_partition(&partition) {
                Ok(return_code) => {
                    if let Some(code) = self.finish_partition(&partition, return_code) {
                        return code;
                    }
                }
                Err(code) => return code,
            }
        }
    }

    /// Mount, validate, and run one partition's postinstall program. Returns
    /// the child's exit code, or the terminal error for the whole action.
    fn run_one_partition(&mut self, partition: &Partition) -> Result<i32, ErrorCode> {
        if !self.mount_partition(partition) {
            return Err(ErrorCode::PostInstallMountError);
        }
        self.log_build_info();

        let postinstall_path = Path::new(&partition.postinstall_path);
        if postinstall_path.is_absolute() {
            error!(
                "Invalid absolute path passed to postinstall, use a relative path instead: {}",
                partition.postinstall_path,
            );
            self.cleanup_partition();
            return Err(ErrorCode::PostinstallRunnerError);
        }

        let abs_path = self.fs_mount_dir.join(postinstall_path);
        let escapes_mount_dir = postinstall_path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes_mount_dir || !abs_path.starts_with(&self.fs_mount_dir) {
            error!(
                "Invalid relative postinstall path: {}",
                partition.postinstall_path,
            );
            self.cleanup_partition();
            return Err(ErrorCode::PostinstallRunnerError);
        }

        info!(
            "Performing postinst ({} at {:?}) installed on mountable device {:?}",
            partition.postinstall_path, abs_path, partition.readonly_target_path,
        );

        let return_code = self.run_child(&abs_path);
        self.cleanup_partition();
        return_code
    }

    fn run_child(&mut self, abs_path: &Path) -> Result<i32, ErrorCode> {
        let (status_read, status_write) = match pipe() {
            Ok(fds) => fds,
            Err(e) => {
                error!("Failed to create postinstall status pipe: {e}");
                return Ok(1);
            }
        };

        let mut command = Command::new(abs_path);
        command.arg(self.plan.target_slot.to_string());
        command.arg(POSTINSTALL_STATUS_FD.to_string());
        // Tell the script when it runs for a lone partition outside a
        // slot-switching update: that plan came from the external postinstall
        // trigger and some scripts behave differently there.
        if self.plan.partitions.len() == 1
            && !self.plan.switch_slot_on_reboot
            && self.plan.download_url.starts_with(MANIFEST_BYTES_URL_PREFIX)
        {
            command.arg("1");
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());

        let status_raw = status_write.as_raw_fd();
        // SAFETY: dup2 is async-signal-safe and only fd numbers are touched.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(status_raw, POSTINSTALL_STATUS_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                // Merge stderr into the captured stdout stream.
                if libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Postinstall didn't launch: {e}");
                return Ok(1);
            }
        };
        drop(status_write);

        if let Err(e) = set_nonblocking(&status_read) {
            warn!("Unable to set non-blocking I/O mode on the status fd: {e}");
        }
        let stdout = child.stdout.take();
        if let Some(fd) = &stdout {
            if let Err(e) = set_nonblocking(fd) {
                warn!("Unable to set non-blocking I/O mode on child stdout: {e}");
            }
        }

        *self.control.child_pid.lock().unwrap() = Some(Pid::from_child(&child));
        let result = self.watch_child(&mut child, status_read, stdout);
        *self.control.child_pid.lock().unwrap() = None;

        result
    }

    /// Multiplex the status pipe and the merged output stream until the child
    /// exits and both streams reach EOF.
    fn watch_child(
        &mut self,
        child: &mut Child,
        status_fd: OwnedFd,
        stdout: Option<ChildStdout>,
    ) -> Result<i32, ErrorCode> {
        let mut status_fd = Some(status_fd);
        let mut stdout = stdout;
        let mut progress_buffer = String::new();
        let mut output = Vec::new();
        let mut exit_status: Option<ExitStatus> = None;

        loop {
            if self.control.cancel.load(Ordering::SeqCst) {
                reap_terminated_child(child);
                log_child_output(&output);
                return Err(ErrorCode::UserCanceled);
            }

            {
                let mut fds = Vec::with_capacity(2);
                if let Some(fd) = &status_fd {
                    fds.push(PollFd::new(fd, PollFlags::IN));
                }
                if let Some(fd) = &stdout {
                    fds.push(PollFd::new(fd, PollFlags::IN));
                }

                if !fds.is_empty() {
                    if let Err(e) = poll(&mut fds, POLL_INTERVAL_MS) {
                        if e != rustix::io::Errno::INTR {
                            warn!("Failed to poll postinstall child descriptors: {e}");
                        }
                    }
                } else if exit_status.is_none() {
                    thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
                }
            }

            if let Some(fd) = &status_fd {
                match self.drain_status_fd(fd, &mut progress_buffer) {
                    Ok(true) => {}
                    Ok(false) => status_fd = None,
                    Err(e) => {
                        warn!("Error reading from the postinstall status fd: {e}");
                        status_fd = None;
                    }
                }
            }

            if let Some(fd) = &stdout {
                match drain_output_fd(fd, &mut output) {
                    Ok(true) => {}
                    Ok(false) => stdout = None,
                    Err(e) => {
                        warn!("Error reading postinstall output: {e}");
                        stdout = None;
                    }
                }
            }

            if exit_status.is_none() {
                match child.try_wait() {
                    Ok(Some(status)) => exit_status = Some(status),
                    Ok(None) => {}
                    Err(e) => {
                        error!("Failed to wait for the postinstall child: {e}");
                        let _ = child.kill();
                        let _ = child.wait();
                        log_child_output(&output);
                        return Ok(1);
                    }
                }
            }

            if exit_status.is_some() && status_fd.is_none() && stdout.is_none() {
                break;
            }
        }

        log_child_output(&output);

        // The loop only breaks once the child has been reaped.
        let Some(status) = exit_status else {
            return Ok(1);
        };
        Ok(exit_code(status))
    }

    /// Drain the non-blocking status descriptor, handing every complete line
    /// to the progress parser and keeping the trailing fragment buffered.
    /// Returns whether the descriptor is still open.
    fn drain_status_fd(&self, fd: &OwnedFd, buffer: &mut String) -> io::Result<bool> {
        loop {
            let mut chunk = [0u8; PROGRESS_CHUNK_SIZE];
            let result = osutil::read_all(fd, &mut chunk)?;

            buffer.push_str(&String::from_utf8_lossy(&chunk[..result.bytes_read]));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();

                if !self.control.cancel.load(Ordering::SeqCst) {
                    self.process_progress_line(line.trim_end_matches('\n'));
                }
            }

            if result.eof {
                return Ok(false);
            }
            if result.bytes_read == 0 {
                return Ok(true);
            }
        }
    }

    /// Recognize `global_progress <fraction>`. All other lines are ignored.
    fn process_progress_line(&self, line: &str) -> bool {
        if let Some(rest) = line.strip_prefix("global_progress") {
            if rest.starts_with(char::is_whitespace) {
                if let Some(token) = rest.split_whitespace().next() {
                    if let Ok(frac) = token.parse::<f64>() {
                        if !frac.is_nan() {
                            self.report_progress(frac);
                            return true;
                        }
                    }
                }
            }
        }

        false
    }

    /// Report the weighted outer progress for a per-partition fraction.
    fn report_progress(&self, mut frac: f64) {
        let Some(delegate) = &self.delegate else {
            return;
        };

        if self.current_partition >= self.partition_weight.len() || self.total_weight == 0 {
            delegate.progress_update(1.0);
            return;
        }

        if !frac.is_finite() || frac < 0.0 {
            frac = 0.0;
        }
        if frac > 1.0 {
            frac = 1.0;
        }

        let progress = (f64::from(self.accumulated_weight)
            + f64::from(self.partition_weight[self.current_partition]) * frac)
            / f64::from(self.total_weight);
        delegate.progress_update(progress);
    }

    /// Account for a finished partition step. Returns the terminal code when
    /// the failure aborts the whole action.
    fn finish_partition(&mut self, partition: &Partition, return_code: i32) -> Option<ErrorCode> {
        if return_code != 0 {
            error!("Postinst command failed with code: {return_code}");

            let mut error_code = ErrorCode::PostinstallRunnerError;
            if return_code == 3 {
                // The script tried to update the firmware but booted from FW
                // B; a reboot back to FW A is needed first.
                error_code = ErrorCode::PostinstallBootedFromFirmwareB;
            }
            if return_code == 4 {
                // The firmware's read-only section is not updatable.
                error_code = ErrorCode::PostinstallFirmwareRONotUpdatable;
            }

            if partition.postinstall_optional {
                info!("Ignoring postinstall failure since it is optional");
            } else {
                return Some(error_code);
            }
        }

        self.accumulated_weight += self.partition_weight[self.current_partition];
        self.current_partition += 1;
        self.report_progress(0.0);

        None
    }

    fn mount_partition(&self, partition: &Partition) -> bool {
        let mountable_device = &partition.readonly_target_path;
        if !mountable_device.exists() {
            error!(
                "Mountable device {mountable_device:?} for partition {} does not exist",
                partition.name,
            );
            return false;
        }

        if !self.fs_mount_dir.exists() {
            error!(
                "Mount point {:?} does not exist, mount call will fail",
                self.fs_mount_dir,
            );
            return false;
        }

        // The mount dir may hold residue from a previously crashed
        // postinstall step.
        self.ensure_unmounted();

        // The update just wrote to the target block device; flip it back to
        // read-only before handing it to the postinstall program.
        if is_block_device(mountable_device) {
            if let Err(e) = osutil::set_block_device_read_only(mountable_device, true) {
                error!("Marking block device {mountable_device:?} as read-only: {e}");
                return false;
            }
        }

        if let Err(e) = self.mounter.mount_ro(
            mountable_device,
            &self.fs_mount_dir,
            &partition.filesystem_type,
            &self.hardware.partition_mount_options(&partition.name),
        ) {
            error!(
                "Unable to mount {mountable_device:?} for partition {}: {e}",
                partition.name,
            );
            return false;
        }

        true
    }

    fn ensure_unmounted(&self) {
        if self.mounter.is_mountpoint(&self.fs_mount_dir) {
            info!("Found previously mounted filesystem at {:?}", self.fs_mount_dir);
            if let Err(e) = self.mounter.unmount(&self.fs_mount_dir) {
                warn!("Failed to unmount {:?}: {e}", self.fs_mount_dir);
            }
        }
    }

    fn cleanup_partition(&self) {
        if let Err(e) = self.mounter.unmount(&self.fs_mount_dir) {
            debug!("Unmounting {:?} failed: {e}", self.fs_mount_dir);
        }
    }

    /// Log the build fingerprint of the mounted partition, which helps debug
    /// postinstall programs that don't match the written image.
    fn log_build_info(&self) {
        for name in ["build.prop", "etc/build.prop", "system/build.prop"] {
            let path = self.fs_mount_dir.join(name);
            debug!("Trying to read {path:?}");

            let Ok(file) = File::open(&path) else {
                continue;
            };

            for line in BufReader::new(file).lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.contains("ro.build") {
                    info!("{line}");
                }
            }
        }
    }

    /// Finalize the action: commit the slot switch on success, undo the
    /// powerwash on failure, and release the mapped partitions.
    fn complete(&mut self, mut error_code: ErrorCode) -> ErrorCode {
        if error_code == ErrorCode::Success {
            if self.plan.switch_slot_on_reboot {
                if !self.dynamic_control.finish_update(self.plan.powerwash_required)
                    || !self.boot_control.set_active_boot_slot(self.plan.target_slot)
                {
                    error_code = ErrorCode::PostinstallRunnerError;
                } else {
                    // Schedules a warm reset on the next reboot; errors are
                    // ignored.
                    self.hardware.set_warm_reset(true);
                    // Pin the verified-boot state of the slot we boot into.
                    self.hardware.set_vbmeta_digest_for_inactive_slot(false);
                }
            } else {
                error_code = ErrorCode::UpdatedButNotActive;
            }
        }

        if !self.plan.partitions.is_empty() {
            self.dynamic_control.unmap_all_partitions();
            info!("Unmapped all partitions");
        }

        if error_code.is_non_failure() {
            info!("All post-install commands succeeded");
        } else {
            error!("Postinstall action failed: {error_code}");

            // Undo any changes done to trigger the powerwash.
            if self.powerwash_scheduled {
                self.hardware.cancel_powerwash();
                self.powerwash_scheduled = false;
            }
        }

        error_code
    }
}

fn set_nonblocking(fd: impl AsFd) -> io::Result<()> {
    let flags = rustix::fs::fcntl_getfl(&fd)?;
    rustix::fs::fcntl_setfl(&fd, flags | OFlags::NONBLOCK)?;
    Ok(())
}

fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

/// Drain a non-blocking output descriptor into `output`. Returns whether the
/// descriptor is still open.
fn drain_output_fd(fd: impl AsFd, output: &mut Vec<u8>) -> io::Result<bool> {
    loop {
        let mut chunk = [0u8; PROGRESS_CHUNK_SIZE];
        let result = osutil::read_all(&fd, &mut chunk)?;

        output.extend_from_slice(&chunk[..result.bytes_read]);

        if result.eof {
            return Ok(false);
        }
        if result.bytes_read == 0 {
            return Ok(true);
        }
    }
}

/// Wait for a child that was already told to terminate, forcing it after a
/// grace period.
fn reap_terminated_child(child: &mut Child) {
    let deadline = Instant::now() + TERMINATE_GRACE;

    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to wait for the terminated child: {e}");
                break;
            }
        }

        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn log_child_output(output: &[u8]) {
    for line in String::from_utf8_lossy(output).lines() {
        if !line.is_empty() {
            info!("postinstall: {line}");
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
