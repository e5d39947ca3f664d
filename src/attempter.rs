// SPDX-FileCopyrightText: 2024-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The coordinator exposed to the daemon service. It owns the update state
//! machine, validates payload metadata before anything else runs, and drives
//! the postinstall pipeline on a worker thread. Fetching the payload and
//! writing partition data are delegated to the out-of-scope collaborators
//! behind [`PartitionWriter`].

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use num_traits::ToPrimitive;
use ring::digest;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    boot::{BootControl, Slot, INVALID_SLOT},
    dynamic::DynamicPartitionControl,
    errorcode::ErrorCode,
    hardware::Hardware,
    install_plan::InstallPlan,
    osutil::{self, Mounter},
    payload::{
        metadata::PayloadMetadata,
        verify::{self, PayloadVerifier},
    },
    postinstall::{PostinstallRunner, ProgressDelegate},
    prefs::{keys, Prefs},
    protobuf::chromeos_update_engine::DeltaArchiveManifest,
    util,
};

/// Keys recognized in the `key=value` headers passed to
/// [`UpdateAttempter::apply_payload`].
pub mod headers {
    pub const FILE_HASH: &str = "FILE_HASH";
    pub const FILE_SIZE: &str = "FILE_SIZE";
    pub const METADATA_HASH: &str = "METADATA_HASH";
    pub const METADATA_SIZE: &str = "METADATA_SIZE";
    pub const POWERWASH: &str = "POWERWASH";
    pub const SWITCH_SLOT_ON_REBOOT: &str = "SWITCH_SLOT_ON_REBOOT";
    pub const RUN_POST_INSTALL: &str = "RUN_POST_INSTALL";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    Idle,
    UpdateAvailable,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    CleanupPreviousUpdate,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::UpdateAvailable => "UPDATE_AVAILABLE",
            Self::Verifying => "VERIFYING",
            Self::Finalizing => "FINALIZING",
            Self::UpdatedNeedReboot => "UPDATED_NEED_REBOOT",
            Self::CleanupPreviousUpdate => "CLEANUP_PREVIOUS_UPDATE",
        };
        f.write_str(name)
    }
}

/// Failure reported back over the service boundary.
#[derive(Debug, Error)]
#[error("{message} ({code})")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

fn service_error(code: ErrorCode, message: impl Into<String>) -> ServiceError {
    let message = message.into();
    error!("Replying with failure: {message}");
    ServiceError { code, message }
}

type Result<T> = std::result::Result<T, ServiceError>;

/// Receiver for daemon-visible state changes.
pub trait ServiceObserver: Send + Sync {
    fn status_update(&self, status: UpdateStatus, progress: f64);
    fn payload_application_complete(&self, code: ErrorCode);
}

/// The out-of-scope collaborator that streams the payload body and writes the
/// target partitions. Invoked after metadata verification and before
/// postinstall.
pub trait PartitionWriter: Send + Sync {
    fn write_partitions(
        &self,
        manifest: &DeltaArchiveManifest,
        plan: &InstallPlan,
    ) -> std::result::Result<(), ErrorCode>;
}

struct State {
    status: UpdateStatus,
    running: bool,
    runner_handle: Option<crate::postinstall::RunnerHandle>,
    worker: Option<JoinHandle<()>>,
    payload_fd: Option<OwnedFd>,
    last_powerwash_required: bool,
    cleanup_previous_code: Option<ErrorCode>,
}

pub struct UpdateAttempter {
    boot_control: Arc<dyn BootControl>,
    hardware: Arc<dyn Hardware>,
    dynamic_control: Arc<dyn DynamicPartitionControl>,
    prefs: Arc<dyn Prefs>,
    verifier: Arc<dyn PayloadVerifier>,
    partition_writer: Option<Arc<dyn PartitionWriter>>,
    mounter_override: Option<(Arc<dyn Mounter>, PathBuf)>,
    observers: Mutex<Vec<Arc<dyn ServiceObserver>>>,
    state: Arc<Mutex<State>>,
}

impl UpdateAttempter {
    pub fn new(
        boot_control: Arc<dyn BootControl>,
        hardware: Arc<dyn Hardware>,
        dynamic_control: Arc<dyn DynamicPartitionControl>,
        prefs: Arc<dyn Prefs>,
        verifier: Arc<dyn PayloadVerifier>,
    ) -> Self {
        Self {
            boot_control,
            hardware,
            dynamic_control,
            prefs,
            verifier,
            partition_writer: None,
            mounter_override: None,
            observers: Mutex::new(vec![]),
            state: Arc::new(Mutex::new(State {
                status: UpdateStatus::Idle,
                running: false,
                runner_handle: None,
                worker: None,
                payload_fd: None,
                last_powerwash_required: false,
                cleanup_previous_code: None,
            })),
        }
    }

    /// Install the collaborator that writes partition data. Without one, the
    /// pipeline assumes the partitions were already written.
    pub fn set_partition_writer(&mut self, writer: Arc<dyn PartitionWriter>) {
        self.partition_writer = Some(writer);
    }

    /// Route the postinstall runner's mounts through `mounter` at
    /// `fs_mount_dir` instead of the real mount syscalls. Test seam.
    pub fn set_mounter(&mut self, mounter: Arc<dyn Mounter>, fs_mount_dir: PathBuf) {
        self.mounter_override = Some((mounter, fs_mount_dir));
    }

    pub fn add_observer(&self, observer: Arc<dyn ServiceObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn status(&self) -> UpdateStatus {
        self.state.lock().unwrap().status
    }

    /// Restore state after a daemon restart: an update that finished on this
    /// boot still needs its reboot.
    pub fn init(&self) {
        if self.update_completed_on_this_boot() {
            info!("Updated but the system was not rebooted; resuming reboot-needed state");
            self.set_status(UpdateStatus::UpdatedNeedReboot);
        } else {
            self.set_status(UpdateStatus::Idle);
        }
    }

    /// Start applying a payload. Rejects when an update was already applied
    /// (waiting for reboot) or one is in flight.
    pub fn apply_payload(
        self: &Arc<Self>,
        payload_url: &str,
        payload_offset: u64,
        payload_size: u64,
        key_value_pair_headers: &[String],
    ) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.status == UpdateStatus::UpdatedNeedReboot {
                return Err(service_error(
                    ErrorCode::UpdateAlreadyInstalled,
                    "An update already applied, waiting for reboot",
                ));
            }
            if state.running {
                return Err(service_error(
                    ErrorCode::UpdateProcessing,
                    "Already processing an update, cancel it first.",
                ));
            }
        }

        let headers = parse_key_value_headers(key_value_pair_headers)?;

        // Unique identifier for the payload. Empty means it can't be resumed.
        let payload_id = format!(
            "{}{}",
            headers.get(headers::FILE_HASH).map(String::as_str).unwrap_or(""),
            headers.get(headers::METADATA_HASH).map(String::as_str).unwrap_or(""),
        );

        let path = self.resolve_payload_path(payload_url)?;

        let mut plan = InstallPlan {
            download_url: payload_url.to_owned(),
            ..Default::default()
        };
        plan.source_slot = self.boot_control.current_slot();
        plan.target_slot = self.target_slot();
        if plan.target_slot == INVALID_SLOT {
            return Err(service_error(
                ErrorCode::Error,
                "Device does not have enough slots to apply an update",
            ));
        }

        plan.powerwash_required = header_as_bool(headers.get(headers::POWERWASH), false);
        plan.switch_slot_on_reboot =
            header_as_bool(headers.get(headers::SWITCH_SLOT_ON_REBOOT), true);
        plan.run_post_install = header_as_bool(headers.get(headers::RUN_POST_INSTALL), true);

        plan.is_resume = !payload_id.is_empty()
            && self.prefs.get_string(keys::UPDATE_CHECK_RESPONSE_HASH).as_deref()
                == Some(payload_id.as_str());
        if !plan.is_resume {
            info!(
                "Starting a new update {payload_url} size: {:?} offset: {payload_offset}",
                util::NumBytes(payload_size),
            );
            if !self.prefs.set_string(keys::UPDATE_CHECK_RESPONSE_HASH, &payload_id) {
                warn!("Unable to save the update check response hash");
            }
            self.prefs.delete(keys::POST_INSTALL_SUCCEEDED);
        }

        let expected_metadata_hash = headers
            .get(headers::METADATA_HASH)
            .map(|value| {
                STANDARD.decode(value).unwrap_or_else(|e| {
                    warn!("Unable to decode base64 metadata hash: {e}");
                    vec![]
                })
            })
            .unwrap_or_default();

        let manifest = self.verify_payload_parse_manifest(&path, &expected_metadata_hash)?;

        plan.parse_partitions(&manifest, self.boot_control.as_ref())
            .map_err(|code| {
                service_error(code, "Failed to load partition info from the manifest")
            })?;

        info!("Using this install plan:");
        plan.dump();

        self.set_status(UpdateStatus::UpdateAvailable);
        self.start_worker(plan, Some(manifest), true);

        Ok(())
    }

    /// [`Self::apply_payload`] variant taking an already-open payload file.
    pub fn apply_payload_fd(
        self: &Arc<Self>,
        fd: BorrowedFd,
        payload_offset: u64,
        payload_size: u64,
        key_value_pair_headers: &[String],
    ) -> Result<()> {
        // State must be checked before the descriptor is stored, otherwise an
        // already-running update would have its payload closed underneath it.
        {
            let state = self.state.lock().unwrap();
            if state.status == UpdateStatus::UpdatedNeedReboot {
                return Err(service_error(
                    ErrorCode::UpdateAlreadyInstalled,
                    "An update already applied, waiting for reboot",
                ));
            }
            if state.running {
                return Err(service_error(
                    ErrorCode::UpdateProcessing,
                    "Already processing an update, cancel it first.",
                ));
            }
        }

        let owned = rustix::io::dup(fd)
            .map_err(|e| service_error(ErrorCode::Error, format!("Failed to dup payload fd: {e}")))?;
        let payload_url = format!("fd://{}", owned.as_raw_fd());

        self.state.lock().unwrap().payload_fd = Some(owned);

        let result =
            self.apply_payload(&payload_url, payload_offset, payload_size, key_value_pair_headers);
        if result.is_err() {
            self.state.lock().unwrap().payload_fd = None;
        }

        result
    }

    pub fn suspend_update(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.running {
            return Err(service_error(ErrorCode::Error, "No ongoing update to suspend."));
        }
        if let Some(handle) = &state.runner_handle {
            handle.suspend();
        }
        Ok(())
    }

    pub fn resume_update(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.running {
            return Err(service_error(ErrorCode::Error, "No ongoing update to resume."));
        }
        if let Some(handle) = &state.runner_handle {
            handle.resume();
        }
        Ok(())
    }

    pub fn cancel_update(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.status == UpdateStatus::CleanupPreviousUpdate {
            return Err(service_error(
                ErrorCode::RollbackNotPossible,
                "Cleanup of the previous update is running and cannot be canceled; it performs \
                 critical merge operations after reboot",
            ));
        }
        if !state.running {
            return Err(service_error(ErrorCode::Error, "No ongoing update to cancel."));
        }
        if let Some(handle) = &state.runner_handle {
            handle.terminate();
        }
        Ok(())
    }

    /// Return to idle, deleting an applied-but-not-booted update if present.
    pub fn reset_status(&self) -> Result<()> {
        let status = {
            let state = self.state.lock().unwrap();
            if state.running {
                return Err(service_error(
                    ErrorCode::Error,
                    "Already processing an update, cancel it first.",
                ));
            }
            state.status
        };

        info!("Attempting to reset state from {status} to IDLE");

        match status {
            UpdateStatus::Idle | UpdateStatus::UpdatedNeedReboot => {
                if !self.clear_update_completed_marker() {
                    return Err(service_error(
                        ErrorCode::Error,
                        "Failed to reset the status because the completion marker could not be \
                         cleared",
                    ));
                }

                if status == UpdateStatus::UpdatedNeedReboot {
                    self.reset_should_switch_slot_on_reboot()?;
                    info!("Slot switch reset successful");
                }

                self.set_status(UpdateStatus::Idle);
                Ok(())
            }
            _ => Err(service_error(
                ErrorCode::Error,
                "Status reset not allowed in this state, cancel the ongoing OTA first",
            )),
        }
    }

    /// Stateless check that the payload's source partitions match this device:
    /// every operation carrying a source hash is verified against the current
    /// slot's block devices.
    pub fn verify_payload_applicable(&self, metadata_path: &Path) -> Result<()> {
        let manifest = self.verify_payload_parse_manifest(metadata_path, &[])?;

        let current_slot = self.boot_control.current_slot();
        if current_slot == INVALID_SLOT {
            return Err(service_error(
                ErrorCode::DownloadStateInitializationError,
                "Failed to get the current slot",
            ));
        }

        let block_size = u64::from(manifest.block_size);

        for partition in &manifest.partitions {
            if partition.old_partition_info.is_none() {
                continue;
            }

            let device = self
                .boot_control
                .partition_device(&partition.partition_name, current_slot, current_slot, false)
                .ok_or_else(|| {
                    service_error(
                        ErrorCode::Error,
                        format!(
                            "Failed to get partition device for {}",
                            partition.partition_name,
                        ),
                    )
                })?;

            let file = File::open(&device.readonly_device_path).map_err(|e| {
                service_error(
                    ErrorCode::Error,
                    format!("Failed to open {:?}: {e}", device.readonly_device_path),
                )
            })?;

            for operation in &partition.operations {
                let Some(expected_hash) = &operation.src_sha256_hash else {
                    continue;
                };

                let mut context = digest::Context::new(&digest::SHA256);

                for extent in &operation.src_extents {
                    let offset = extent
                        .start_block
                        .unwrap_or(0)
                        .checked_mul(block_size)
                        .ok_or_else(|| {
                            service_error(ErrorCode::Error, "Source extent offset overflows")
                        })?;
                    let length = extent
                        .num_blocks
                        .unwrap_or(0)
                        .checked_mul(block_size)
                        .ok_or_else(|| {
                            service_error(ErrorCode::Error, "Source extent length overflows")
                        })?;

                    hash_device_range(&file, offset, length, &mut context).map_err(|e| {
                        service_error(
                            ErrorCode::Error,
                            format!("Failed to hash {:?}: {e}", device.readonly_device_path),
                        )
                    })?;
                }

                if context.finish().as_ref() != expected_hash.as_slice() {
                    return Err(service_error(
                        ErrorCode::DownloadOperationHashMismatch,
                        format!(
                            "Source hash mismatch for partition {}",
                            partition.partition_name,
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Commit the slot-switch intent for an update that was applied with
    /// `SWITCH_SLOT_ON_REBOOT=0`.
    pub fn set_should_switch_slot_on_reboot(self: &Arc<Self>, metadata_path: &Path) -> Result<()> {
        info!("set_should_switch_slot_on_reboot({metadata_path:?})");

        {
            let state = self.state.lock().unwrap();
            if state.running {
                return Err(service_error(
                    ErrorCode::Error,
                    "Already processing an update, cancel it first.",
                ));
            }
        }

        let manifest = self.verify_payload_parse_manifest(metadata_path, &[])?;

        let mut plan = InstallPlan {
            source_slot: self.boot_control.current_slot(),
            target_slot: self.target_slot(),
            // The postinstall steps already ran when the payload was applied;
            // an empty download URL makes the runner skip them and only
            // perform the slot switch.
            run_post_install: false,
            is_resume: true,
            switch_slot_on_reboot: true,
            // A previous apply_payload() may have requested a powerwash;
            // inherit that setting.
            powerwash_required: self.state.lock().unwrap().last_powerwash_required,
            ..Default::default()
        };

        if plan.source_slot == INVALID_SLOT || plan.target_slot == INVALID_SLOT {
            return Err(service_error(ErrorCode::Error, "Invalid source or target slot"));
        }

        plan.parse_partitions(&manifest, self.boot_control.as_ref())
            .map_err(|code| {
                service_error(code, "Failed to load partition info from the manifest")
            })?;

        self.set_status(UpdateStatus::Finalizing);
        self.start_worker(plan, None, false);

        Ok(())
    }

    /// Revoke the slot-switch intent without cancelling the applied update.
    pub fn reset_should_switch_slot_on_reboot(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.running {
                return Err(service_error(
                    ErrorCode::Error,
                    "Already processing an update, cancel it first.",
                ));
            }
        }

        if !self.clear_update_completed_marker() {
            return Err(service_error(
                ErrorCode::Error,
                "Failed to clear the update completion marker",
            ));
        }

        let current_slot = self.boot_control.current_slot();
        if !self.boot_control.set_active_boot_slot(current_slot) {
            return Err(service_error(ErrorCode::Error, "Failed to set the active boot slot"));
        }

        // Marking the slot active again may have reset its successful flag;
        // restore it. The result of the marking itself is ignored.
        if !self
            .boot_control
            .mark_boot_successful_async(Box::new(|_| {}))
        {
            return Err(service_error(
                ErrorCode::Error,
                "Failed to mark the current boot successful",
            ));
        }

        // We're no longer switching slots.
        self.hardware.set_warm_reset(false);
        self.hardware.set_vbmeta_digest_for_inactive_slot(true);

        info!("Slot switch cancelled.");
        self.set_status(UpdateStatus::Idle);

        Ok(())
    }

    /// Preallocate target-slot space for the payload. Returns 0 on success or
    /// the total number of bytes required when space is insufficient. May
    /// block for minutes.
    pub fn allocate_space_for_payload(
        &self,
        metadata_path: &Path,
        key_value_pair_headers: &[String],
    ) -> Result<u64> {
        let headers = parse_key_value_headers(key_value_pair_headers)?;

        let expected_metadata_hash = headers
            .get(headers::METADATA_HASH)
            .map(|value| STANDARD.decode(value).unwrap_or_default())
            .unwrap_or_default();

        let manifest = self.verify_payload_parse_manifest(metadata_path, &expected_metadata_hash)?;

        let mut required_size = 0u64;
        if !self.dynamic_control.prepare_partitions_for_update(
            self.boot_control.current_slot(),
            self.target_slot(),
            &manifest,
            true,
            &mut required_size,
        ) {
            if required_size == 0 {
                return Err(service_error(
                    ErrorCode::Error,
                    "Failed to allocate space for payload.",
                ));
            }
            error!("Insufficient space for payload: {required_size} bytes");
            return Ok(required_size);
        }

        info!("Successfully allocated space for payload.");
        Ok(0)
    }

    /// Finish the bookkeeping for the previous (successfully booted) update.
    /// Fire-and-forget; the callback receives the completion code, immediately
    /// when a previous call already finished.
    pub fn cleanup_successful_update(
        self: &Arc<Self>,
        callback: Box<dyn FnOnce(ErrorCode) + Send>,
    ) {
        {
            let state = self.state.lock().unwrap();
            if let Some(code) = state.cleanup_previous_code {
                info!("Cleanup of the previous update already completed with {code}");
                drop(state);
                callback(code);
                return;
            }
        }

        let attempter = self.clone();

        thread::spawn(move || {
            let was_idle = {
                let mut state = attempter.state.lock().unwrap();
                if state.status == UpdateStatus::Idle {
                    state.status = UpdateStatus::CleanupPreviousUpdate;
                    true
                } else {
                    false
                }
            };
            if was_idle {
                attempter.broadcast_status(0.0);
            }

            // A slot that is already marked successful has no previous update
            // to finish; the callback still fires, with a distinct code.
            let current_slot = attempter.boot_control.current_slot();
            let already_successful = attempter
                .boot_control
                .is_slot_marked_successful(current_slot);

            let (tx, rx) = mpsc::channel();
            let scheduled = attempter
                .boot_control
                .mark_boot_successful_async(Box::new(move |ok| {
                    let _ = tx.send(ok);
                }));
            let ok = scheduled && rx.recv().unwrap_or(false);

            let code = if !ok {
                ErrorCode::Error
            } else if already_successful {
                info!("No previous update to clean up");
                ErrorCode::NoUpdate
            } else {
                ErrorCode::Success
            };
            attempter.state.lock().unwrap().cleanup_previous_code = Some(code);

            if was_idle {
                attempter.set_status(UpdateStatus::Idle);
            }

            callback(code);
        });
    }

    /// Block until the in-flight worker (if any) finishes.
    pub fn wait_for_completion(&self) {
        let worker = self.state.lock().unwrap().worker.take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
    }

    fn start_worker(
        self: &Arc<Self>,
        plan: InstallPlan,
        manifest: Option<DeltaArchiveManifest>,
        write_partitions: bool,
    ) {
        let mut runner = match self.make_runner() {
            Ok(runner) => runner,
            Err(e) => {
                error!("Failed to set up the postinstall environment: {e}");
                self.on_completion(ErrorCode::PostinstallRunnerError);
                return;
            }
        };

        let handle = runner.handle();
        let attempter = self.clone();

        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.runner_handle = Some(handle);
        state.last_powerwash_required = plan.powerwash_required;
        state.worker = Some(thread::spawn(move || {
            let code = attempter.run_pipeline(runner, plan, manifest, write_partitions);
            attempter.on_completion(code);
        }));
    }

    fn run_pipeline(
        &self,
        mut runner: PostinstallRunner,
        plan: InstallPlan,
        manifest: Option<DeltaArchiveManifest>,
        write_partitions: bool,
    ) -> ErrorCode {
        if write_partitions {
            if let (Some(writer), Some(manifest)) = (&self.partition_writer, &manifest) {
                self.set_status(UpdateStatus::Verifying);
                if let Err(code) = writer.write_partitions(manifest, &plan) {
                    return code;
                }
            }
            self.set_status(UpdateStatus::Finalizing);
        }

        runner.perform(plan)
    }

    fn on_completion(&self, code: ErrorCode) {
        {
            let mut state = self.state.lock().unwrap();
            state.running = false;
            state.runner_handle = None;
            state.payload_fd = None;
        }

        match code {
            ErrorCode::Success => {
                if !self.write_update_completed_marker() {
                    error!("Failed to write update completion marker");
                }
                self.prefs.set_boolean(keys::POST_INSTALL_SUCCEEDED, true);
                info!("Update successfully applied, waiting to reboot.");
                self.set_status(UpdateStatus::UpdatedNeedReboot);
            }
            ErrorCode::UpdatedButNotActive => {
                self.prefs.set_boolean(keys::POST_INSTALL_SUCCEEDED, true);
                self.set_status(UpdateStatus::Idle);
            }
            _ => {
                self.set_status(UpdateStatus::Idle);
            }
        }

        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.payload_application_complete(code);
        }
    }

    fn make_runner(self: &Arc<Self>) -> io::Result<PostinstallRunner> {
        let mut runner = match &self.mounter_override {
            Some((mounter, fs_mount_dir)) => PostinstallRunner::with_mounter(
                self.boot_control.clone(),
                self.hardware.clone(),
                self.dynamic_control.clone(),
                mounter.clone(),
                fs_mount_dir.clone(),
            ),
            None => PostinstallRunner::new(
                self.boot_control.clone(),
                self.hardware.clone(),
                self.dynamic_control.clone(),
            )?,
        };

        runner.set_delegate(Arc::new(ProgressForwarder {
            attempter: self.clone(),
        }));

        Ok(runner)
    }

    /// Read, size-check, and signature-verify the payload metadata, then
    /// decode the manifest. `expected_metadata_hash` is checked when
    /// non-empty.
    fn verify_payload_parse_manifest(
        &self,
        metadata_path: &Path,
        expected_metadata_hash: &[u8],
    ) -> Result<DeltaArchiveManifest> {
        let (metadata, region) = PayloadMetadata::read_from_file(metadata_path).map_err(|e| {
            service_error(
                e.error_code(),
                format!("Failed to parse payload metadata from {metadata_path:?}: {e}"),
            )
        })?;

        let metadata_size = metadata
            .metadata_size()
            .to_usize()
            .ok_or_else(|| service_error(ErrorCode::DownloadManifestParseError, "Metadata too large"))?;

        if !expected_metadata_hash.is_empty() {
            let metadata_hash = digest::digest(&digest::SHA256, &region[..metadata_size]);
            if metadata_hash.as_ref() != expected_metadata_hash {
                return Err(service_error(
                    ErrorCode::DownloadManifestParseError,
                    format!(
                        "Metadata hash mismatch. Expected hash: {}, actual hash: {}",
                        hex::encode(expected_metadata_hash),
                        hex::encode(metadata_hash),
                    ),
                ));
            }
            info!("Payload metadata hash check passed: {}", hex::encode(metadata_hash));
        }

        let code =
            verify::validate_metadata_signature(&metadata, &region, "", self.verifier.as_ref());
        if code != ErrorCode::Success {
            return Err(service_error(
                code,
                format!("Failed to validate metadata signature: {code}"),
            ));
        }

        metadata.get_manifest(&region).map_err(|e| {
            service_error(
                ErrorCode::DownloadManifestParseError,
                format!("Failed to parse manifest: {e}"),
            )
        })
    }

    fn resolve_payload_path(&self, payload_url: &str) -> Result<PathBuf> {
        if let Some(path) = payload_url.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some(raw_fd) = payload_url.strip_prefix("fd://") {
            return Ok(PathBuf::from(format!("/proc/self/fd/{raw_fd}")));
        }
        if payload_url.starts_with('/') {
            return Ok(PathBuf::from(payload_url));
        }

        Err(service_error(
            ErrorCode::Error,
            format!("Unsupported payload URL: {payload_url}"),
        ))
    }

    /// The inactive slot an update would be written to.
    fn target_slot(&self) -> Slot {
        let num_slots = self.boot_control.num_slots();
        if num_slots < 2 {
            return INVALID_SLOT;
        }
        (self.boot_control.current_slot() + 1) % num_slots
    }

    fn update_completed_on_this_boot(&self) -> bool {
        let Some(marker_boot_id) = self.prefs.get_string(keys::UPDATE_COMPLETED_ON_BOOT_ID)
        else {
            return false;
        };

        match osutil::boot_id() {
            Ok(boot_id) => marker_boot_id == boot_id,
            Err(e) => {
                warn!("Unable to read the current boot id: {e}");
                false
            }
        }
    }

    fn write_update_completed_marker(&self) -> bool {
        match osutil::boot_id() {
            Ok(boot_id) => self
                .prefs
                .set_string(keys::UPDATE_COMPLETED_ON_BOOT_ID, &boot_id),
            Err(e) => {
                error!("Unable to read the current boot id: {e}");
                false
            }
        }
    }

    fn clear_update_completed_marker(&self) -> bool {
        self.prefs.delete(keys::UPDATE_COMPLETED_ON_BOOT_ID)
    }

    fn set_status(&self, status: UpdateStatus) {
        self.state.lock().unwrap().status = status;
        self.broadcast_status(0.0);
    }

    fn broadcast_status(&self, progress: f64) {
        let status = self.state.lock().unwrap().status;
        let observers = self.observers.lock().unwrap().clone();

        for observer in observers {
            observer.status_update(status, progress);
        }
    }
}

struct ProgressForwarder {
    attempter: Arc<UpdateAttempter>,
}

impl ProgressDelegate for ProgressForwarder {
    fn progress_update(&self, progress: f64) {
        self.attempter.broadcast_status(progress);
    }
}

fn parse_key_value_headers(key_value_pair_headers: &[String]) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();

    for pair in key_value_pair_headers {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(service_error(
                ErrorCode::Error,
                format!("Passed invalid header: {pair}"),
            ));
        };

        if headers.insert(key.to_owned(), value.to_owned()).is_some() {
            return Err(service_error(
                ErrorCode::Error,
                format!("Passed repeated key: {key}"),
            ));
        }
    }

    Ok(headers)
}

fn header_as_bool(value: Option<&String>, default: bool) -> bool {
    match value.map(String::as_str) {
        Some("0") => false,
        Some("1") => true,
        _ => default,
    }
}

fn hash_device_range(
    file: &File,
    mut offset: u64,
    length: u64,
    context: &mut digest::Context,
) -> io::Result<()> {
    let mut remaining = length;
    let mut buf = vec![0u8; 128 * 1024];

    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        let n = osutil::pread_all(file, &mut buf[..chunk], offset)?;
        if n != chunk {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Source extent extends past the end of the device",
            ));
        }

        context.update(&buf[..chunk]);
        offset += chunk as u64;
        remaining -= chunk as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        let headers = parse_key_value_headers(&[
            "FILE_HASH=abc".to_owned(),
            "POWERWASH=1".to_owned(),
        ])
        .unwrap();
        assert_eq!(headers.get("FILE_HASH").unwrap(), "abc");
        assert_eq!(headers.get("POWERWASH").unwrap(), "1");

        assert!(parse_key_value_headers(&["no-equals-sign".to_owned()]).is_err());
        assert!(parse_key_value_headers(&["A=1".to_owned(), "A=2".to_owned()]).is_err());
    }

    #[test]
    fn header_booleans() {
        assert!(header_as_bool(Some(&"1".to_owned()), false));
        assert!(!header_as_bool(Some(&"0".to_owned()), true));
        // Unparseable values fall back to the default.
        assert!(header_as_bool(Some(&"yes".to_owned()), true));
        assert!(!header_as_bool(None, false));
    }
}
