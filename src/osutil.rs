// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Thin, EINTR-safe wrappers around the descriptor-level syscalls the rest of
//! the crate needs, plus the filesystem mount layer. Mounting goes through the
//! [`Mounter`] trait so tests can run the postinstall pipeline without
//! privileges.

use std::{
    collections::HashSet,
    fs::{self, File},
    io,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};

use rustix::{
    fs::FileType,
    io::Errno,
    mount::{MountFlags, UnmountFlags},
};
use tracing::{info, warn};

// _IO(0x12, 93) and _IO(0x12, 94); not exposed by libc.
const BLKROSET: libc::c_ulong = 0x125d;
const BLKROGET: libc::c_ulong = 0x125e;
// _IOR(0x12, 114, sizeof(u64)); not exposed by libc.
const BLKGETSIZE64: libc::c_ulong = 0x80081272;

const UNMOUNT_MAX_RETRIES: u32 = 5;
const UNMOUNT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Filesystem types probed, in order, when a mount request does not name one.
const MOUNT_FSTYPE_CANDIDATES: &[&str] = &["ext2", "ext3", "ext4", "squashfs", "erofs"];

/// Result of a [`read_all`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadAll {
    pub bytes_read: usize,
    /// Whether the descriptor reached EOF. Never set when the read stopped
    /// because a non-blocking descriptor had no more data.
    pub eof: bool,
}

/// Read from `fd` until `buf` is full, EOF is reached, or a non-blocking
/// descriptor runs out of data.
pub fn read_all(fd: impl AsFd, buf: &mut [u8]) -> io::Result<ReadAll> {
    let mut bytes_read = 0;
    let mut eof = false;

    while bytes_read < buf.len() {
        match rustix::io::read(&fd, &mut buf[bytes_read..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => bytes_read += n,
            Err(e) if e == Errno::INTR => {}
            Err(e) if e == Errno::AGAIN => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ReadAll { bytes_read, eof })
}

/// Write all of `buf` to `fd`.
pub fn write_all(fd: impl AsFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;

    while written < buf.len() {
        match rustix::io::write(&fd, &buf[written..]) {
            Ok(n) => written += n,
            Err(e) if e == Errno::INTR => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Read up to `buf.len()` bytes at `offset` without touching the file
/// position. Returns the number of bytes read, which is only smaller than the
/// buffer when EOF was reached.
pub fn pread_all(fd: impl AsFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut bytes_read = 0;

    while bytes_read < buf.len() {
        match rustix::io::pread(&fd, &mut buf[bytes_read..], offset + bytes_read as u64) {
            Ok(0) => break,
            Ok(n) => bytes_read += n,
            Err(e) if e == Errno::INTR => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(bytes_read)
}

/// Write all of `buf` at `offset` without touching the file position.
pub fn pwrite_all(fd: impl AsFd, buf: &[u8], offset: u64) -> io::Result<()> {
    let mut written = 0;

    while written < buf.len() {
        match rustix::io::pwrite(&fd, &buf[written..], offset + written as u64) {
            Ok(n) => written += n,
            Err(e) if e == Errno::INTR => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Get the size of an open block device.
pub fn block_device_size(file: &File) -> io::Result<u64> {
    let fd = file.as_raw_fd();
    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    let rc = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

/// Toggle the kernel-level read-only flag on a block device. Does nothing when
/// the flag already has the requested value.
pub fn set_block_device_read_only(device: &Path, read_only: bool) -> io::Result<()> {
    let file = File::open(device)?;
    let fd = file.as_raw_fd();
    let expected: libc::c_int = read_only.into();

    let mut current: libc::c_int = 0;
    // SAFETY: BLKROGET writes a single c_int through the pointer.
    let rc = unsafe { libc::ioctl(fd, BLKROGET, &mut current) };
    if rc == 0 && current == expected {
        return Ok(());
    }

    // SAFETY: BLKROSET reads a single c_int through the pointer.
    let rc = unsafe { libc::ioctl(fd, BLKROSET, &expected) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Open a directory and fsync it. Filesystems that don't support syncing a
/// directory (EROFS/EINVAL) are tolerated with a warning.
pub fn fsync_directory(dir: &Path) -> io::Result<()> {
    let file = File::open(dir)?;

    if let Err(e) = file.sync_all() {
        if matches!(e.raw_os_error(), Some(libc::EROFS) | Some(libc::EINVAL)) {
            warn!("Skipping fsync of {dir:?}: {e}");
        } else {
            return Err(e);
        }
    }

    Ok(())
}

/// Atomically replace the contents of `path`: write to a temporary sibling,
/// fsync it, rename over the target, and fsync the directory. A reader never
/// observes a torn file, even across power loss.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp_os = path.as_os_str().to_owned();
    tmp_os.push(".tmp");
    let tmp_path = PathBuf::from(tmp_os);

    {
        let mut file = File::create(&tmp_path)?;
        io::Write::write_all(&mut file, data)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fsync_directory(parent)
}

/// The kernel-assigned id of the current boot.
pub fn boot_id() -> io::Result<String> {
    let raw = fs::read_to_string("/proc/sys/kernel/random/boot_id")?;
    Ok(raw.trim().to_owned())
}

/// Filesystem mounting operations. The production implementation issues real
/// mount syscalls; tests inject [`FakeMounter`].
pub trait Mounter: Send + Sync {
    /// Mount `device` read-only at `mount_point`. An empty `fs_type` probes
    /// the supported filesystem types in order.
    fn mount_ro(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: &str,
    ) -> io::Result<()>;

    fn unmount(&self, mount_point: &Path) -> io::Result<()>;

    fn is_mountpoint(&self, path: &Path) -> bool;
}

pub struct RealMounter;

impl Mounter for RealMounter {
    fn mount_ro(
        &self,
        device: &Path,
        mount_point: &Path,
        fs_type: &str,
        options: &str,
    ) -> io::Result<()> {
        let candidates: &[&str] = if fs_type.is_empty() {
            MOUNT_FSTYPE_CANDIDATES
        } else {
            &[fs_type]
        };

        let mut last_error = Errno::INVAL;

        for fstype in candidates.iter().copied() {
            match rustix::mount::mount(device, mount_point, fstype, MountFlags::RDONLY, options)
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Unable to mount {device:?} on {mount_point:?} as {fstype}: {e}");
                    last_error = e;
                }
            }
        }

        Err(last_error.into())
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        let mut attempts = 0;

        let error = loop {
            attempts += 1;

            match rustix::mount::unmount(mount_point, UnmountFlags::empty()) {
                Ok(()) => return Ok(()),
                Err(e) if e == Errno::BUSY && attempts < UNMOUNT_MAX_RETRIES => {
                    thread::sleep(UNMOUNT_RETRY_INTERVAL);
                }
                Err(e) => break e,
            }
        };

        if error == Errno::INVAL {
            info!("Not a mountpoint: {mount_point:?}");
            return Err(error.into());
        }

        warn!(
            "Error unmounting {mount_point:?} after {attempts} attempts ({error}), \
             lazy unmounting instead",
        );
        rustix::mount::unmount(mount_point, UnmountFlags::DETACH)?;

        Ok(())
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        let Ok(st_dir) = rustix::fs::lstat(path) else {
            return false;
        };
        if FileType::from_raw_mode(st_dir.st_mode) != FileType::Directory {
            return false;
        }

        // A mounted filesystem puts the directory on a different device than
        // its parent. The parent pointing at the same inode is the special
        // case of the filesystem root. Bind mounts are not detected.
        let Ok(st_parent) = rustix::fs::lstat(&path.join("..")) else {
            return false;
        };

        FileType::from_raw_mode(st_parent.st_mode) == FileType::Directory
            && (st_parent.st_dev != st_dir.st_dev || st_parent.st_ino == st_dir.st_ino)
    }
}

/// A privilege-free [`Mounter`] for tests. The "device" is interpreted as a
/// directory tree whose contents are copied into the mount point on mount and
/// removed again on unmount, so the runner sees the same filesystem layout a
/// real mount would produce.
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<FakeMounterState>,
}

#[derive(Default)]
struct FakeMounterState {
    mounted: Option<PathBuf>,
    mounts: Vec<(PathBuf, PathBuf)>,
    unmounts: Vec<PathBuf>,
    fail_devices: HashSet<PathBuf>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mount of `device` fail.
    pub fn fail_device(&self, device: &Path) {
        self.state
            .lock()
            .unwrap()
            .fail_devices
            .insert(device.to_owned());
    }

    /// All successful `(device, mount_point)` mount calls, in order.
    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.lock().unwrap().mounts.clone()
    }

    /// All successful unmount calls, in order.
    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().unmounts.clone()
    }
}

impl Mounter for FakeMounter {
    fn mount_ro(
        &self,
        device: &Path,
        mount_point: &Path,
        _fs_type: &str,
        _options: &str,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.fail_devices.contains(device) {
            return Err(io::Error::other("injected mount failure"));
        }
        if state.mounted.is_some() {
            return Err(io::Error::other("mount point is busy"));
        }

        copy_dir_contents(device, mount_point)?;

        state.mounted = Some(mount_point.to_owned());
        state
            .mounts
            .push((device.to_owned(), mount_point.to_owned()));

        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.mounted.as_deref() != Some(mount_point) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        remove_dir_contents(mount_point)?;

        state.mounted = None;
        state.unmounts.push(mount_point.to_owned());

        Ok(())
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        self.state.lock().unwrap().mounted.as_deref() == Some(path)
    }
}

fn copy_dir_contents(source: &Path, target: &Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target_path = target.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            fs::create_dir(&target_path)?;
            copy_dir_contents(&entry.path(), &target_path)?;
        } else {
            fs::copy(entry.path(), &target_path)?;
        }
    }

    Ok(())
}

fn remove_dir_contents(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;

        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use super::*;

    #[test]
    fn read_write_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let file = File::create(&path).unwrap();
        write_all(&file, b"foobar").unwrap();
        drop(file);

        let file = File::open(&path).unwrap();
        let mut buf = [0u8; 8];
        let result = read_all(&file, &mut buf).unwrap();
        assert_eq!(result, ReadAll { bytes_read: 6, eof: true });
        assert_eq!(&buf[..6], b"foobar");
    }

    #[test]
    fn pread_pwrite_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(b"xxxxxx").unwrap();

        pwrite_all(&file, b"ab", 2).unwrap();

        let mut buf = [0u8; 6];
        let n = pread_all(&file, &mut buf, 0).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"xxabxx");

        // Reads past EOF stop short instead of failing.
        let n = pread_all(&file, &mut buf, 4).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        write_file_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // No temporary file left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn fake_mounter_round_trip() {
        let device = tempfile::tempdir().unwrap();
        let mount_point = tempfile::tempdir().unwrap();

        fs::create_dir(device.path().join("bin")).unwrap();
        fs::write(device.path().join("bin/postinst"), b"#!/bin/sh\n").unwrap();

        let mounter = FakeMounter::new();
        mounter
            .mount_ro(device.path(), mount_point.path(), "ext4", "")
            .unwrap();

        assert!(mounter.is_mountpoint(mount_point.path()));
        assert!(mount_point.path().join("bin/postinst").exists());

        mounter.unmount(mount_point.path()).unwrap();
        assert!(!mounter.is_mountpoint(mount_point.path()));
        assert!(!mount_point.path().join("bin").exists());

        // Unmounting again reports EINVAL like the real thing.
        let err = mounter.unmount(mount_point.path()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
