//! Loop-device pool for image-backed container roots.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// Path of loop device `n`.
#[must_use]
pub fn device_path(n: i32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{n}"))
}

/// Grab a free loop device and bind it to `image`.
///
/// # Errors
///
/// Returns an error if no device is free or the ioctls fail.
pub fn acquire(image: &Path) -> Result<i32> {
    let control = OpenOptions::new().read(true).open("/dev/loop-control")?;
    // SAFETY: LOOP_CTL_GET_FREE takes no argument.
    let n = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if n < 0 {
        return Err(nix::errno::Errno::last().into());
    }

    let device = OpenOptions::new().read(true).write(true).open(device_path(n))?;
    let backing = OpenOptions::new().read(true).write(true).open(image)?;
    // SAFETY: LOOP_SET_FD takes the backing fd as its argument.
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) };
    if rc < 0 {
        return Err(Error::with_errno(
            crate::error::ErrorKind::Unknown,
            nix::errno::Errno::last() as i32,
            format!("cannot bind {} to loop{n}", image.display()),
        ));
    }
    debug!(loop_dev = n, image = %image.display(), "acquired loop device");
    Ok(n)
}

/// Return a loop device to the host pool.
///
/// # Errors
///
/// Returns an error if the device cannot be opened or cleared.
pub fn release(n: i32) -> Result<()> {
    let device = OpenOptions::new().read(true).open(device_path(n))?;
    // SAFETY: LOOP_CLR_FD takes no meaningful argument.
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD, 0) };
    if rc < 0 {
        return Err(nix::errno::Errno::last().into());
    }
    debug!(loop_dev = n, "released loop device");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path() {
        assert_eq!(device_path(7), PathBuf::from("/dev/loop7"));
    }
}
