//! Datagram-buffer provisioner (component C).
//!
//! Backs each channel with an anonymous, sealable memory file
//! (`memfd_create`), sized to a page-aligned multiple of the caller's
//! request. This stands in for the external datagram-board ring the
//! original system links against out of process; the contract the rest
//! of this crate relies on — fd in, rounded size out, closed on channel
//! death — is unchanged regardless of what sits behind the fd.

use std::os::fd::OwnedFd;

use anyhow::{Context, Result};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::unistd::ftruncate;

/// One full datagram envelope; also the floor for a configured default
/// buffer size (§4.C, §4.J).
pub const MIN_BUFFER_SIZE: u64 = u16::MAX as u64;

fn page_size() -> u64 {
    // SAFETY: _SC_PAGESIZE is always a valid sysconf name; a negative
    // return only happens for unsupported names.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

fn round_up_to_page(size: u64) -> u64 {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Create a new buffer of at least `requested_size` bytes.
///
/// Returns the owned fd and the actual size allocated, which may be
/// larger than requested due to page rounding.
pub fn create(requested_size: u64) -> Result<(OwnedFd, u64)> {
    let actual_size = round_up_to_page(requested_size.max(1));

    let fd = memfd_create(c"smb-manager-channel", MFdFlags::MFD_CLOEXEC)
        .context("memfd_create failed")?;
    ftruncate(&fd, actual_size as i64).context("ftruncate on channel buffer failed")?;

    Ok((fd, actual_size))
}
