//! User-notification ABI (`SECCOMP_RET_USER_NOTIF`).
//!
//! Loading a filter with `SECCOMP_FILTER_FLAG_NEW_LISTENER` returns a
//! listener descriptor. Each syscall the filter sends to user space parks
//! its caller and becomes readable on the listener as a `seccomp_notif`. The
//! supervisor answers it with a `seccomp_notif_resp` carrying either an
//! injected result or `SECCOMP_USER_NOTIF_FLAG_CONTINUE`.
//!
//! Anything read out of the target's memory may have changed by the time it
//! is acted on, and the target may have died and its pid been recycled.
//! [`notif_id_valid`] tells whether the request is still pending; call it
//! after every read of target memory.

use std::os::fd::{AsRawFd, BorrowedFd};

use rustix::io::Errno;

use crate::last_errno;

/// Response flag: run the parked syscall unchanged.
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

// `_IOWR('!', 0, struct seccomp_notif)`
pub const SECCOMP_IOCTL_NOTIF_RECV: u64 = 0xc0502100;
// `_IOWR('!', 1, struct seccomp_notif_resp)`
pub const SECCOMP_IOCTL_NOTIF_SEND: u64 = 0xc0182101;
// `_IOW('!', 2, __u64)`, the 5.7+ number. 5.0 to 5.6 used `_IOR`.
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: u64 = 0x40082102;

/// `struct seccomp_data`: what a filter (and a supervisor) sees of a syscall.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompData {
    pub nr: i32,
    /// `AUDIT_ARCH_*` of the calling ABI.
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// `struct seccomp_notif`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotif {
    pub id: u64,
    /// Caller's thread id as seen from the listener's pid namespace.
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// `struct seccomp_notif_resp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    /// Zero or a negated errno.
    pub error: i32,
    pub flags: u32,
}

/// Waits for the next notification and writes it into `notif`.
///
/// The buffer is cleared first; kernels since 5.5 refuse non-zero input.
/// Blocks while the queue is empty.
///
/// # Errors
///
/// `ENOENT` when the caller died between queueing and this call.
pub fn notif_recv(listener: BorrowedFd<'_>, notif: &mut SeccompNotif) -> Result<(), Errno> {
    *notif = SeccompNotif::default();
    // SAFETY: RECV writes exactly one seccomp_notif into the buffer.
    unsafe { notify_ioctl(listener, SECCOMP_IOCTL_NOTIF_RECV, notif as *mut SeccompNotif) }
}

/// Delivers `resp` and wakes the parked caller.
///
/// # Errors
///
/// `ENOENT` for ids that are unknown, already answered or whose caller died.
pub fn notif_send(listener: BorrowedFd<'_>, resp: &SeccompNotifResp) -> Result<(), Errno> {
    // SAFETY: SEND only reads the response.
    unsafe { notify_ioctl(listener, SECCOMP_IOCTL_NOTIF_SEND, resp as *const SeccompNotifResp) }
}

/// Succeeds while request `id` is still parked on `listener`.
///
/// # Errors
///
/// `ENOENT` once the request is gone.
pub fn notif_id_valid(listener: BorrowedFd<'_>, id: u64) -> Result<(), Errno> {
    // SAFETY: ID_VALID only reads the u64.
    unsafe { notify_ioctl(listener, SECCOMP_IOCTL_NOTIF_ID_VALID, &id as *const u64) }
}

/// # Safety
///
/// `arg` must match the layout `request` encodes.
unsafe fn notify_ioctl<T>(
    listener: BorrowedFd<'_>,
    request: u64,
    arg: *const T,
) -> Result<(), Errno> {
    let ret = unsafe { libc::ioctl(listener.as_raw_fd(), request as _, arg) };
    if ret < 0 { Err(last_errno()) } else { Ok(()) }
}
