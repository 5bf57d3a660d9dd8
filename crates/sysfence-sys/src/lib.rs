//! Raw seccomp ABI for sysfence.
//!
//! Kernel structs, constants and syscall/ioctl wrappers that neither libc
//! nor rustix expose. No policy lives here; see the `sysfence` crate.
//!
//! - [`seccomp`]: classic BPF encoding, `SECCOMP_RET_*`, filter installation
//!   and feature probes
//! - [`seccomp_notify`]: user-notification structs and ioctls
//! - [`check`]: kernel release and API level detection
//!
//! Kernel releases per API level: 1 = 3.5, 2 = 3.17 (`TSYNC`), 3 = 4.14
//! (`RET_LOG`, `RET_KILL_PROCESS`, `LOG`), 4 = 4.17 (`SPEC_ALLOW`), 5 = 5.0
//! (`RET_USER_NOTIF`, `NEW_LISTENER`), 6 = 5.7 (`TSYNC_ESRCH`).

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod check;
pub mod seccomp;
pub mod seccomp_notify;

pub use check::{CheckError, SystemInfo, check};

/// The calling thread's `errno`.
#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location returns this thread's errno slot.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
