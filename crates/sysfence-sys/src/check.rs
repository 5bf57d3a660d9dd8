//! Runtime probe of the kernel's seccomp support.
//!
//! Features are folded into one API level. A level is reached only when it
//! and every level below it pass:
//!
//! | Level | Probe |
//! |-------|-------|
//! | 1 | `PR_GET_SECCOMP` answers (filter mode built in) |
//! | 2 | `TSYNC` filter flag |
//! | 3 | `RET_LOG` and `RET_KILL_PROCESS` actions, `LOG` flag |
//! | 4 | `SPEC_ALLOW` flag |
//! | 5 | `RET_USER_NOTIF` action, `NEW_LISTENER` flag |
//! | 6 | `TSYNC_ESRCH` flag |
//!
//! Flags are probed by handing the kernel a NULL program, so nothing is ever
//! installed. The result is computed once per process.
//!
//! ```ignore
//! let info = sysfence_sys::check().map_err(Clone::clone)?;
//! println!("API level {} on {:?}", info.api_level, info.kernel_version);
//! ```

use std::sync::OnceLock;

use rustix::system::uname;
use thiserror::Error;

use crate::seccomp::{
    SECCOMP_FILTER_FLAG_LOG, SECCOMP_FILTER_FLAG_NEW_LISTENER, SECCOMP_FILTER_FLAG_SPEC_ALLOW,
    SECCOMP_FILTER_FLAG_TSYNC, SECCOMP_FILTER_FLAG_TSYNC_ESRCH, SECCOMP_RET_KILL_PROCESS,
    SECCOMP_RET_LOG, SECCOMP_RET_USER_NOTIF, action_available, filter_flag_available,
    seccomp_available,
};

/// `(major, minor, patch)` of a kernel release.
pub type Release = (u32, u32, u32);

/// Filter mode (`SECCOMP_SET_MODE_FILTER`) first shipped in 3.5.
pub const MIN_KERNEL_VERSION: Release = (3, 5, 0);

/// Highest API level the probe can report.
pub const MAX_API_LEVEL: u32 = 6;

/// What the probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub kernel_version: Release,
    /// 1 through [`MAX_API_LEVEL`].
    pub api_level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error(
        "kernel {}.{}.{} predates seccomp filter mode ({}.{}.{})",
        .found.0, .found.1, .found.2, .required.0, .required.1, .required.2
    )]
    KernelTooOld { required: Release, found: Release },

    #[error("seccomp is disabled in this kernel")]
    SeccompNotAvailable,

    #[error("kernel release string is unreadable")]
    KernelVersionReadFailed,
}

/// Probes once, then returns the cached outcome.
pub fn check() -> Result<&'static SystemInfo, &'static CheckError> {
    static PROBE: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();
    PROBE.get_or_init(probe).as_ref()
}

/// Release of the running kernel, from `uname(2)`.
pub fn kernel_version() -> Result<Release, CheckError> {
    let uts = uname();
    uts.release()
        .to_str()
        .ok()
        .and_then(parse_release)
        .ok_or(CheckError::KernelVersionReadFailed)
}

fn probe() -> Result<SystemInfo, CheckError> {
    let kernel_version = kernel_version()?;
    if kernel_version < MIN_KERNEL_VERSION {
        return Err(CheckError::KernelTooOld {
            required: MIN_KERNEL_VERSION,
            found: kernel_version,
        });
    }
    if !seccomp_available() {
        return Err(CheckError::SeccompNotAvailable);
    }
    Ok(SystemInfo {
        kernel_version,
        api_level: api_level(),
    })
}

/// Probes for levels 2 and up, in order.
const LEVEL_PROBES: [fn() -> bool; 5] = [
    || filter_flag_available(SECCOMP_FILTER_FLAG_TSYNC),
    || {
        action_available(SECCOMP_RET_LOG)
            && action_available(SECCOMP_RET_KILL_PROCESS)
            && filter_flag_available(SECCOMP_FILTER_FLAG_LOG)
    },
    || filter_flag_available(SECCOMP_FILTER_FLAG_SPEC_ALLOW),
    || {
        action_available(SECCOMP_RET_USER_NOTIF)
            && filter_flag_available(SECCOMP_FILTER_FLAG_NEW_LISTENER)
    },
    || filter_flag_available(SECCOMP_FILTER_FLAG_TSYNC_ESRCH),
];

fn api_level() -> u32 {
    1 + LEVEL_PROBES.iter().take_while(|passes| passes()).count() as u32
}

/// Parses releases such as `6.1.0-13-amd64` or `6.8-rc1`. A missing patch
/// number reads as 0.
fn parse_release(release: &str) -> Option<Release> {
    let mut fields = release.splitn(3, '.');
    let major = leading_number(fields.next()?)?;
    let minor = leading_number(fields.next()?)?;
    let patch = fields.next().and_then(leading_number).unwrap_or(0);
    Some((major, minor, patch))
}

fn leading_number(field: &str) -> Option<u32> {
    let end = field
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(field.len());
    field[..end].parse().ok()
}
