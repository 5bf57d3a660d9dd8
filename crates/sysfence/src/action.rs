//! Filter actions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sysfence_sys::seccomp::{
    SECCOMP_RET_ACTION_FULL, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA, SECCOMP_RET_ERRNO,
    SECCOMP_RET_KILL_PROCESS, SECCOMP_RET_KILL_THREAD, SECCOMP_RET_LOG, SECCOMP_RET_TRACE,
    SECCOMP_RET_TRAP, SECCOMP_RET_USER_NOTIF,
};

/// What the kernel does with a syscall a filter matched.
///
/// `Errno` and `Trace` carry a 16-bit payload: the errno the syscall fails
/// with, or the message a tracer sees in `PTRACE_GETEVENTMSG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Kill every thread of the process.
    KillProcess,
    /// Kill the calling thread.
    KillThread,
    Allow,
    /// Deliver `SIGSYS` to the calling thread.
    Trap,
    /// Fail the syscall with this errno.
    Errno(u16),
    /// Stop at a `PTRACE_EVENT_SECCOMP` for an attached tracer.
    Trace(u16),
    /// Allow, after logging.
    Log,
    /// Suspend the caller and queue a notification for a supervisor.
    Notify,
    /// Placeholder for unknown raw values. Never accepted by a filter.
    #[serde(skip)]
    Invalid,
}

impl Action {
    /// Returns the action with its payload replaced by `code`.
    ///
    /// Only `Errno` and `Trace` carry a payload; every other action is
    /// returned unchanged.
    #[must_use]
    pub const fn set_return_code(self, code: u16) -> Self {
        match self {
            Action::Errno(_) => Action::Errno(code),
            Action::Trace(_) => Action::Trace(code),
            other => other,
        }
    }

    pub const fn return_code(self) -> Option<u16> {
        match self {
            Action::Errno(code) | Action::Trace(code) => Some(code),
            _ => None,
        }
    }

    pub const fn is_valid(self) -> bool {
        !matches!(self, Action::Invalid)
    }

    /// Decodes a `SECCOMP_RET_*` value.
    pub const fn from_raw(raw: u32) -> Self {
        let data = (raw & SECCOMP_RET_DATA) as u16;
        match raw & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_KILL_PROCESS => Action::KillProcess,
            SECCOMP_RET_KILL_THREAD => Action::KillThread,
            SECCOMP_RET_TRAP => Action::Trap,
            SECCOMP_RET_ERRNO => Action::Errno(data),
            SECCOMP_RET_USER_NOTIF => Action::Notify,
            SECCOMP_RET_TRACE => Action::Trace(data),
            SECCOMP_RET_LOG => Action::Log,
            SECCOMP_RET_ALLOW => Action::Allow,
            _ => Action::Invalid,
        }
    }

    /// Encodes as the `SECCOMP_RET_*` value a program returns.
    ///
    /// `Invalid` has no encoding.
    pub const fn to_raw(self) -> Option<u32> {
        Some(match self {
            Action::KillProcess => SECCOMP_RET_KILL_PROCESS,
            Action::KillThread => SECCOMP_RET_KILL_THREAD,
            Action::Allow => SECCOMP_RET_ALLOW,
            Action::Trap => SECCOMP_RET_TRAP,
            Action::Errno(code) => SECCOMP_RET_ERRNO | code as u32,
            Action::Trace(code) => SECCOMP_RET_TRACE | code as u32,
            Action::Log => SECCOMP_RET_LOG,
            Action::Notify => SECCOMP_RET_USER_NOTIF,
            Action::Invalid => return None,
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::KillProcess => f.write_str("KILL_PROCESS"),
            Action::KillThread => f.write_str("KILL"),
            Action::Allow => f.write_str("ALLOW"),
            Action::Trap => f.write_str("TRAP"),
            Action::Errno(code) => write!(f, "ERRNO({code})"),
            Action::Trace(code) => write!(f, "TRACE({code})"),
            Action::Log => f.write_str("LOG"),
            Action::Notify => f.write_str("NOTIFY"),
            Action::Invalid => f.write_str("INVALID"),
        }
    }
}
