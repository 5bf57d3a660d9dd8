//! Error types for sysfence.

use std::fmt;
use std::io;

use rustix::io::Errno;
use sysfence_sys::CheckError;
use thiserror::Error;

use crate::arch::Arch;
use crate::condition::CompareOp;

/// Minimum version reported when a [`VersionError`] names none.
///
/// Filter mode (`SECCOMP_SET_MODE_FILTER`) first shipped in kernel 3.5.0.
pub const BASELINE_VERSION: &str = "3.5.0";

/// Main error type for sysfence operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid action")]
    InvalidAction,

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("invalid syscall: {0}")]
    InvalidSyscall(String),

    #[error("invalid condition: {0}")]
    InvalidCondition(#[from] ConditionError),

    #[error(transparent)]
    VersionTooLow(#[from] VersionError),

    #[error("{feature} requires API level {required}, current level is {current}")]
    NotSupported {
        feature: &'static str,
        required: u32,
        current: u32,
    },

    #[error("seccomp unavailable: {0}")]
    Unavailable(#[from] CheckError),

    #[error("filter is invalid or has been released")]
    FilterInvalid,

    #[error("filters cannot be merged: {0}")]
    MergeIncompatible(MergeConflict),

    #[error("notification channel closed")]
    ChannelClosed,

    #[error("notification {id:#x} is no longer valid")]
    StaleRequest { id: u64 },

    #[error("program has {len} instructions, kernel limit is {max}")]
    ProgramTooLarge { len: usize, max: usize },

    #[error("policy: {0}")]
    Policy(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("os: {0}")]
    Os(#[from] Errno),
}

/// Result type for sysfence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a condition was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("argument index {index} out of range 0..={max}")]
    ArgumentOutOfRange { index: u32, max: u32 },

    #[error("invalid comparison operator")]
    InvalidOperator,

    #[error("{op} takes {expected} operand(s), got {found}")]
    OperandCount {
        op: CompareOp,
        expected: usize,
        found: usize,
    },

    #[error("more than one condition on argument {0}")]
    DuplicateArgument(u32),
}

/// Why two filters could not be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeConflict {
    /// Both filters contain this architecture.
    ArchOverlap(Arch),
    DefaultAction,
    BadArchAction,
    Attributes,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArchOverlap(arch) => write!(f, "both filters contain architecture {arch}"),
            Self::DefaultAction => f.write_str("default actions differ"),
            Self::BadArchAction => f.write_str("bad architecture actions differ"),
            Self::Attributes => f.write_str("filter attributes differ"),
        }
    }
}

/// The seccomp support found is older than required.
///
/// Renders as
/// `seccomp version too low: <detail>: minimum supported is <minimum>: detected <version>`,
/// dropping the `<detail>: ` segment when there is no detail and substituting
/// [`BASELINE_VERSION`] when no minimum is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionError {
    pub detail: Option<String>,
    pub minimum: Option<String>,
    pub detected: String,
}

impl VersionError {
    pub fn new(detected: impl Into<String>) -> Self {
        Self {
            detail: None,
            minimum: None,
            detected: detected.into(),
        }
    }

    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into()).filter(|d: &String| !d.is_empty());
        self
    }

    #[must_use]
    pub fn minimum(mut self, minimum: impl Into<String>) -> Self {
        self.minimum = Some(minimum.into()).filter(|m: &String| !m.is_empty());
        self
    }
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("seccomp version too low: ")?;
        if let Some(detail) = &self.detail {
            write!(f, "{detail}: ")?;
        }
        let minimum = self.minimum.as_deref().unwrap_or(BASELINE_VERSION);
        write!(f, "minimum supported is {minimum}: detected {}", self.detected)
    }
}

impl std::error::Error for VersionError {}
