//! Capability context.
//!
//! Kernel seccomp features are folded into one monotonically ordered API
//! level (see [`sysfence_sys::check`]). A [`Filter`](crate::Filter) carries
//! the level it was created with and gates attributes and notification on it.

use std::fmt;

use sysfence_sys::CheckError;
use sysfence_sys::check::{self, MAX_API_LEVEL};

use crate::error::{Error, Result, VersionError};

/// Level that adds the thread-sync filter flag.
pub const LEVEL_TSYNC: u32 = 2;
/// Level that adds `SECCOMP_RET_LOG` and the log filter flag.
pub const LEVEL_LOG: u32 = 3;
/// Level that adds the speculative store bypass flag.
pub const LEVEL_SSB: u32 = 4;
/// Level at which user-space notification is fully usable.
pub const LEVEL_NOTIFY: u32 = 6;

/// Kernel release as `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl From<(u32, u32, u32)> for KernelVersion {
    fn from((major, minor, patch): (u32, u32, u32)) -> Self {
        Self::new(major, minor, patch)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The API level a filter negotiates features against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    level: u32,
    kernel: Option<KernelVersion>,
}

impl Capabilities {
    /// Probes the running kernel. The probe runs once per process.
    ///
    /// # Errors
    ///
    /// `VersionTooLow` when the kernel predates filter mode, `Unavailable`
    /// when seccomp is compiled out or the release cannot be read.
    pub fn detect() -> Result<Self> {
        match check::check() {
            Ok(info) => Ok(Self {
                level: info.api_level,
                kernel: Some(info.kernel_version.into()),
            }),
            Err(err) => Err(check_error(err)),
        }
    }

    /// Capabilities pinned at `level`, without probing.
    ///
    /// Levels above the highest known one are clamped.
    pub const fn with_level(level: u32) -> Self {
        let level = if level > MAX_API_LEVEL {
            MAX_API_LEVEL
        } else {
            level
        };
        Self {
            level,
            kernel: None,
        }
    }

    pub const fn level(&self) -> u32 {
        self.level
    }

    /// Kernel release seen by [`detect`](Self::detect), if probed.
    pub const fn kernel_version(&self) -> Option<KernelVersion> {
        self.kernel
    }

    /// Lowers the negotiated level to `level`.
    ///
    /// Requesting the current level or any level below it succeeds. Level 0
    /// and levels above the current one fail with `NotSupported`.
    pub fn request_level(&self, level: u32) -> Result<Self> {
        if level == 0 || level > self.level {
            return Err(Error::NotSupported {
                feature: "api level",
                required: level,
                current: self.level,
            });
        }
        Ok(Self { level, ..*self })
    }

    /// Fails with `NotSupported` unless the level reaches `required`.
    pub fn require(&self, feature: &'static str, required: u32) -> Result<()> {
        if self.level < required {
            return Err(Error::NotSupported {
                feature,
                required,
                current: self.level,
            });
        }
        Ok(())
    }

    pub const fn supports_tsync(&self) -> bool {
        self.level >= LEVEL_TSYNC
    }

    pub const fn supports_log(&self) -> bool {
        self.level >= LEVEL_LOG
    }

    pub const fn supports_ssb(&self) -> bool {
        self.level >= LEVEL_SSB
    }

    pub const fn supports_notify(&self) -> bool {
        self.level >= LEVEL_NOTIFY
    }
}

fn check_error(err: &CheckError) -> Error {
    match err {
        CheckError::KernelTooOld { required, found } => {
            VersionError::new(KernelVersion::from(*found).to_string())
                .detail("kernel lacks seccomp filter mode")
                .minimum(KernelVersion::from(*required).to_string())
                .into()
        }
        other => Error::Unavailable(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_level_is_monotonic() {
        let caps = Capabilities::with_level(4);
        assert_eq!(caps.request_level(4).unwrap().level(), 4);
        assert_eq!(caps.request_level(1).unwrap().level(), 1);
        assert!(matches!(
            caps.request_level(5),
            Err(Error::NotSupported {
                required: 5,
                current: 4,
                ..
            })
        ));
        assert!(caps.request_level(0).is_err());
    }

    #[test]
    fn with_level_clamps() {
        assert_eq!(Capabilities::with_level(99).level(), MAX_API_LEVEL);
        assert_eq!(Capabilities::with_level(0).level(), 0);
    }

    #[test]
    fn feature_gates() {
        let caps = Capabilities::with_level(3);
        assert!(caps.supports_tsync());
        assert!(caps.supports_log());
        assert!(!caps.supports_ssb());
        assert!(!caps.supports_notify());
        assert!(caps.require("log bit", LEVEL_LOG).is_ok());
        let err = caps.require("ssb bit", LEVEL_SSB).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ssb bit requires API level 4, current level is 3"
        );
    }

    #[test]
    fn old_kernel_is_version_too_low() {
        let err = check_error(&CheckError::KernelTooOld {
            required: (3, 5, 0),
            found: (3, 2, 0),
        });
        assert!(matches!(err, Error::VersionTooLow(_)));
        assert_eq!(
            err.to_string(),
            "seccomp version too low: kernel lacks seccomp filter mode: minimum supported is 3.5.0: detected 3.2.0"
        );
        assert!(matches!(
            check_error(&CheckError::SeccompNotAvailable),
            Error::Unavailable(CheckError::SeccompNotAvailable)
        ));
    }

    #[test]
    fn detect_matches_probe() {
        match (Capabilities::detect(), check::check()) {
            (Ok(caps), Ok(info)) => {
                assert_eq!(caps.level(), info.api_level);
                assert!(caps.level() >= 1);
            }
            (Err(_), Err(_)) => {}
            (caps, info) => panic!("detect and probe disagree: {caps:?} / {info:?}"),
        }
    }
}
