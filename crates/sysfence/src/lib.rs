//! sysfence: seccomp syscall filters for the calling process.
//!
//! Build a [`Filter`], install it with [`Filter::load`], and optionally
//! supervise deferred syscalls through a [`NotifyChannel`].
//!
//! - **Filter** - architectures, default and bad-arch actions, attribute bits,
//!   ordered rules with argument conditions
//! - **Conditions** - unsigned 64-bit comparisons on the six syscall arguments
//! - **Notification** - request/response exchange with a TOCTOU validity check
//! - **Policy** - the same filter described in a JSON file
//!
//! ## Quick Start
//!
//! ```ignore
//! use sysfence::{Action, Condition, Filter, Syscall};
//!
//! let mut filter = Filter::new(Action::Allow)?;
//! filter.add_rule(Syscall::from_name("ptrace")?, Action::Errno(1))?;
//! filter.add_conditional_rule(
//!     Syscall::from_name("socket")?,
//!     Action::Errno(97),
//!     &[Condition::equal(0, libc::AF_INET6 as u64)?],
//! )?;
//! filter.load()?;
//! ```
//!
//! ## Threads
//!
//! Loading filters the calling kernel thread and the threads it creates
//! afterwards. Threads that already exist are only covered with
//! [`Filter::set_tsync`]. Async runtimes must keep the loading task on one
//! thread.
//!
//! ## Requirements
//!
//! - Linux 3.5+ with seccomp filter mode
//! - Linux 5.7+ (API level 6) for notification

pub mod action;
pub mod api;
pub mod arch;
mod bpf;
pub mod condition;
pub mod error;
pub mod filter;
pub mod notify;
mod pfc;
pub mod policy;
pub mod syscall;

pub use action::Action;
pub use api::{Capabilities, KernelVersion};
pub use arch::Arch;
pub use condition::{CompareOp, Condition};
pub use error::{ConditionError, Error, MergeConflict, Result, VersionError};
pub use filter::{Attributes, Filter, Rule};
pub use notify::{NotifyChannel, NotifyRequest, NotifyResponse, SyscallData};
pub use policy::Policy;
pub use syscall::Syscall;
