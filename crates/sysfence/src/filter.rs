//! The filter state machine.
//!
//! A [`Filter`] owns an architecture set, default and bad-architecture
//! actions, attribute bits and one ordered rule list per architecture. It is
//! compiled and installed with [`Filter::load`].
//!
//! ## Lifecycle
//!
//! ```text
//! new ──> Valid ──load──> Loaded ──release/merge──> Released
//!           ^               │  ^
//!           └────reset──────┘  └──load (again)
//! ```
//!
//! A loaded filter stays mutable; every [`load`](Filter::load) installs the
//! current state on top of what the calling thread already runs. Once
//! released every operation fails with [`Error::FilterInvalid`].
//!
//! ## Example
//!
//! ```ignore
//! use sysfence::{Action, Filter, Syscall};
//!
//! let mut filter = Filter::new(Action::Allow)?;
//! filter.add_rule(Syscall::from_name("ptrace")?, Action::Errno(libc::EPERM as u16))?;
//! filter.load()?;
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use sysfence_sys::seccomp::{
    SECCOMP_FILTER_FLAG_LOG, SECCOMP_FILTER_FLAG_NEW_LISTENER, SECCOMP_FILTER_FLAG_SPEC_ALLOW,
    SECCOMP_FILTER_FLAG_TSYNC, SECCOMP_FILTER_FLAG_TSYNC_ESRCH, SockFilter, SockFprog,
    seccomp_set_mode_filter, set_no_new_privs,
};

use crate::action::Action;
use crate::api::{Capabilities, LEVEL_LOG, LEVEL_NOTIFY, LEVEL_SSB, LEVEL_TSYNC};
use crate::arch::Arch;
use crate::bpf;
use crate::condition::{Condition, check_unique_args};
use crate::error::{Error, MergeConflict, Result};
use crate::notify::NotifyChannel;
use crate::pfc;
use crate::syscall::Syscall;

/// One entry of a per-architecture rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    syscall: Syscall,
    action: Action,
    conditions: Vec<Condition>,
}

impl Rule {
    pub(crate) fn new(syscall: Syscall, action: Action, conditions: Vec<Condition>) -> Self {
        Self {
            syscall,
            action,
            conditions,
        }
    }

    /// Syscall number on the rule's architecture.
    pub fn syscall(&self) -> Syscall {
        self.syscall
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// All must hold for the rule to match.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

/// Filter attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Set `PR_SET_NO_NEW_PRIVS` before installing.
    pub no_new_privs: bool,
    /// Log every action except `Allow` (`SECCOMP_FILTER_FLAG_LOG`).
    pub log: bool,
    /// Keep speculative store bypass mitigation off (`SECCOMP_FILTER_FLAG_SPEC_ALLOW`).
    pub ssb: bool,
    /// Install on every thread of the process (`SECCOMP_FILTER_FLAG_TSYNC`).
    pub tsync: bool,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            no_new_privs: true,
            log: false,
            ssb: false,
            tsync: false,
        }
    }
}

#[derive(Debug)]
struct State {
    default_action: Action,
    bad_arch_action: Action,
    arches: BTreeMap<Arch, Vec<Rule>>,
    attrs: Attributes,
    loaded: bool,
    listener: Option<OwnedFd>,
}

impl State {
    fn new(default_action: Action) -> Self {
        let mut arches = BTreeMap::new();
        arches.insert(Arch::native(), Vec::new());
        Self {
            default_action,
            bad_arch_action: Action::KillThread,
            arches,
            attrs: Attributes::default(),
            loaded: false,
            listener: None,
        }
    }

    fn has_notify(&self) -> bool {
        self.default_action == Action::Notify
            || self
                .arches
                .values()
                .flatten()
                .any(|rule| rule.action == Action::Notify)
    }
}

/// A seccomp filter under construction.
///
/// `Filter` is `Send` but not internally synchronized.
#[derive(Debug)]
pub struct Filter {
    state: Option<State>,
    caps: Capabilities,
}

impl Filter {
    /// Creates a filter for the native architecture, probing the kernel for
    /// its API level.
    ///
    /// # Errors
    ///
    /// `InvalidAction` for [`Action::Invalid`], or the probe's error.
    pub fn new(default_action: Action) -> Result<Self> {
        Self::with_capabilities(default_action, Capabilities::detect()?)
    }

    /// Creates a filter that negotiates features against `caps`.
    pub fn with_capabilities(default_action: Action, caps: Capabilities) -> Result<Self> {
        validate_action(default_action)?;
        Ok(Self {
            state: Some(State::new(default_action)),
            caps,
        })
    }

    /// Returns the filter to its freshly created state with a new default
    /// action. Rules, architectures and attributes are reset.
    pub fn reset(&mut self, default_action: Action) -> Result<()> {
        validate_action(default_action)?;
        let state = self.state_mut()?;
        *state = State::new(default_action);
        tracing::debug!(default = %default_action, "filter reset");
        Ok(())
    }

    /// False once the filter has been released or merged away.
    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    /// True after a successful [`load`](Self::load).
    pub fn is_loaded(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.loaded)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Adds `arch` with an empty rule list. Adding a present architecture is
    /// a no-op.
    pub fn add_arch(&mut self, arch: Arch) -> Result<()> {
        self.state_mut()?.arches.entry(arch).or_default();
        Ok(())
    }

    /// Removes `arch` and its rules. Removing an absent architecture is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `InvalidArchitecture` when `arch` is the only architecture left.
    pub fn remove_arch(&mut self, arch: Arch) -> Result<()> {
        let state = self.state_mut()?;
        if state.arches.len() == 1 && state.arches.contains_key(&arch) {
            return Err(Error::InvalidArchitecture(format!(
                "cannot remove {arch}, the last architecture of the filter"
            )));
        }
        state.arches.remove(&arch);
        Ok(())
    }

    pub fn is_arch_present(&self, arch: Arch) -> Result<bool> {
        Ok(self.state()?.arches.contains_key(&arch))
    }

    pub fn arches(&self) -> Result<Vec<Arch>> {
        Ok(self.state()?.arches.keys().copied().collect())
    }

    pub fn default_action(&self) -> Result<Action> {
        Ok(self.state()?.default_action)
    }

    pub fn set_default_action(&mut self, action: Action) -> Result<()> {
        validate_action(action)?;
        self.state_mut()?.default_action = action;
        Ok(())
    }

    /// Action for syscalls made through an ABI the filter has no rules for.
    pub fn bad_arch_action(&self) -> Result<Action> {
        Ok(self.state()?.bad_arch_action)
    }

    pub fn set_bad_arch_action(&mut self, action: Action) -> Result<()> {
        validate_action(action)?;
        self.state_mut()?.bad_arch_action = action;
        Ok(())
    }

    pub fn attributes(&self) -> Result<Attributes> {
        Ok(self.state()?.attrs)
    }

    pub fn no_new_privs(&self) -> Result<bool> {
        Ok(self.state()?.attrs.no_new_privs)
    }

    pub fn set_no_new_privs(&mut self, enabled: bool) -> Result<()> {
        self.state_mut()?.attrs.no_new_privs = enabled;
        Ok(())
    }

    pub fn log(&self) -> Result<bool> {
        self.caps.require("log bit", LEVEL_LOG)?;
        Ok(self.state()?.attrs.log)
    }

    pub fn set_log(&mut self, enabled: bool) -> Result<()> {
        self.caps.require("log bit", LEVEL_LOG)?;
        self.state_mut()?.attrs.log = enabled;
        Ok(())
    }

    pub fn ssb(&self) -> Result<bool> {
        self.caps.require("ssb bit", LEVEL_SSB)?;
        Ok(self.state()?.attrs.ssb)
    }

    pub fn set_ssb(&mut self, enabled: bool) -> Result<()> {
        self.caps.require("ssb bit", LEVEL_SSB)?;
        self.state_mut()?.attrs.ssb = enabled;
        Ok(())
    }

    pub fn tsync(&self) -> Result<bool> {
        self.caps.require("thread sync", LEVEL_TSYNC)?;
        Ok(self.state()?.attrs.tsync)
    }

    pub fn set_tsync(&mut self, enabled: bool) -> Result<()> {
        self.caps.require("thread sync", LEVEL_TSYNC)?;
        self.state_mut()?.attrs.tsync = enabled;
        Ok(())
    }

    /// Appends an unconditional rule for the native syscall number `syscall`.
    pub fn add_rule(&mut self, syscall: Syscall, action: Action) -> Result<()> {
        self.add_conditional_rule(syscall, action, &[])
    }

    /// Appends a rule that applies only when every condition holds.
    ///
    /// Rules run in the order they were added and the first match decides,
    /// even when a later rule for the same syscall has narrower conditions.
    ///
    /// The rule is translated by name for each architecture present now.
    /// Architectures that lack the syscall get no rule; architectures added
    /// later start out empty.
    ///
    /// # Errors
    ///
    /// `InvalidSyscall` if `syscall` is negative or has no native name,
    /// `InvalidAction` for [`Action::Invalid`], `InvalidCondition` if two
    /// conditions address the same argument.
    pub fn add_conditional_rule(
        &mut self,
        syscall: Syscall,
        action: Action,
        conditions: &[Condition],
    ) -> Result<()> {
        validate_action(action)?;
        let name = syscall.name()?;
        check_unique_args(conditions)?;

        let state = self.state_mut()?;
        for (&arch, rules) in &mut state.arches {
            match syscall.translate(Arch::native(), arch) {
                Some(local) => rules.push(Rule::new(local, action, conditions.to_vec())),
                None => tracing::debug!(syscall = name, %arch, "syscall not on arch, skipping"),
            }
        }
        Ok(())
    }

    /// Rules for `arch` in evaluation order.
    pub fn rules(&self, arch: Arch) -> Result<&[Rule]> {
        self.state()?
            .arches
            .get(&arch)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::InvalidArchitecture(format!("{arch} is not in the filter")))
    }

    /// Compiles the filter into a program without installing it.
    pub fn program(&self) -> Result<Vec<SockFilter>> {
        let state = self.state()?;
        bpf::compile(state.default_action, state.bad_arch_action, &state.arches)
    }

    /// Compiles and installs the filter on the calling thread.
    ///
    /// Without the thread-sync attribute only the calling kernel thread (and
    /// threads it creates afterwards) is filtered. With a `Notify` rule at
    /// API level 6 the first load hands back a listener.
    ///
    /// The kernel allows one listener per filter chain, so later loads keep
    /// the first listener and do not ask for another. The newest program's
    /// verdict wins, and it carries every rule added so far, so after a
    /// reload each syscall it sends to user space fails with `ENOSYS`
    /// instead of reaching the listener. Threads that only run the first
    /// program are still served.
    ///
    /// # Errors
    ///
    /// `Os` if the kernel rejects the program; the filter stays usable.
    pub fn load(&mut self) -> Result<()> {
        let program = self.program()?;
        let notify = self.caps.supports_notify();
        let state = self.state_mut()?;

        let mut flags = 0;
        if state.attrs.log {
            flags |= SECCOMP_FILTER_FLAG_LOG;
        }
        if state.attrs.ssb {
            flags |= SECCOMP_FILTER_FLAG_SPEC_ALLOW;
        }
        let listen = notify && state.has_notify() && state.listener.is_none();
        if listen {
            flags |= SECCOMP_FILTER_FLAG_NEW_LISTENER;
        }
        if state.attrs.tsync {
            flags |= SECCOMP_FILTER_FLAG_TSYNC;
            if listen {
                flags |= SECCOMP_FILTER_FLAG_TSYNC_ESRCH;
            }
        }

        if state.attrs.no_new_privs {
            set_no_new_privs()?;
        }

        let fprog = SockFprog::new(&program);
        // SAFETY: fprog points into `program`, which outlives the call.
        let listener = unsafe { seccomp_set_mode_filter(&fprog, flags) }?;

        if listener.is_some() {
            state.listener = listener;
        }
        state.loaded = true;
        tracing::debug!(
            instructions = program.len(),
            arches = state.arches.len(),
            flags,
            listener = state.listener.is_some(),
            "filter loaded"
        );
        Ok(())
    }

    /// Borrows the notification listener of the last load.
    ///
    /// # Errors
    ///
    /// `NotSupported` below API level 6, or when the last load installed no
    /// `Notify` rule.
    pub fn notify_fd(&self) -> Result<BorrowedFd<'_>> {
        self.caps.require("notification", LEVEL_NOTIFY)?;
        self.state()?
            .listener
            .as_ref()
            .map(AsFd::as_fd)
            .ok_or(Error::NotSupported {
                feature: "notification without a loaded notify rule",
                required: LEVEL_NOTIFY,
                current: self.caps.level(),
            })
    }

    /// Opens a [`NotifyChannel`] on a duplicate of the listener.
    pub fn notify_channel(&self) -> Result<NotifyChannel> {
        let listener = self.notify_fd()?.try_clone_to_owned()?;
        NotifyChannel::new(listener)
    }

    /// Moves every architecture of `source`, with its rules, into `self`.
    ///
    /// On success `source` is released. On failure neither filter changes.
    ///
    /// # Errors
    ///
    /// `MergeIncompatible` when actions or attributes differ or the
    /// architecture sets overlap.
    pub fn merge(&mut self, source: &mut Filter) -> Result<()> {
        let target = self.state.as_ref().ok_or(Error::FilterInvalid)?;
        let src = source.state.as_ref().ok_or(Error::FilterInvalid)?;

        let conflict = if target.default_action != src.default_action {
            Some(MergeConflict::DefaultAction)
        } else if target.bad_arch_action != src.bad_arch_action {
            Some(MergeConflict::BadArchAction)
        } else if target.attrs != src.attrs {
            Some(MergeConflict::Attributes)
        } else {
            src.arches
                .keys()
                .find(|arch| target.arches.contains_key(arch))
                .map(|&arch| MergeConflict::ArchOverlap(arch))
        };
        if let Some(conflict) = conflict {
            return Err(Error::MergeIncompatible(conflict));
        }

        let src = source.state.take().ok_or(Error::FilterInvalid)?;
        let target = self.state_mut()?;
        let moved: Vec<Arch> = src.arches.keys().copied().collect();
        target.arches.extend(src.arches);
        tracing::debug!(?moved, "filters merged");
        Ok(())
    }

    /// Releases the filter. Safe to call more than once.
    pub fn release(&mut self) {
        self.state = None;
    }

    /// Writes the compiled program as raw `struct sock_filter` records.
    pub fn export_bpf<W: Write>(&self, writer: W) -> Result<()> {
        bpf::write_program(&self.program()?, writer)
    }

    /// Writes a human-readable listing of the filter.
    pub fn export_pfc<W: Write>(&self, writer: W) -> Result<()> {
        let state = self.state()?;
        pfc::write(
            state.default_action,
            state.bad_arch_action,
            &state.arches,
            writer,
        )
    }

    fn state(&self) -> Result<&State> {
        self.state.as_ref().ok_or(Error::FilterInvalid)
    }

    fn state_mut(&mut self) -> Result<&mut State> {
        self.state.as_mut().ok_or(Error::FilterInvalid)
    }
}

fn validate_action(action: Action) -> Result<()> {
    if action.is_valid() {
        Ok(())
    } else {
        Err(Error::InvalidAction)
    }
}
