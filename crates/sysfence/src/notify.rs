//! User-space notification channel.
//!
//! A loaded filter with `Notify` rules suspends every matching syscall and
//! queues a [`NotifyRequest`] on its listener. A supervisor receives the
//! request, decides, and answers with exactly one [`NotifyResponse`].
//!
//! ## TOCTOU
//!
//! Syscall arguments that point into the target's memory can change between
//! [`receive`](NotifyChannel::receive) and
//! [`respond`](NotifyChannel::respond), and the target may die and its pid be
//! reused. After copying anything out of the target and before acting on it,
//! call [`check_still_valid`](NotifyChannel::check_still_valid). If that
//! fails, drop the request: the response would be meaningless.
//!
//! ## Threads
//!
//! The channel is `Sync`. One reader thread calls `receive` while handler
//! threads answer out of order. [`close`](NotifyChannel::close) from any
//! thread wakes a blocked `receive` with [`Error::ChannelClosed`].
//!
//! ```ignore
//! let channel = filter.notify_channel()?;
//! loop {
//!     let req = channel.receive()?;
//!     let path = req.read_target_string(req.data.args[0])?;
//!     channel.check_still_valid(req.id)?;
//!     channel.respond(NotifyResponse::continue_syscall(req.id))?;
//! }
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::io::Errno;
use sysfence_sys::seccomp_notify::{
    SECCOMP_USER_NOTIF_FLAG_CONTINUE, SeccompNotif, SeccompNotifResp, notif_id_valid, notif_recv,
    notif_send,
};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::syscall::Syscall;

/// Run the original syscall instead of injecting a result.
pub const NOTIFY_FLAG_CONTINUE: u32 = SECCOMP_USER_NOTIF_FLAG_CONTINUE;

/// Longest string [`NotifyRequest::read_target_string`] returns.
const MAX_TARGET_STRING: usize = 4096;

/// Outstanding ids held before [`NotifyChannel::receive`] drops the dead ones.
const PRUNE_THRESHOLD: usize = 256;

/// The syscall a target is blocked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallData {
    /// Number on `arch`.
    pub syscall: Syscall,
    pub arch: Arch,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// A syscall waiting for a supervisor decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyRequest {
    /// Kernel-assigned cookie, unique per request.
    pub id: u64,
    /// Thread ID of the caller, in the listener's PID namespace.
    pub pid: u32,
    pub flags: u32,
    pub data: SyscallData,
}

impl NotifyRequest {
    /// Reads a NUL-terminated string at `addr` in the target's memory.
    ///
    /// The target can rewrite the string at any time. Call
    /// [`NotifyChannel::check_still_valid`] after reading and before acting
    /// on it.
    pub fn read_target_string(&self, addr: u64) -> Result<String> {
        let mut mem = File::open(format!("/proc/{}/mem", self.pid))?;
        mem.seek(SeekFrom::Start(addr))?;

        let mut buf = vec![0u8; MAX_TARGET_STRING];
        let n = mem.read(&mut buf)?;
        buf.truncate(n);
        match buf.iter().position(|&b| b == 0) {
            Some(nul) => buf.truncate(nul),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unterminated string in target memory",
                )
                .into());
            }
        }
        String::from_utf8(buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid UTF-8").into())
    }
}

/// The answer to one [`NotifyRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyResponse {
    pub id: u64,
    /// Positive errno to fail the syscall with, 0 for none.
    pub error: i32,
    /// Return value when `error` is 0.
    pub val: u64,
    /// [`NOTIFY_FLAG_CONTINUE`] or 0.
    pub flags: u32,
}

impl NotifyResponse {
    /// Lets the kernel run the original syscall with its original arguments.
    pub const fn continue_syscall(id: u64) -> Self {
        Self {
            id,
            error: 0,
            val: 0,
            flags: NOTIFY_FLAG_CONTINUE,
        }
    }

    /// Fails the syscall with `errno`; the caller sees -1.
    pub const fn error(id: u64, errno: i32) -> Self {
        Self {
            id,
            error: errno,
            val: 0,
            flags: 0,
        }
    }

    /// Completes the syscall with return value `val` without running it.
    pub const fn value(id: u64, val: u64) -> Self {
        Self {
            id,
            error: 0,
            val,
            flags: 0,
        }
    }

    fn to_raw(self) -> SeccompNotifResp {
        SeccompNotifResp {
            id: self.id,
            val: self.val as i64,
            error: -self.error,
            flags: self.flags,
        }
    }
}

/// Request/response exchange over a filter's listener.
#[derive(Debug)]
pub struct NotifyChannel {
    listener: OwnedFd,
    wake: OwnedFd,
    closed: AtomicBool,
    /// Received and not yet answered. An id leaves on `respond`, on a failed
    /// `check_still_valid`, or when `receive` finds its target gone once the
    /// set passes `PRUNE_THRESHOLD`.
    outstanding: Mutex<HashSet<u64>>,
}

impl NotifyChannel {
    /// Takes ownership of a listener returned by a notify-capable load.
    pub fn new(listener: OwnedFd) -> Result<Self> {
        let wake = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            listener,
            // SAFETY: eventfd returned a fresh descriptor.
            wake: unsafe { OwnedFd::from_raw_fd(wake) },
            closed: AtomicBool::new(false),
            outstanding: Mutex::new(HashSet::new()),
        })
    }

    /// Blocks until a request arrives.
    ///
    /// Requests whose target died before they could be received are skipped.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` after [`close`](Self::close) or once no task uses the
    /// filter any more, `Os` for other failures.
    pub fn receive(&self) -> Result<NotifyRequest> {
        loop {
            if self.is_closed() {
                return Err(Error::ChannelClosed);
            }

            let mut fds = [
                libc::pollfd {
                    fd: self.listener.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            if self.is_closed() || fds[1].revents != 0 {
                return Err(Error::ChannelClosed);
            }
            if fds[0].revents & libc::POLLIN == 0 {
                if fds[0].revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                    return Err(Error::ChannelClosed);
                }
                continue;
            }

            let mut notif = SeccompNotif::default();
            match notif_recv(self.listener.as_fd(), &mut notif) {
                Ok(()) => {}
                Err(err) if err == Errno::NOENT => {
                    tracing::trace!("target died before its notification was received");
                    continue;
                }
                Err(err) if err == Errno::INTR => continue,
                Err(err) => return Err(err.into()),
            }

            let Some(arch) = Arch::from_audit_value(notif.data.arch) else {
                tracing::warn!(
                    id = notif.id,
                    arch = notif.data.arch,
                    "notification from unknown architecture, failing it with ENOSYS"
                );
                let resp = NotifyResponse::error(notif.id, libc::ENOSYS).to_raw();
                if let Err(err) = notif_send(self.listener.as_fd(), &resp) {
                    tracing::warn!(id = notif.id, %err, "could not answer discarded notification");
                }
                continue;
            };

            let request = NotifyRequest {
                id: notif.id,
                pid: notif.pid,
                flags: notif.flags,
                data: SyscallData {
                    syscall: Syscall(notif.data.nr),
                    arch,
                    instruction_pointer: notif.data.instruction_pointer,
                    args: notif.data.args,
                },
            };
            let pending = {
                let mut outstanding = self.track();
                outstanding.insert(request.id);
                outstanding.len()
            };
            if pending > PRUNE_THRESHOLD {
                self.prune_stale();
            }
            tracing::trace!(
                id = request.id,
                pid = request.pid,
                syscall = request.data.syscall.number(),
                %arch,
                "notification received"
            );
            return Ok(request);
        }
    }

    /// Checks that request `id` is still waiting for an answer.
    ///
    /// # Errors
    ///
    /// `StaleRequest` if the target died or the request was already answered
    /// or cancelled. The request is forgotten.
    pub fn check_still_valid(&self, id: u64) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if notif_id_valid(self.listener.as_fd(), id).is_err() {
            self.track().remove(&id);
            return Err(Error::StaleRequest { id });
        }
        Ok(())
    }

    /// Answers an outstanding request.
    ///
    /// # Errors
    ///
    /// `StaleRequest` for ids that were never received, were already
    /// answered, or whose target is gone. `Os` if the kernel rejects the
    /// response itself, in which case the request stays outstanding.
    pub fn respond(&self, response: NotifyResponse) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if !self.track().remove(&response.id) {
            return Err(Error::StaleRequest { id: response.id });
        }

        match notif_send(self.listener.as_fd(), &response.to_raw()) {
            Ok(()) => {
                tracing::trace!(
                    id = response.id,
                    error = response.error,
                    flags = response.flags,
                    "notification answered"
                );
                Ok(())
            }
            Err(err) if err == Errno::NOENT => {
                tracing::warn!(id = response.id, "target gone, response discarded");
                Err(Error::StaleRequest { id: response.id })
            }
            Err(err) => {
                self.track().insert(response.id);
                Err(err.into())
            }
        }
    }

    /// Closes the channel and wakes a blocked [`receive`](Self::receive).
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                (&one as *const u64).cast(),
                size_of::<u64>(),
            )
        };
        if ret < 0 {
            tracing::warn!(err = %io::Error::last_os_error(), "failed to wake notification reader");
        }
        tracing::debug!("notification channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forgets requests the kernel no longer holds, such as those a handler
    /// abandoned without answering.
    fn prune_stale(&self) {
        let mut outstanding = self.track();
        let before = outstanding.len();
        outstanding.retain(|&id| notif_id_valid(self.listener.as_fd(), id).is_ok());
        tracing::debug!(
            dropped = before - outstanding.len(),
            "pruned stale notifications"
        );
    }

    fn track(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.outstanding
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for NotifyChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> NotifyChannel {
        let listener = File::open("/dev/null").unwrap();
        NotifyChannel::new(OwnedFd::from(listener)).unwrap()
    }

    #[test]
    fn channel_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NotifyChannel>();
    }

    #[test]
    fn response_wire_format() {
        let raw = NotifyResponse::error(7, libc::ENOMEDIUM).to_raw();
        assert_eq!(raw.id, 7);
        assert_eq!(raw.error, -libc::ENOMEDIUM);
        assert_eq!(raw.flags, 0);

        let raw = NotifyResponse::continue_syscall(9).to_raw();
        assert_eq!(raw.error, 0);
        assert_eq!(raw.val, 0);
        assert_eq!(raw.flags, SECCOMP_USER_NOTIF_FLAG_CONTINUE);

        let raw = NotifyResponse::value(3, u64::MAX).to_raw();
        assert_eq!(raw.val, -1);
    }

    #[test]
    fn unknown_id_is_stale_without_touching_kernel() {
        let ch = channel();
        assert!(matches!(
            ch.respond(NotifyResponse::continue_syscall(42)),
            Err(Error::StaleRequest { id: 42 })
        ));
    }

    #[test]
    fn check_still_valid_on_non_listener_is_stale() {
        let ch = channel();
        assert!(matches!(
            ch.check_still_valid(5),
            Err(Error::StaleRequest { id: 5 })
        ));
    }

    #[test]
    fn abandoned_requests_are_pruned() {
        let ch = channel();
        ch.track().extend(0..PRUNE_THRESHOLD as u64 + 1);
        ch.prune_stale();
        assert!(ch.track().is_empty());
        assert!(matches!(
            ch.respond(NotifyResponse::continue_syscall(3)),
            Err(Error::StaleRequest { id: 3 })
        ));
    }

    #[test]
    fn failed_validity_check_forgets_request() {
        let ch = channel();
        ch.track().insert(8);
        assert!(ch.check_still_valid(8).is_err());
        assert!(!ch.track().contains(&8));
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let ch = channel();
        ch.close();
        ch.close();
        assert!(ch.is_closed());
        assert!(matches!(ch.receive(), Err(Error::ChannelClosed)));
        assert!(matches!(
            ch.respond(NotifyResponse::continue_syscall(1)),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn close_wakes_blocked_receive() {
        let (reader, _writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let ch = NotifyChannel::new(OwnedFd::from(reader)).unwrap();

        std::thread::scope(|s| {
            let handle = s.spawn(|| ch.receive());
            std::thread::sleep(std::time::Duration::from_millis(50));
            ch.close();
            assert!(matches!(handle.join().unwrap(), Err(Error::ChannelClosed)));
        });
    }

    #[test]
    fn read_target_string_from_self() {
        let text = c"/nonexistent";
        let req = NotifyRequest {
            id: 1,
            pid: std::process::id(),
            flags: 0,
            data: SyscallData {
                syscall: Syscall(0),
                arch: Arch::native(),
                instruction_pointer: 0,
                args: [text.as_ptr() as u64, 0, 0, 0, 0, 0],
            },
        };
        match req.read_target_string(req.data.args[0]) {
            Ok(s) => assert_eq!(s, "/nonexistent"),
            // /proc/self/mem may be unreadable under restrictive ptrace policies.
            Err(Error::Io(err)) => println!("skipping: {err}"),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}
