//! Seccomp-BPF kernel interface.
//!
//! Seccomp-BPF filters syscalls with classic Berkeley Packet Filter programs.
//! The kernel runs the program on every syscall of the filtered thread, handing
//! it a `struct seccomp_data`:
//!
//! ```text
//! offset  field
//! 0       nr                   (i32)  syscall number
//! 4       arch                 (u32)  AUDIT_ARCH_* of the calling ABI
//! 8       instruction_pointer  (u64)
//! 16      args[6]              (u64)  each argument as two 32-bit words
//! ```
//!
//! The program's 32-bit return value selects the action (`SECCOMP_RET_*`) in
//! its upper 16 bits and carries action data (errno, trace message) in the
//! lower 16 bits.
//!
//! ## Security Notes
//!
//! - Filters are permanent - they can be stacked but never removed
//! - Installing requires `PR_SET_NO_NEW_PRIVS` or `CAP_SYS_ADMIN`
//! - When filters are stacked, the kernel applies the most restrictive verdict

use std::os::fd::{FromRawFd, OwnedFd};

use rustix::io::Errno;

use crate::last_errno;

// seccomp(2) operations
pub const SECCOMP_SET_MODE_FILTER: u32 = 1;
pub const SECCOMP_GET_ACTION_AVAIL: u32 = 2;

// seccomp(2) filter flags
pub const SECCOMP_FILTER_FLAG_TSYNC: u32 = 1 << 0;
pub const SECCOMP_FILTER_FLAG_LOG: u32 = 1 << 1;
pub const SECCOMP_FILTER_FLAG_SPEC_ALLOW: u32 = 1 << 2;
pub const SECCOMP_FILTER_FLAG_NEW_LISTENER: u32 = 1 << 3;
pub const SECCOMP_FILTER_FLAG_TSYNC_ESRCH: u32 = 1 << 4;

// Filter return values, most restrictive first
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

/// Masks the action part of a return value.
pub const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
/// Masks the data part of a return value.
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// BPF instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

// BPF ld/ldx fields
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;

// BPF alu/jmp fields
pub const BPF_AND: u16 = 0x50;
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;

/// Maximum number of instructions the kernel accepts in one program.
pub const BPF_MAXINSNS: usize = 4096;

// AUDIT_ARCH_* values reported in seccomp_data.arch
pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
pub const AUDIT_ARCH_ARM: u32 = 0x4000_0028;
pub const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;
pub const AUDIT_ARCH_RISCV64: u32 = 0xc000_00f3;

/// x32 syscalls share `AUDIT_ARCH_X86_64` and are told apart by this bit.
pub const X32_SYSCALL_BIT: u32 = 0x4000_0000;

// seccomp_data offsets
pub const OFFSET_SYSCALL_NR: u32 = 0;
pub const OFFSET_ARCH: u32 = 4;
pub const OFFSET_INSTRUCTION_POINTER: u32 = 8;
pub const OFFSET_ARGS: u32 = 16;
pub const ARG_SIZE: u32 = 8;

/// Offsets of the (high, low) 32-bit words of syscall argument `index`.
#[inline]
pub const fn arg_offsets(index: u32) -> (u32, u32) {
    let base = OFFSET_ARGS + index * ARG_SIZE;
    if cfg!(target_endian = "little") {
        (base + 4, base)
    } else {
        (base, base + 4)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    /// Raw 8-byte record as the kernel reads it (native endian).
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.code.to_ne_bytes());
        out[2] = self.jt;
        out[3] = self.jf;
        out[4..8].copy_from_slice(&self.k.to_ne_bytes());
        out
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

impl SockFprog {
    /// Borrow a program for installation.
    ///
    /// The returned struct points into `program`, which must outlive it.
    /// Callers must keep `program.len()` within [`BPF_MAXINSNS`].
    pub fn new(program: &[SockFilter]) -> Self {
        Self {
            len: program.len() as u16,
            filter: program.as_ptr(),
        }
    }
}

/// Sets `PR_SET_NO_NEW_PRIVS` on the calling thread.
///
/// # Errors
///
/// Returns `Errno` if `prctl` fails.
pub fn set_no_new_privs() -> Result<(), Errno> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Applies a seccomp-BPF filter to the current thread.
///
/// With `SECCOMP_FILTER_FLAG_NEW_LISTENER` in `flags` the kernel returns a
/// listener fd, which is handed back as `Some`. Otherwise returns `None`.
///
/// # Safety
///
/// This permanently restricts syscalls for this thread (or every thread of
/// the process with `SECCOMP_FILTER_FLAG_TSYNC`). The program must be valid
/// and `fprog` must point into live memory.
///
/// # Errors
///
/// Returns `Errno` if the kernel rejects the filter. A positive return from a
/// `TSYNC` install without `TSYNC_ESRCH` (a thread that could not be
/// synchronized) is reported as `ESRCH`.
pub unsafe fn seccomp_set_mode_filter(
    fprog: &SockFprog,
    flags: u32,
) -> Result<Option<OwnedFd>, Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            flags,
            fprog as *const _,
        )
    };
    if ret < 0 {
        return Err(last_errno());
    }
    if flags & SECCOMP_FILTER_FLAG_NEW_LISTENER != 0 {
        // SAFETY: On success with NEW_LISTENER, ret is a fresh listener fd.
        return Ok(Some(unsafe { OwnedFd::from_raw_fd(ret as i32) }));
    }
    if ret > 0 {
        return Err(Errno::SRCH);
    }
    Ok(None)
}

/// Returns true if seccomp is available.
pub fn seccomp_available() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}

/// Returns true if the kernel knows the `SECCOMP_RET_*` action.
pub fn action_available(action: u32) -> bool {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_GET_ACTION_AVAIL,
            0u32,
            &action as *const u32,
        )
    };
    ret == 0
}

/// Returns true if the kernel accepts the filter flag.
///
/// Probes with a NULL program: a known flag gets as far as copying the
/// program and fails with `EFAULT`, an unknown one fails with `EINVAL`.
pub fn filter_flag_available(flag: u32) -> bool {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            flag,
            std::ptr::null::<SockFprog>(),
        )
    };
    ret < 0 && last_errno() == Errno::FAULT
}
