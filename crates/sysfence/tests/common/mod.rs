//! Shared helpers for the filter tests.
//!
//! A loaded filter can never be removed, so every test that loads one does it
//! on a dedicated thread. The test harness threads stay unfiltered.

use std::io;
use std::thread;

use sysfence::Capabilities;

/// API level of the running kernel, 0 without seccomp.
pub fn api_level() -> u32 {
    Capabilities::detect().map(|c| c.level()).unwrap_or(0)
}

/// True (and a note on stderr) when the kernel is below `level`.
pub fn skip_below(level: u32, test: &str) -> bool {
    let current = api_level();
    if current < level {
        eprintln!("skipping {test}: API level {current}, needs {level}");
        return true;
    }
    false
}

/// Runs `f` on a fresh thread and returns its result.
///
/// Do not assert inside `f`: the panic message is written with `write(2)`,
/// which the filter under test may block.
pub fn filtered<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::spawn(f).join().expect("filtered thread panicked")
}

/// Return value and errno of a raw one-argument syscall.
pub fn syscall1(nr: i32, arg: u64) -> (i64, i32) {
    // SAFETY: callers only pass syscalls that take a scalar or no argument.
    let ret = unsafe { libc::syscall(libc::c_long::from(nr), arg) } as i64;
    (ret, last_errno(ret))
}

/// Errno for a libc-style return, 0 on success.
pub fn last_errno(ret: i64) -> i32 {
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        0
    }
}

/// A pipe whose read end never blocks.
pub fn pipe() -> (i32, i32) {
    let mut fds = [0; 2];
    // SAFETY: fds has room for the two descriptors.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(ret, 0, "pipe2: {}", io::Error::last_os_error());
    (fds[0], fds[1])
}

/// Reads whatever is buffered in `fd`; empty on EAGAIN.
pub fn drain(fd: i32) -> Vec<u8> {
    let mut buf = [0u8; 64];
    // SAFETY: buf is valid for its length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n <= 0 {
        return Vec::new();
    }
    buf[..n as usize].to_vec()
}

pub fn close(fds: &[i32]) {
    for &fd in fds {
        // SAFETY: the test owns these descriptors.
        unsafe { libc::close(fd) };
    }
}
