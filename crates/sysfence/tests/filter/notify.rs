//! Supervising deferred syscalls over a notification channel.

use std::ffi::CString;
use std::sync::mpsc;
use std::thread;

use sysfence::{Action, Arch, Error, Filter, NotifyChannel, NotifyResponse, Syscall};

use crate::common;

const CHDIR_LEVEL: u32 = 6;

/// Loads a filter that defers `chdir`, returning a channel on its listener.
///
/// The filter itself is released so that dropping the channel closes the
/// last listener reference.
fn defer_chdir() -> sysfence::Result<NotifyChannel> {
    let mut filter = Filter::new(Action::Allow)?;
    filter.add_rule(Syscall::from_name("chdir")?, Action::Notify)?;
    filter.load()?;
    let channel = filter.notify_channel()?;
    filter.release();
    Ok(channel)
}

fn chdir(path: &CString) -> (i64, i32) {
    // SAFETY: path is NUL-terminated and outlives the call.
    let ret = i64::from(unsafe { libc::chdir(path.as_ptr()) });
    (ret, common::last_errno(ret))
}

/// The supervisor continues, completes and fails `chdir` calls, checking
/// each request before answering it.
#[test]
fn supervised_chdir() {
    if common::skip_below(CHDIR_LEVEL, "supervised_chdir") {
        return;
    }
    let missing = CString::new("/nonexistent").unwrap();
    let cwd = std::env::current_dir().unwrap();
    let here = CString::new(cwd.to_str().unwrap()).unwrap();
    let missing_ptr = missing.as_ptr() as u64;
    let here_ptr = here.as_ptr() as u64;

    let (tx, rx) = mpsc::channel();
    let target = thread::spawn(move || {
        let channel = defer_chdir();
        let loaded = channel.is_ok();
        let _ = tx.send(channel);
        if !loaded {
            return Vec::new();
        }
        vec![chdir(&missing), chdir(&here), chdir(&missing), chdir(&here)]
    });

    let channel = rx.recv().unwrap().unwrap();
    let chdir_nr = Syscall::from_name("chdir").unwrap();
    let expect = |ptr: u64, path: &str| {
        let req = channel.receive().unwrap();
        assert_eq!(req.data.syscall, chdir_nr);
        assert_eq!(req.data.arch, Arch::native());
        assert_eq!(req.data.args[0], ptr);
        assert_eq!(req.read_target_string(req.data.args[0]).unwrap(), path);
        channel.check_still_valid(req.id).unwrap();
        req
    };

    let req = expect(missing_ptr, "/nonexistent");
    channel
        .respond(NotifyResponse::continue_syscall(req.id))
        .unwrap();

    let req = expect(here_ptr, cwd.to_str().unwrap());
    channel
        .respond(NotifyResponse::continue_syscall(req.id))
        .unwrap();

    // Completed without running, so the missing path does not matter.
    let req = expect(missing_ptr, "/nonexistent");
    channel.respond(NotifyResponse::value(req.id, 0)).unwrap();

    let req = expect(here_ptr, cwd.to_str().unwrap());
    channel
        .respond(NotifyResponse::error(req.id, libc::ENOMEDIUM))
        .unwrap();
    assert!(matches!(
        channel.respond(NotifyResponse::error(req.id, libc::ENOMEDIUM)),
        Err(Error::StaleRequest { .. })
    ));

    let results = target.join().unwrap();
    assert_eq!(
        results,
        vec![
            (-1, libc::ENOENT),
            (0, 0),
            (0, 0),
            (-1, libc::ENOMEDIUM),
        ]
    );
}

/// Requests from two threads can be answered in either order.
#[test]
fn out_of_order_responses() {
    if common::skip_below(CHDIR_LEVEL, "out_of_order_responses") {
        return;
    }
    let (tx, rx) = mpsc::channel();
    let target = thread::spawn(move || {
        let channel = defer_chdir();
        let loaded = channel.is_ok();
        let _ = tx.send(channel);
        if !loaded {
            return Vec::new();
        }
        // Both threads inherit the filter from this one.
        thread::scope(|s| {
            let a = s.spawn(|| chdir(&CString::new("/nonexistent-a").unwrap()));
            let b = s.spawn(|| chdir(&CString::new("/nonexistent-b").unwrap()));
            vec![a.join().unwrap(), b.join().unwrap()]
        })
    });

    let channel = rx.recv().unwrap().unwrap();
    let first = channel.receive().unwrap();
    let second = channel.receive().unwrap();
    assert_ne!(first.id, second.id);

    let errno_for = |path: &str| match path {
        "/nonexistent-a" => libc::ENOMEDIUM,
        "/nonexistent-b" => libc::EXDEV,
        other => panic!("unexpected path {other}"),
    };
    for req in [second, first] {
        let path = req.read_target_string(req.data.args[0]).unwrap();
        channel.check_still_valid(req.id).unwrap();
        channel
            .respond(NotifyResponse::error(req.id, errno_for(&path)))
            .unwrap();
    }

    let results = target.join().unwrap();
    assert_eq!(results, vec![(-1, libc::ENOMEDIUM), (-1, libc::EXDEV)]);
}

/// Closing the channel releases a supervisor blocked in `receive`.
#[test]
fn close_unblocks_receive() {
    if common::skip_below(CHDIR_LEVEL, "close_unblocks_receive") {
        return;
    }
    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let target = thread::spawn(move || {
        let _ = tx.send(defer_chdir());
        // Keeps the filter alive until the supervisor is done.
        let _ = done_rx.recv();
    });

    let channel = rx.recv().unwrap().unwrap();
    thread::scope(|s| {
        let waiter = s.spawn(|| channel.receive());
        thread::sleep(std::time::Duration::from_millis(50));
        channel.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::ChannelClosed)));
    });
    assert!(channel.is_closed());

    drop(done_tx);
    target.join().unwrap();
}
