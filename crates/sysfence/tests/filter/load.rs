//! Installing filters and the actions they take.

use std::os::fd::AsRawFd;

use sysfence::{Action, Capabilities, CompareOp, Condition, Error, Filter, Syscall};

use crate::common::{self, close, drain, filtered, pipe, syscall1};

fn nr(name: &str) -> i32 {
    Syscall::from_name(name).unwrap().number()
}

/// `write` fails with EPERM and nothing reaches the pipe.
#[test]
fn errno_rule_blocks_write() {
    if common::skip_below(1, "errno_rule_blocks_write") {
        return;
    }
    let (rx, tx) = pipe();

    let result = filtered(move || {
        let mut filter = Filter::new(Action::Allow)?;
        filter.add_rule(Syscall::from_name("write")?, Action::Errno(libc::EPERM as u16))?;
        filter.load()?;
        // SAFETY: writing one byte from a static buffer.
        let ret = unsafe { libc::write(tx, b"x".as_ptr().cast(), 1) } as i64;
        Ok::<_, Error>((ret, common::last_errno(ret)))
    });

    let (ret, errno) = result.unwrap();
    assert_eq!(ret, -1);
    assert_eq!(errno, libc::EPERM);
    assert!(drain(rx).is_empty());
    close(&[rx, tx]);
}

/// A condition on the descriptor argument blocks one pipe and not the other.
#[test]
fn condition_selects_argument() {
    if common::skip_below(1, "condition_selects_argument") {
        return;
    }
    let (blocked_rx, blocked_tx) = pipe();
    let (open_rx, open_tx) = pipe();

    let result = filtered(move || {
        let mut filter = Filter::new(Action::Allow)?;
        filter.add_conditional_rule(
            Syscall::from_name("write")?,
            Action::Errno(libc::EXDEV as u16),
            &[Condition::equal(0, blocked_tx as u64)?],
        )?;
        filter.load()?;
        // SAFETY: writing one byte from a static buffer.
        let blocked = unsafe { libc::write(blocked_tx, b"a".as_ptr().cast(), 1) } as i64;
        let blocked_errno = common::last_errno(blocked);
        // SAFETY: as above.
        let open = unsafe { libc::write(open_tx, b"b".as_ptr().cast(), 1) } as i64;
        Ok::<_, Error>((blocked, blocked_errno, open))
    });

    let (blocked, blocked_errno, open) = result.unwrap();
    assert_eq!((blocked, blocked_errno), (-1, libc::EXDEV));
    assert_eq!(open, 1);
    assert!(drain(blocked_rx).is_empty());
    assert_eq!(drain(open_rx), b"b");
    close(&[blocked_rx, blocked_tx, open_rx, open_tx]);
}

/// The first matching rule decides, later ones never run.
#[test]
fn first_matching_rule_wins() {
    if common::skip_below(1, "first_matching_rule_wins") {
        return;
    }
    let getppid = nr("getppid");

    let (ret, errno) = filtered(move || {
        let mut filter = Filter::new(Action::Allow)?;
        filter.add_conditional_rule(
            Syscall(getppid),
            Action::Errno(libc::ENOMEDIUM as u16),
            &[Condition::new(0, CompareOp::Less, &[100])?],
        )?;
        filter.add_rule(Syscall(getppid), Action::Errno(libc::EXDEV as u16))?;
        filter.load()?;
        Ok::<_, Error>(syscall1(getppid, 7))
    })
    .unwrap();

    assert_eq!((ret, errno), (-1, libc::ENOMEDIUM));
}

/// Loading a second filter stacks on the first; both stay in force.
#[test]
fn repeated_load_stacks() {
    if common::skip_below(1, "repeated_load_stacks") {
        return;
    }
    let getppid = nr("getppid");
    let getpgid = nr("getpgid");

    let (first, second) = filtered(move || {
        let mut filter = Filter::new(Action::Allow)?;
        filter.add_rule(Syscall(getppid), Action::Errno(libc::EPERM as u16))?;
        filter.load()?;
        filter.add_rule(Syscall(getpgid), Action::Errno(libc::ENOENT as u16))?;
        filter.load()?;
        let loaded = filter.is_loaded();
        Ok::<_, Error>((syscall1(getppid, 0), (syscall1(getpgid, 0), loaded)))
    })
    .unwrap();

    assert_eq!(first, (-1, libc::EPERM));
    let (getpgid_result, loaded) = second;
    assert_eq!(getpgid_result, (-1, libc::ENOENT));
    assert!(loaded);
}

/// A second load of a filter with a notify rule stacks without asking for
/// another listener, and the first listener stays in place.
#[test]
fn reloading_notify_filter_keeps_listener() {
    if common::skip_below(6, "reloading_notify_filter_keeps_listener") {
        return;
    }
    let chdir = nr("chdir");
    let getppid = nr("getppid");

    let (before, after, blocked, loaded) = filtered(move || {
        let mut filter = Filter::new(Action::Allow)?;
        filter.add_rule(Syscall(chdir), Action::Notify)?;
        filter.load()?;
        let before = filter.notify_fd()?.as_raw_fd();
        filter.add_rule(Syscall(getppid), Action::Errno(libc::EPERM as u16))?;
        filter.load()?;
        let after = filter.notify_fd()?.as_raw_fd();
        Ok::<_, Error>((before, after, syscall1(getppid, 0), filter.is_loaded()))
    })
    .unwrap();

    assert_eq!(before, after);
    assert_eq!(blocked, (-1, libc::EPERM));
    assert!(loaded);
}

/// Without no_new_privs an unprivileged load is refused, and the filter can
/// be fixed and loaded again.
#[test]
fn refused_load_leaves_filter_usable() {
    if common::skip_below(1, "refused_load_leaves_filter_usable") {
        return;
    }
    // SAFETY: neither call has preconditions.
    let (euid, inherited) = unsafe {
        (
            libc::geteuid(),
            libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0),
        )
    };
    if euid == 0 || inherited == 1 {
        eprintln!("skipping refused_load_leaves_filter_usable: load would be allowed");
        return;
    }
    let getppid = nr("getppid");

    let (refused, loaded_after, result) = filtered(move || {
        let mut filter = Filter::new(Action::Allow)?;
        filter.add_rule(Syscall(getppid), Action::Errno(libc::EPERM as u16))?;
        filter.set_no_new_privs(false)?;
        let refused = filter.load().err().map(|e| e.to_string());
        let loaded_after_refusal = filter.is_loaded();

        filter.set_no_new_privs(true)?;
        filter.load()?;
        Ok::<_, Error>((refused, loaded_after_refusal, syscall1(getppid, 0)))
    })
    .unwrap();

    assert!(refused.is_some(), "load without no_new_privs succeeded");
    assert!(!loaded_after);
    assert_eq!(result, (-1, libc::EPERM));
}

/// A notify rule below level 6 loads, but hands out no listener.
#[test]
fn notify_fd_needs_level_six() {
    if common::skip_below(1, "notify_fd_needs_level_six") {
        return;
    }
    let chdir = nr("chdir");

    let err = filtered(move || {
        let caps = Capabilities::detect()?;
        let caps = caps.request_level(caps.level().min(5))?;
        let mut filter = Filter::with_capabilities(Action::Allow, caps)?;
        filter.add_rule(Syscall(chdir), Action::Notify)?;
        filter.load()?;
        Ok::<_, Error>(filter.notify_fd().err())
    })
    .unwrap();

    assert!(matches!(
        err,
        Some(Error::NotSupported { required: 6, .. })
    ));
}

/// The exported program is the compiled one, eight bytes per instruction.
#[test]
fn export_matches_program() {
    let mut filter = Filter::new(Action::Allow).unwrap();
    filter
        .add_rule(Syscall::from_name("ptrace").unwrap(), Action::Errno(1))
        .unwrap();

    let mut bytes = Vec::new();
    filter.export_bpf(&mut bytes).unwrap();
    let program = filter.program().unwrap();
    assert_eq!(bytes.len(), program.len() * 8);
    assert_eq!(&bytes[..8], &program[0].to_bytes()[..]);
}
