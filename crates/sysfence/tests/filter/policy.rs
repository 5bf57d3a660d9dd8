//! Filters described by policy files.

use std::io::Write;

use sysfence::{Action, Capabilities, Error, Policy, Syscall};
use tempfile::NamedTempFile;

use crate::common::{self, filtered, syscall1};

fn policy_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A policy loaded from disk behaves like the filter it describes.
#[test]
fn policy_file_loads() {
    if common::skip_below(1, "policy_file_loads") {
        return;
    }
    let file = policy_file(
        r#"{
            "default_action": "allow",
            "rules": [
                { "syscall": "getppid", "action": { "errno": 1 } },
                {
                    "syscall": "getpgid",
                    "action": { "errno": 18 },
                    "conditions": [{ "arg": 0, "op": "gt", "value": 1000000 }]
                }
            ]
        }"#,
    );
    let policy = Policy::from_file(file.path()).unwrap();
    let getppid = Syscall::from_name("getppid").unwrap().number();
    let getpgid = Syscall::from_name("getpgid").unwrap().number();

    let results = filtered(move || {
        let mut filter = policy.build()?;
        filter.load()?;
        Ok::<_, Error>([
            syscall1(getppid, 0),
            syscall1(getpgid, 2_000_000),
            syscall1(getpgid, 0),
        ])
    })
    .unwrap();

    assert_eq!(results[0], (-1, libc::EPERM));
    assert_eq!(results[1], (-1, libc::EXDEV));
    assert!(results[2].0 >= 0);
}

/// Parse errors name the file they came from.
#[test]
fn policy_errors_name_the_file() {
    let file = policy_file(r#"{ "default_action": "allow", "rules": [ }"#);
    match Policy::from_file(file.path()) {
        Err(Error::Policy(msg)) => {
            assert!(msg.starts_with(&file.path().display().to_string()), "{msg}");
        }
        other => panic!("expected a policy error, got {other:?}"),
    }

    assert!(matches!(
        Policy::from_file("/nonexistent/policy.json"),
        Err(Error::Io(_))
    ));
}

/// The PFC listing of a policy shows its rules and actions.
#[test]
fn policy_exports_pfc() {
    let policy = Policy::from_json(
        r#"{
            "default_action": { "errno": 38 },
            "bad_arch_action": "kill_process",
            "rules": [{ "syscall": "read", "action": "allow" }]
        }"#,
    )
    .unwrap();
    let filter = policy
        .build_with(Capabilities::with_level(6))
        .unwrap();
    assert_eq!(filter.default_action().unwrap(), Action::Errno(38));

    let mut out = Vec::new();
    filter.export_pfc(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let read = Syscall::from_name("read").unwrap();
    assert!(text.contains(&format!("if ($syscall == {})", read.number())));
    assert!(text.contains("action ALLOW;"));
    assert!(text.contains("action ERRNO(38);"));
    assert!(text.ends_with("action KILL_PROCESS;\n#\n# pseudo filter code end\n#\n"));
}
