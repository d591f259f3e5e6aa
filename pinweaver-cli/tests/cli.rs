//! End-to-end runs of the `pinweaver` binary against a temporary directory.

use std::path::Path;
use std::process::{Command, Output};

fn pinweaver(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pinweaver"))
        .arg("--dir")
        .arg(dir)
        .args(args)
        .env_remove("PINWEAVER_DIR")
        .env_remove("RUST_LOG")
        .output()
        .expect("run pinweaver")
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("utf-8 stdout")
}

#[test]
fn test_credential_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");

    let init = pinweaver(dir.path(), &["init"]);
    assert!(init.status.success());
    assert!(stdout(&init).starts_with("initialized"));

    let insert = pinweaver(
        dir.path(),
        &["insert", "1234", "hunter2", "recovery", "--delay", "2:inf"],
    );
    assert!(insert.status.success());
    assert_eq!(stdout(&insert).trim(), "inserted label 0");

    let auth = pinweaver(dir.path(), &["auth", "0", "1234"]);
    assert!(auth.status.success());
    assert!(stdout(&auth).contains(&hex::encode("hunter2")));

    for _ in 0..2 {
        let wrong = pinweaver(dir.path(), &["auth", "0", "0000"]);
        assert_eq!(wrong.status.code(), Some(1));
        assert!(wrong.stdout.is_empty());
    }

    let locked = pinweaver(dir.path(), &["auth", "0", "1234"]);
    assert_eq!(locked.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&locked.stderr).contains("locked_out"));

    let info = pinweaver(dir.path(), &["info", "0"]);
    assert!(info.status.success());
    assert!(stdout(&info).contains("wrong attempts 2"));

    assert!(pinweaver(dir.path(), &["reset", "0", "recovery"]).status.success());
    assert!(pinweaver(dir.path(), &["auth", "0", "1234"]).status.success());

    assert!(pinweaver(dir.path(), &["remove", "0"]).status.success());
    assert_eq!(
        pinweaver(dir.path(), &["info", "0"]).status.code(),
        Some(1)
    );
}

#[test]
fn test_forced_init_discards_credentials() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(pinweaver(dir.path(), &["insert", "1", "he", "rs"]).status.success());

    assert!(pinweaver(dir.path(), &["init", "--force"]).status.success());

    assert_eq!(pinweaver(dir.path(), &["info", "0"]).status.code(), Some(1));
    let sync = pinweaver(dir.path(), &["sync"]);
    assert!(sync.status.success());
    assert!(stdout(&sync).starts_with("in sync"));
}

#[test]
fn test_usage_errors_exit_64() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bad_delay = pinweaver(dir.path(), &["insert", "1", "he", "rs", "--delay", "soon"]);
    assert_eq!(bad_delay.status.code(), Some(64));
    assert!(bad_delay.stdout.is_empty());

    assert_eq!(pinweaver(dir.path(), &["frobnicate"]).status.code(), Some(64));
}

#[test]
fn test_help_exits_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let help = pinweaver(dir.path(), &["--help"]);
    assert!(help.status.success());
    assert!(stdout(&help).contains("Usage"));
}

#[test]
fn test_forced_init_recovers_from_lost_backend_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(pinweaver(dir.path(), &["init"]).status.success());
    assert!(pinweaver(dir.path(), &["insert", "1", "2", "3"]).status.success());
    std::fs::remove_file(dir.path().join("backend").join("state.cbor"))
        .expect("remove backend state");

    let refused = pinweaver(dir.path(), &["info", "0"]);
    assert_eq!(refused.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&refused.stderr).contains("failed_precondition"));

    let forced = pinweaver(dir.path(), &["init", "--force"]);
    assert!(forced.status.success(), "{}", String::from_utf8_lossy(&forced.stderr));
    assert!(stdout(&forced).starts_with("initialized"));

    let insert = pinweaver(dir.path(), &["insert", "1", "2", "3"]);
    assert!(insert.status.success());
    assert_eq!(stdout(&insert).trim(), "inserted label 0");
}
