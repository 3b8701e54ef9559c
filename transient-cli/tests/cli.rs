//! End-to-end argument-parsing and error-path coverage that doesn't require
//! an actual hypervisor binary or guest image — the parts of the command
//! surface that are exercised purely by `transient`'s own validation.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("transient").unwrap()
}

#[test]
fn top_level_help_lists_all_verbs() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("ssh"))
        .stdout(predicate::str::contains("commit"))
        .stdout(predicate::str::contains("image"));
}

#[test]
fn missing_subcommand_is_an_error() {
    cmd().assert().failure();
}

#[test]
fn unknown_subcommand_is_an_error() {
    cmd().arg("frobnicate").assert().failure();
}

#[test]
fn rm_of_unknown_vm_fails() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "rm",
            "--force",
            "--image-frontend",
            dir.path().to_str().unwrap(),
            "does-not-exist",
        ])
        .assert()
        .failure();
}

#[test]
fn image_ls_on_empty_store_prints_a_table_with_no_rows() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "image",
            "ls",
            "--image-backend",
            dir.path().to_str().unwrap(),
            "--image-frontend",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("KIND"));
}

#[test]
fn image_rm_on_missing_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "image",
            "rm",
            "--force",
            "--image-backend",
            dir.path().to_str().unwrap(),
            "does-not-exist",
        ])
        .assert()
        .failure();
}

#[test]
fn cp_rejects_a_mapping_without_a_colon() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "cp",
            "some-vm",
            "no-colon-here",
            "--image-frontend",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid mapping").or(predicate::str::contains("no such VM")));
}

#[test]
fn start_of_unknown_vm_fails() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "start",
            "--image-frontend",
            dir.path().to_str().unwrap(),
            "does-not-exist",
        ])
        .assert()
        .failure();
}

#[test]
fn run_with_malformed_image_spec_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args([
            "run",
            "--image-backend",
            dir.path().to_str().unwrap(),
            "--image-frontend",
            dir.path().to_str().unwrap(),
            "--image",
            ",no-name",
        ])
        .assert()
        .failure();
}

#[test]
fn ps_with_timeout_but_no_name_or_with_ssh_is_rejected() {
    cmd().args(["ps", "--timeout", "1"]).assert().failure();
}
