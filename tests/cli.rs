use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin(dir: &Path, password: &str) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("backvault"));
    cmd.current_dir(dir)
        .env("BACKVAULT_PASSWORD", password)
        .env("BACKVAULT_SCRYPT_LOG_N", "10")
        .env_remove("RUST_LOG")
        .arg("--salt")
        .arg(dir.join("salt.salt"));
    cmd
}

fn setup_source(dir: &Path) -> PathBuf {
    let source = dir.join("Source");
    fs::create_dir_all(source.join("b")).unwrap();
    fs::write(source.join("a.txt"), "hello").unwrap();
    fs::write(source.join("b").join("c.txt"), "world").unwrap();
    source
}

fn backup_json(dir: &Path, password: &str) -> serde_json::Value {
    let output = bin(dir, password)
        .arg("--json")
        .arg("backup")
        .arg("--source")
        .arg(dir.join("Source"))
        .arg("--backup-dir")
        .arg(dir.join("Backup"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn init_creates_salt_file() {
    let dir = tempdir().unwrap();

    bin(dir.path(), "pw")
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("salt initialized"));

    assert_eq!(fs::read(dir.path().join("salt.salt")).unwrap().len(), 16);
}

#[test]
fn init_fails_if_salt_exists() {
    let dir = tempdir().unwrap();

    bin(dir.path(), "pw").arg("init").assert().success();
    let salt = fs::read(dir.path().join("salt.salt")).unwrap();

    bin(dir.path(), "pw")
        .arg("init")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("refusing to replace it"));

    assert_eq!(fs::read(dir.path().join("salt.salt")).unwrap(), salt);
}

#[test]
fn backup_and_restore_roundtrip() {
    let dir = tempdir().unwrap();
    setup_source(dir.path());

    let report = backup_json(dir.path(), "pw1");
    let entries: Vec<&str> = report["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e.as_str().unwrap())
        .collect();
    assert_eq!(entries, vec!["a.txt", "b/c.txt"]);

    let archive = report["archive"].as_str().unwrap().to_string();

    bin(dir.path(), "pw1")
        .arg("restore")
        .arg("--archive")
        .arg(&archive)
        .arg("--restore-dir")
        .arg(dir.path().join("Restore"))
        .assert()
        .success()
        .stdout(predicate::str::contains("restored archive").and(predicate::str::contains("_restored.zip")));

    let restored: Vec<_> = fs::read_dir(dir.path().join("Restore"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(restored.len(), 1);

    bin(dir.path(), "pw1")
        .arg("list")
        .arg(&restored[0])
        .assert()
        .success()
        .stdout(predicate::str::contains("a.txt").and(predicate::str::contains("b/c.txt")));
}

#[test]
fn restore_finds_bare_archive_name_in_backup_dir() {
    let dir = tempdir().unwrap();
    setup_source(dir.path());

    let report = backup_json(dir.path(), "pw");
    let archive = PathBuf::from(report["archive"].as_str().unwrap());
    let name = archive.file_name().unwrap();

    bin(dir.path(), "pw")
        .arg("restore")
        .arg("--archive")
        .arg(name)
        .arg("--backup-dir")
        .arg(dir.path().join("Backup"))
        .arg("--restore-dir")
        .arg(dir.path().join("Restore"))
        .assert()
        .success();
}

#[test]
fn wrong_password_reports_skipped_members() {
    let dir = tempdir().unwrap();
    setup_source(dir.path());

    let report = backup_json(dir.path(), "right");
    let archive = report["archive"].as_str().unwrap().to_string();

    bin(dir.path(), "wrong")
        .arg("restore")
        .arg("--archive")
        .arg(&archive)
        .arg("--restore-dir")
        .arg(dir.path().join("Restore"))
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "skipped a.txt: wrong password or corrupted data",
        ))
        .stderr(predicate::str::contains("could be decrypted"));
}

#[test]
fn restore_without_salt_fails() {
    let dir = tempdir().unwrap();

    bin(dir.path(), "pw")
        .arg("restore")
        .arg("--archive")
        .arg(dir.path().join("whatever.zip"))
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("no salt found"));
}

#[test]
fn restore_missing_archive_fails() {
    let dir = tempdir().unwrap();
    bin(dir.path(), "pw").arg("init").assert().success();

    bin(dir.path(), "pw")
        .arg("restore")
        .arg("--archive")
        .arg(dir.path().join("missing.zip"))
        .arg("--restore-dir")
        .arg(dir.path().join("Restore"))
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("archive not found"));
}

#[test]
fn restore_corrupt_archive_fails() {
    let dir = tempdir().unwrap();
    bin(dir.path(), "pw").arg("init").assert().success();
    let bogus = dir.path().join("bogus.zip");
    fs::write(&bogus, "not an archive").unwrap();

    bin(dir.path(), "pw")
        .arg("restore")
        .arg("--archive")
        .arg(&bogus)
        .arg("--restore-dir")
        .arg(dir.path().join("Restore"))
        .assert()
        .failure()
        .code(5)
        .stderr(predicate::str::contains("corrupt"));
}

#[test]
fn backup_of_missing_source_fails() {
    let dir = tempdir().unwrap();

    bin(dir.path(), "pw")
        .arg("backup")
        .arg("--source")
        .arg(dir.path().join("nope"))
        .arg("--backup-dir")
        .arg(dir.path().join("Backup"))
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("init stage failed"));
}

#[test]
fn backup_uses_default_directories() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("Data");
    fs::create_dir_all(data.join("Source")).unwrap();
    fs::write(data.join("Source").join("a.txt"), "hello").unwrap();

    bin(dir.path(), "pw")
        .env_remove("BACKVAULT_SOURCE")
        .env_remove("BACKVAULT_BACKUP_DIR")
        .arg("backup")
        .assert()
        .success()
        .stdout(predicate::str::contains("backup created"));

    assert_eq!(fs::read_dir(data.join("Backup")).unwrap().count(), 1);
}
