//! Integration tests for the probeweave binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &Path) -> PathBuf {
    let sessions = dir.join("sessions");
    let config = dir.join("probeweave.toml");
    fs::write(
        &config,
        format!(
            "session_dir = {:?}\ndefault_target_entries = 50\ncadence = {{ cycles = 1 }}\n",
            sessions.display().to_string()
        ),
    )
    .unwrap();
    config
}

fn simulate_and_save(config: &Path, seed: &str, label: &str) {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    cmd.arg("--config")
        .arg(config)
        .arg("simulate")
        .arg("--cycles")
        .arg("120")
        .arg("--seed")
        .arg(seed)
        .arg("--save")
        .arg("--label")
        .arg(label);
    cmd.assert().success();
}

#[test]
fn test_simulate_prints_ranking() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    cmd.arg("simulate").arg("--cycles").arg("50").arg("--seed").arg("1");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Label"))
        .stdout(predicate::str::contains("Pawn.Tick"))
        .stdout(predicate::str::contains("Map.Render"))
        .stdout(predicate::str::contains("Path.Find"));
}

#[test]
fn test_simulate_json_parses() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    cmd.arg("simulate")
        .arg("--cycles")
        .arg("40")
        .arg("--targets")
        .arg("2")
        .arg("--seed")
        .arg("3")
        .arg("--format")
        .arg("json");

    let output = cmd.output().unwrap();
    assert!(output.status.success());
    let logs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let logs = logs.as_array().unwrap();
    assert_eq!(logs.len(), 2);

    let total: f64 = logs.iter().map(|log| log["percent"].as_f64().unwrap()).sum();
    assert!((total - 100.0).abs() < 1e-6);
}

#[test]
fn test_simulate_is_reproducible_with_seed() {
    let run = || {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
        cmd.args(["simulate", "--cycles", "30", "--seed", "42", "--format", "json"]);
        cmd.output().unwrap().stdout
    };
    assert_eq!(run(), run());
}

#[test]
fn test_save_list_inspect_compare() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    simulate_and_save(&config, "5", "baseline");
    simulate_and_save(&config, "6", "candidate");

    let first = dir.path().join("sessions").join("Pawn.Tick-0.data");
    let second = dir.path().join("sessions").join("Pawn.Tick-1.data");
    assert!(first.exists());
    assert!(second.exists());

    let mut list = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    list.arg("--config").arg(&config).arg("list").arg("Pawn.Tick");
    list.assert()
        .success()
        .stdout(predicate::str::contains("baseline"))
        .stdout(predicate::str::contains("candidate"))
        .stdout(predicate::str::contains("50/50"));

    let mut inspect = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    inspect.arg("inspect").arg(&first);
    inspect
        .assert()
        .success()
        .stdout(predicate::str::contains("Name:                     baseline"))
        .stdout(predicate::str::contains("Target:                   Pawn.Tick"));

    let mut compare = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    compare.arg("compare").arg(&first).arg(&second);
    compare
        .assert()
        .success()
        .stdout(predicate::str::contains("Total Time"))
        .stdout(predicate::str::contains("Max Calls/Update"))
        .stdout(predicate::str::contains("baseline"));

    let mut compare_json = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    compare_json
        .arg("compare")
        .arg(&first)
        .arg(&second)
        .arg("--format")
        .arg("json");
    let output = compare_json.output().unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["rows"].as_array().unwrap().len(), 10);
    assert_eq!(report["left_name"], "baseline");
}

#[test]
fn test_list_without_sessions() {
    let dir = TempDir::new().unwrap();
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    cmd.arg("list").arg("Pawn.Tick").arg("--dir").arg(dir.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No sessions for 'Pawn.Tick'"));
}

#[test]
fn test_inspect_corrupt_file_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("junk.data");
    fs::write(&path, b"not a session file").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    cmd.arg("inspect").arg(&path);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("not a valid session file"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    fs::write(&config, "buffer_capacity = 1\n").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("probeweave");
    cmd.arg("--config").arg(&config).arg("simulate");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid engine configuration"));
}
