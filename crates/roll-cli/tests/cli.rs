//! CLI command integration tests.
//! Each test uses a temp directory via ROLL_DATA_DIR for full isolation and
//! `cat` as the extractor, so an image file holds the extractor's JSON output.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const DAY: &str = "2024-09-02";

fn roll_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("roll").unwrap();
    cmd.env("ROLL_DATA_DIR", data_dir.path());
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Data dir with a 4-dimensional matcher and `cat` as the extractor.
fn setup() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("roll.toml"),
        "[matcher]\ndimension = 4\n\n[extractor]\ncommand = [\"cat\"]\ntimeout_ms = 5000\n",
    )
    .unwrap();
    dir
}

fn image(dir: &TempDir, name: &str, embeddings: &[[f32; 4]]) -> PathBuf {
    let faces: Vec<serde_json::Value> = embeddings
        .iter()
        .map(|e| {
            serde_json::json!({
                "region": {"top": 4, "right": 40, "bottom": 44, "left": 0},
                "embedding": e,
            })
        })
        .collect();
    let path = dir.path().join(name);
    std::fs::write(&path, serde_json::to_vec(&faces).unwrap()).unwrap();
    path
}

fn add_student(dir: &TempDir, key: &str, name: &str) {
    roll_cmd(dir)
        .args(["student", "add", key, name])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("saved student {key}")));
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn student_list_fresh_db() {
    let dir = setup();
    roll_cmd(&dir)
        .args(["student", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no students)"));
}

#[test]
fn student_add_then_list_sorted() {
    let dir = setup();
    add_student(&dir, "S002", "Bob");
    add_student(&dir, "S001", "Alice");

    roll_cmd(&dir)
        .args(["student", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?s)S001\tAlice.*S002\tBob").unwrap());
}

#[test]
fn enroll_recognize_marks_once() {
    let dir = setup();
    add_student(&dir, "S001", "Alice");
    let face = image(&dir, "alice.json", &[[0.1, 0.2, 0.3, 0.4]]);

    roll_cmd(&dir)
        .arg("enroll")
        .arg("S001")
        .arg(&face)
        .assert()
        .success()
        .stdout(predicate::str::contains("enrolled S001"));

    roll_cmd(&dir)
        .arg("recognize")
        .arg(&face)
        .args(["--day", DAY])
        .assert()
        .success()
        .stdout(predicate::str::contains("marked S001 (Alice) present on 2024-09-02"));

    roll_cmd(&dir)
        .arg("recognize")
        .arg(&face)
        .args(["--day", DAY])
        .assert()
        .success()
        .stdout(predicate::str::contains("S001 (Alice) already marked on 2024-09-02"));

    roll_cmd(&dir)
        .args(["attendance", "--day", DAY])
        .assert()
        .success()
        .stdout(predicate::str::contains("2024-09-02: 1 present"))
        .stdout(predicate::str::contains("S001\tAlice\tPresent"));
}

#[test]
fn recognize_json_reports_no_match_reasons() {
    let dir = setup();
    let face = image(&dir, "probe.json", &[[0.0, 0.0, 0.0, 0.0]]);

    let empty = json_stdout(
        roll_cmd(&dir)
            .args(["--json", "recognize"])
            .arg(&face)
            .args(["--day", DAY]),
    );
    assert_eq!(empty["status"], "no_match");
    assert_eq!(empty["reason"], "empty");

    add_student(&dir, "S001", "Alice");
    let enrolled = image(&dir, "alice.json", &[[1.0, 1.0, 1.0, 1.0]]);
    roll_cmd(&dir)
        .arg("enroll")
        .arg("S001")
        .arg(&enrolled)
        .assert()
        .success();

    let far = json_stdout(
        roll_cmd(&dir)
            .args(["--json", "recognize"])
            .arg(&face)
            .args(["--day", DAY]),
    );
    assert_eq!(far["status"], "no_match");
    assert_eq!(far["reason"], "above_threshold");
}

#[test]
fn enroll_rejections_are_reported() {
    let dir = setup();
    add_student(&dir, "S001", "Alice");

    let none = image(&dir, "none.json", &[]);
    roll_cmd(&dir)
        .arg("enroll")
        .arg("S001")
        .arg(&none)
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected: no face detected"));

    let two = image(&dir, "two.json", &[[0.0; 4], [1.0; 4]]);
    roll_cmd(&dir)
        .arg("enroll")
        .arg("S001")
        .arg(&two)
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected: 2 faces detected"));

    let one = image(&dir, "one.json", &[[0.0; 4]]);
    roll_cmd(&dir)
        .arg("enroll")
        .arg("S404")
        .arg(&one)
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected: unknown identity S404"));

    roll_cmd(&dir)
        .arg("registered")
        .assert()
        .success()
        .stdout(predicate::str::contains("(no faces enrolled)"));
}

#[test]
fn registered_unenroll_and_clear() {
    let dir = setup();
    add_student(&dir, "S001", "Alice");
    add_student(&dir, "S002", "Bob");
    let a = image(&dir, "a.json", &[[0.0; 4]]);
    let b = image(&dir, "b.json", &[[1.0; 4]]);
    roll_cmd(&dir).arg("enroll").arg("S001").arg(&a).assert().success();
    roll_cmd(&dir).arg("enroll").arg("S002").arg(&b).assert().success();

    let listed = json_stdout(roll_cmd(&dir).args(["--json", "registered", "--images"]));
    assert_eq!(listed.as_array().unwrap().len(), 2);
    assert_eq!(listed[0]["identity"], "S001");
    assert_eq!(listed[0]["name"], "Alice");
    assert!(listed[0]["image"].as_str().is_some());

    roll_cmd(&dir)
        .args(["unenroll", "S002"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed face of S002"));
    roll_cmd(&dir)
        .args(["unenroll", "S002"])
        .assert()
        .success()
        .stdout(predicate::str::contains("S002 was not enrolled"));

    roll_cmd(&dir)
        .arg("clear-faces")
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 1 face(s)"));
}

#[test]
fn reset_day_and_days() {
    let dir = setup();
    add_student(&dir, "S001", "Alice");
    let face = image(&dir, "alice.json", &[[0.5; 4]]);
    roll_cmd(&dir).arg("enroll").arg("S001").arg(&face).assert().success();

    for day in ["2024-09-02", "2024-09-03"] {
        roll_cmd(&dir)
            .arg("recognize")
            .arg(&face)
            .args(["--day", day])
            .assert()
            .success();
    }

    roll_cmd(&dir)
        .arg("days")
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?s)2024-09-02.*2024-09-03").unwrap());

    roll_cmd(&dir)
        .args(["reset-day", "--day", "2024-09-02"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 1 record(s) for 2024-09-02"));

    let days = json_stdout(roll_cmd(&dir).args(["--json", "days"]));
    assert_eq!(days, serde_json::json!(["2024-09-03"]));
}

#[test]
fn invalid_inputs_fail() {
    let dir = setup();

    roll_cmd(&dir)
        .args(["attendance", "--day", "2024-02-30"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid day"));

    roll_cmd(&dir)
        .args(["unenroll", "bad key!"])
        .assert()
        .failure();

    let empty = dir.path().join("empty.jpg");
    std::fs::write(&empty, b"").unwrap();
    roll_cmd(&dir)
        .arg("recognize")
        .arg(&empty)
        .assert()
        .failure()
        .stderr(predicate::str::contains("image is empty"));
}

#[test]
fn missing_extractor_is_reported() {
    let dir = TempDir::new().unwrap();
    let face = image(&dir, "face.json", &[[0.0; 4]]);
    roll_cmd(&dir)
        .arg("recognize")
        .arg(&face)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no extractor configured"));
}

#[test]
fn bad_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("roll.toml"), "[matcher]\nthreshold = -1.0\n").unwrap();
    roll_cmd(&dir)
        .arg("days")
        .assert()
        .failure()
        .stderr(predicate::str::contains("roll.toml"));
}
