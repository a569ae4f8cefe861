#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const PROJECTS: &str = "identity:\n  projects:\n    create: [0, 2, 1]\n";

fn spamstack(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("spamstack").unwrap();
    cmd.current_dir(dir.path())
        .env("SPAMSTACK_DB", dir.path().join("spam.redb"))
        .env("SPAMSTACK_BACKEND", "memory")
        .env_remove("SPAMSTACK_CONFIG")
        .env("OS_USERNAME", "admin")
        .env("OS_PASSWORD", "secret")
        .env("OS_PROJECT_NAME", "admin")
        .env("OS_AUTH_URL", "memory://keystone/v3")
        .env("RUST_LOG", "warn");
    cmd
}

fn write(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

// ---------------------------------------------------------------------------
// spamstack pipeline
// ---------------------------------------------------------------------------

#[test]
fn pipeline_check_lists_steps_in_order() {
    let dir = TempDir::new().unwrap();
    let conf = write(
        &dir,
        "p.yaml",
        "storage:\n  volumes:\n    create: [60, 3, 2]\n    attach: [30, 1, 4]\n",
    );
    spamstack(&dir)
        .args(["pipeline", "check", "--conf"])
        .arg(&conf)
        .assert()
        .success()
        .stdout(predicate::str::contains("volumes/create"))
        .stdout(predicate::str::contains("volumes/attach"));
}

#[test]
fn pipeline_check_rejects_unknown_action() {
    let dir = TempDir::new().unwrap();
    let conf = write(&dir, "p.yaml", "storage:\n  volumes:\n    explode: [1, 1, 1]\n");
    spamstack(&dir)
        .args(["pipeline", "check", "--conf"])
        .arg(&conf)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown action"));
}

#[test]
fn pipeline_actions_lists_the_catalogue() {
    let dir = TempDir::new().unwrap();
    spamstack(&dir)
        .args(["pipeline", "actions", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("volumes/attach"))
        .stdout(predicate::str::contains("containers/create"));
}

// ---------------------------------------------------------------------------
// spamstack run / store / clean
// ---------------------------------------------------------------------------

#[test]
fn run_tracks_created_resources() {
    let dir = TempDir::new().unwrap();
    let conf = write(&dir, "p.yaml", PROJECTS);
    spamstack(&dir)
        .arg("run")
        .arg("--conf")
        .arg(&conf)
        .assert()
        .success()
        .stdout(predicate::str::contains("projects/create"))
        .stdout(predicate::str::contains("2 invocations"));

    let out = spamstack(&dir)
        .args(["store", "list", "--namespace", "identity/projects", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    // the admin project plus the two created ones
    assert_eq!(rows.as_array().unwrap().len(), 3);
}

#[test]
fn run_json_report_has_a_branch_per_collection() {
    let dir = TempDir::new().unwrap();
    let conf = write(
        &dir,
        "p.yaml",
        "identity:\n  projects:\n    create: [0, 1, 1]\nstorage:\n  volumes:\n    attach: [0, 1, 1]\n",
    );
    let out = spamstack(&dir)
        .args(["run", "--json", "--conf"])
        .arg(&conf)
        .output()
        .unwrap();
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let branches = report["branches"].as_array().unwrap();
    assert_eq!(branches.len(), 2);
    assert_eq!(branches[1]["collection"], "storage");
    assert_eq!(branches[1]["steps"][0]["tally"]["skipped"], 1);
}

#[test]
fn run_only_unknown_pipeline_fails() {
    let dir = TempDir::new().unwrap();
    let conf = write(&dir, "p.yaml", PROJECTS);
    spamstack(&dir)
        .args(["run", "--only", "nightly", "--conf"])
        .arg(&conf)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nightly"));
}

#[test]
fn first_run_without_auth_url_fails() {
    let dir = TempDir::new().unwrap();
    let conf = write(&dir, "p.yaml", PROJECTS);
    spamstack(&dir)
        .env_remove("OS_AUTH_URL")
        .arg("run")
        .arg("--conf")
        .arg(&conf)
        .assert()
        .failure()
        .stderr(predicate::str::contains("OS_AUTH_URL"));
}

#[test]
fn clean_keeps_protected_resources() {
    let dir = TempDir::new().unwrap();
    let conf = write(&dir, "p.yaml", PROJECTS);
    spamstack(&dir).arg("run").arg("--conf").arg(&conf).assert().success();

    spamstack(&dir)
        .args(["clean", "identity"])
        .assert()
        .success()
        .stdout(predicate::str::contains("protected"));

    let out = spamstack(&dir)
        .args(["store", "list", "--json"])
        .output()
        .unwrap();
    let rows: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["namespace"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"credentials/users"));
    assert!(names.contains(&"identity/users"));
}

#[test]
fn clean_rejects_unknown_collection() {
    let dir = TempDir::new().unwrap();
    spamstack(&dir)
        .args(["clean", "dns"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown collection"));
}

#[test]
fn unknown_backend_is_reported() {
    let dir = TempDir::new().unwrap();
    spamstack(&dir)
        .args(["--backend", "carrier-pigeon", "clean", "all"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("carrier-pigeon"));
}
