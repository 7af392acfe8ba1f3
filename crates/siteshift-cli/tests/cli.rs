//! CLI surface tests: argument parsing, exit codes, and the plan
//! output, driven through the real binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path, source_root: Option<&std::path::Path>) -> std::path::PathBuf {
    let source_root_line = source_root
        .map(|p| format!("document_root = \"{}\"\n", p.display()))
        .unwrap_or_default();
    let config = format!(
        r#"name = "cli-test"

[source]
kind = "static_site"
host = "old.example.com"
{source_root_line}
[destination]
kind = "static_site"
host = "new.example.com"

[transfer]
backup_files = false
backup_config = false
migrate_files = false
"#
    );
    let path = dir.join("migration.toml");
    std::fs::write(&path, config).unwrap();
    path
}

#[test]
fn plan_prints_dependency_ordered_steps() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), None);

    Command::cargo_bin("siteshift")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("initialize"))
        .stdout(predicate::str::contains("validate_pre_migration"))
        .stdout(predicate::str::contains("cleanup"));
}

#[test]
fn validate_passes_for_sane_local_config() {
    let dir = tempfile::tempdir().unwrap();
    let source_root = dir.path().join("site");
    std::fs::create_dir_all(&source_root).unwrap();
    let config = write_config(dir.path(), Some(&source_root));

    Command::cargo_bin("siteshift")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stderr(predicate::str::contains("pre-flight passed"));
}

#[test]
fn validate_fails_with_exit_code_two_on_missing_source() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("not_there");
    let config = write_config(dir.path(), Some(&missing));

    Command::cargo_bin("siteshift")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("validation error"));
}

#[test]
fn missing_config_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("siteshift")
        .unwrap()
        .current_dir(dir.path())
        .args(["--config", "nonexistent.toml", "plan"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot read config"));
}

#[test]
fn unknown_config_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        r#"name = "bad"
frobnicate = true

[source]
kind = "generic"
host = "a"

[destination]
kind = "generic"
host = "b"
"#,
    )
    .unwrap();

    Command::cargo_bin("siteshift")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "plan"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn doctor_reports_tooling() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), None);

    Command::cargo_bin("siteshift")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "doctor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("siteshift doctor"));
}
