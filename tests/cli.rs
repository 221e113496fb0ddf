use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

/// Command running inside `dir`, isolated from the caller's environment.
fn bucket_mirror(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("bucket-mirror").expect("Binary exists");
    cmd.current_dir(dir)
        .env_remove("BUCKET_MIRROR_PROFILE")
        .env_remove("RUST_LOG");
    cmd
}

fn workspace_with_config(json: &str) -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("config.json"), json).unwrap();
    dir
}

#[test]
fn validate_reports_buckets() {
    let dir = workspace_with_config(
        r#"{"buckets": ["photos", "documents"], "destination_root": "./mirror"}"#,
    );
    bucket_mirror(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK: 2 bucket(s)"))
        .stdout(predicate::str::contains("  - documents"));
}

#[test]
fn validate_names_the_missing_field() {
    let dir = workspace_with_config(r#"{"buckets": ["photos"]}"#);
    bucket_mirror(dir.path())
        .args(["validate", "--config", "config.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("destination_root"));
}

#[test]
fn missing_config_file_fails() {
    let dir = tempdir().unwrap();
    bucket_mirror(dir.path())
        .args(["run", "--config", "absent.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.json"));
}

#[test]
fn dry_run_with_no_buckets_succeeds() {
    let dir = workspace_with_config(
        r#"{"buckets": [], "destination_root": "./mirror", "aws_cli": "/nonexistent/aws"}"#,
    );
    bucket_mirror(dir.path())
        .args(["run", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCESS session mirror_"))
        .stdout(predicate::str::contains("0/0 bucket(s)"))
        .stdout(predicate::str::contains("(dry run)"));
    assert!(dir.path().join("logs/status.json").is_file());
    assert!(!dir.path().join("mirror").exists());
}

#[test]
fn init_writes_a_loadable_sample_and_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    bucket_mirror(dir.path())
        .args(["init", "--config", "mirror.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote sample configuration"));
    bucket_mirror(dir.path())
        .args(["validate", "--config", "mirror.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("my-important-bucket"));

    bucket_mirror(dir.path())
        .args(["init", "--config", "mirror.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    bucket_mirror(dir.path())
        .args(["init", "--config", "mirror.yaml", "--force"])
        .assert()
        .success();
}

#[test]
fn status_without_a_run_says_so() {
    let dir = workspace_with_config(
        r#"{"buckets": ["a"], "destination_root": "./mirror", "logging": {"file": null}}"#,
    );
    bucket_mirror(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No status recorded yet"));
}

#[test]
fn bucket_flag_needs_a_local_path() {
    let dir = tempdir().unwrap();
    bucket_mirror(dir.path())
        .args(["run", "--bucket", "photos"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--local-path"));
}

#[cfg(unix)]
mod with_fake_tool {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::process::{Command as StdCommand, Stdio};
    use std::thread::sleep;
    use std::time::Duration;

    /// Stand-in for the AWS CLI: bucket `a` is always denied, others sync.
    fn install_fake_aws(dir: &Path) -> String {
        let path = dir.join("fake-aws");
        fs::write(
            &path,
            r#"#!/bin/sh
case "$*" in
  *list-objects-v2*) echo None ;;
  *s3://a\ *) echo "fatal error: AccessDenied" >&2; exit 1 ;;
  *) echo "download: s3://b/report.csv to report.csv" ;;
esac
"#,
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn failed_bucket_makes_the_exit_code_non_zero() {
        let dir = tempdir().unwrap();
        let aws = install_fake_aws(dir.path());
        fs::write(
            dir.path().join("config.json"),
            format!(
                r#"{{
                    "buckets": ["a", "b"],
                    "destination_root": "./mirror",
                    "aws_cli": "{aws}",
                    "automation": {{"max_retries": 2, "retry_delay_minutes": 0}}
                }}"#
            ),
        )
        .unwrap();

        bucket_mirror(dir.path())
            .args(["run", "--session", "mirror_test"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("FAILED session mirror_test: 1/2 bucket(s)"))
            .stderr(predicate::str::contains("AccessDenied"));

        assert!(dir.path().join("mirror/mirror_test/s3/b").is_dir());
        let log_copy = fs::read_to_string(dir.path().join("mirror/logs/status.log")).unwrap();
        assert!(log_copy.contains("Retry budget exhausted"), "got: {log_copy}");

        bucket_mirror(dir.path())
            .args(["status", "--lines", "200"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"phase\": \"idle\""))
            .stdout(predicate::str::contains("\"attempts\": 2"))
            .stdout(predicate::str::contains(" - ERROR - [SYNC][ERROR] Retry budget exhausted"));
    }

    #[test]
    fn all_buckets_synced_exits_zero() {
        let dir = tempdir().unwrap();
        let aws = install_fake_aws(dir.path());
        fs::write(
            dir.path().join("config.yaml"),
            format!("buckets: [b, c]\ndestination_root: ./mirror\naws_cli: {aws}\n"),
        )
        .unwrap();

        bucket_mirror(dir.path())
            .args(["run", "--config", "config.yaml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("SUCCESS session mirror_"))
            .stdout(predicate::str::contains("2/2 bucket(s)"));
    }

    #[test]
    fn single_bucket_runs_without_a_config_file() {
        let dir = tempdir().unwrap();
        let aws = install_fake_aws(dir.path());

        bucket_mirror(dir.path())
            .args(["run", "--bucket", "b", "--local-path", "./backup"])
            .args(["--aws-cli", aws.as_str(), "--session", "adhoc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("SUCCESS session adhoc: 1/1 bucket(s)"));

        assert!(!dir.path().join("config.json").exists());
        assert!(dir.path().join("backup/adhoc/s3/b").is_dir());
        let log_copy = fs::read_to_string(dir.path().join("backup/logs/status.log")).unwrap();
        assert!(log_copy.contains("[SYNC]"), "got: {log_copy}");
    }

    #[test]
    fn scheduled_command_pins_the_sync_tool() {
        let dir = tempdir().unwrap();
        let aws = install_fake_aws(dir.path());
        fs::write(
            dir.path().join("config.json"),
            format!(r#"{{"buckets": ["b"], "destination_root": "./mirror", "aws_cli": "{aws}"}}"#),
        )
        .unwrap();

        bucket_mirror(dir.path())
            .args(["schedule", "install", "--print", "--interval-hours", "6"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--aws-cli"))
            .stdout(predicate::str::contains("fake-aws"));
    }

    #[test]
    fn watch_exits_non_zero_when_the_last_run_failed() {
        let dir = tempdir().unwrap();
        let aws = install_fake_aws(dir.path());
        fs::write(
            dir.path().join("config.json"),
            format!(
                r#"{{
                    "buckets": ["a"],
                    "destination_root": "./mirror",
                    "aws_cli": "{aws}",
                    "logging": {{"file": null, "copy_to_destination": false}},
                    "automation": {{"max_retries": 1, "retry_delay_minutes": 0}}
                }}"#
            ),
        )
        .unwrap();

        let stderr_path = dir.path().join("stderr.txt");
        let child = StdCommand::new(assert_cmd::cargo::cargo_bin("bucket-mirror"))
            .current_dir(dir.path())
            .env_remove("BUCKET_MIRROR_PROFILE")
            .env_remove("RUST_LOG")
            .args(["watch", "--interval-hours", "0"])
            .stdout(Stdio::piped())
            .stderr(fs::File::create(&stderr_path).unwrap())
            .spawn()
            .unwrap();

        sleep(Duration::from_secs(2));
        let killed = StdCommand::new("kill")
            .args(["-TERM", &child.id().to_string()])
            .status()
            .unwrap();
        assert!(killed.success());

        let output = child.wait_with_output().unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = fs::read_to_string(&stderr_path).unwrap();
        assert!(stdout.contains("Stopped after"), "stdout: {stdout}\nstderr: {stderr}");
        assert_eq!(output.status.code(), Some(1), "stderr: {stderr}");
        assert!(stderr.contains("Last sync run"), "got: {stderr}");
    }
}
