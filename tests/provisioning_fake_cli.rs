//! Provisioning against a stand-in `arduino-cli` shell script.
#![cfg(unix)]

use servodriver::provisioning::{ProvisionError, ProvisionRequest, ProvisionSettings, ProvisioningPipeline, Stage};
use servodriver::toolchain::{ArduinoCli, CancelToken};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::tempdir;

const BOARD_PORT: &str = "/dev/ttyFAKE0";

/// Write an executable script that logs its arguments and answers like arduino-cli.
fn fake_cli(dir: &Path, name: &str, upload_body: &str) -> (PathBuf, PathBuf) {
    let script = dir.join(name);
    let log = dir.join(format!("{}.log", name));
    let body = format!(
        r#"#!/bin/sh
echo "$@" >> "{log}"
case "$1" in
  board)
    echo "Port          Protocol Type              Board Name FQBN Core"
    echo "{port} serial   Serial Port (USB) Unknown"
    ;;
  upload)
    {upload}
    ;;
  *)
    echo "$1 ok"
    ;;
esac
"#,
        log = log.display(),
        port = BOARD_PORT,
        upload = upload_body,
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

fn calls(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(|line| line.split_whitespace().next().unwrap_or("").to_string())
        .collect()
}

fn sketch_dir(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir(&dir).unwrap();
    dir
}

fn settings() -> ProvisionSettings {
    ProvisionSettings {
        upload_timeout: Duration::from_secs(1),
        tool_timeout: Duration::from_secs(20),
        ..Default::default()
    }
}

// Scripts are all written before any of them runs; executing a file another
// thread still has open for writing fails with ETXTBSY.
#[test]
fn test_pipeline_against_fake_cli() {
    let root = tempdir().unwrap();
    let (ok_cli, ok_log) = fake_cli(root.path(), "cli-ok", "echo uploaded");
    let (hang_cli, hang_log) = fake_cli(root.path(), "cli-hang", "exec sleep 30");
    let (fail_cli, _) = fake_cli(root.path(), "cli-fail", "echo 'avrdude: stk500_recv(): programmer is not responding' 1>&2; exit 1");

    // Happy path: every stage in order, sketch written where the tool was pointed.
    let dir = sketch_dir(root.path(), "arm_ok");
    let pipeline = ProvisioningPipeline::new(ArduinoCli::new(&ok_cli), settings());
    let mut stages = Vec::new();
    let report = pipeline
        .run(
            &ProvisionRequest { sketch_dir: dir.clone(), port: Some(BOARD_PORT.into()) },
            &CancelToken::new(),
            &mut |job| stages.push(job.stage),
        )
        .unwrap();
    assert_eq!(stages, Stage::ORDER.to_vec());
    assert_eq!(report.upload_output.stdout, "uploaded\n");
    assert!(report.source_path.ends_with("arm_ok/arm_ok.ino"));
    assert_eq!(calls(&ok_log), vec!["board", "core", "lib", "compile", "upload"]);
    let compile_line = fs::read_to_string(&ok_log).unwrap().lines().nth(3).unwrap().to_string();
    assert!(compile_line.contains("--fqbn arduino:avr:nano:cpu=atmega168"));

    // A port the tool does not list is rejected before anything is installed.
    fs::write(&ok_log, "").unwrap();
    let dir = sketch_dir(root.path(), "arm_wrong_port");
    let result = pipeline.run(
        &ProvisionRequest { sketch_dir: dir, port: Some("/dev/ttyFAKE9".into()) },
        &CancelToken::new(),
        &mut |_| {},
    );
    assert!(matches!(result, Err(ProvisionError::NotABoard { .. })));
    assert_eq!(calls(&ok_log), vec!["board"]);

    // An upload that never returns is killed at the upload timeout.
    let dir = sketch_dir(root.path(), "arm_hang");
    let pipeline = ProvisioningPipeline::new(ArduinoCli::new(&hang_cli), settings());
    let mut reached_done = false;
    let started = Instant::now();
    let err = pipeline
        .run(
            &ProvisionRequest { sketch_dir: dir, port: Some(BOARD_PORT.into()) },
            &CancelToken::new(),
            &mut |job| reached_done |= job.stage == Stage::Done,
        )
        .unwrap_err();
    assert!(matches!(err, ProvisionError::UploadTimeout { .. }));
    assert_eq!(err.user_message(), "Wrong port or wrong board selected.");
    assert!(!reached_done);
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(calls(&hang_log).last().map(String::as_str), Some("upload"));

    // A failing upload surfaces the tool's stderr.
    let dir = sketch_dir(root.path(), "arm_fail");
    let pipeline = ProvisioningPipeline::new(ArduinoCli::new(&fail_cli), settings());
    let err = pipeline
        .run(
            &ProvisionRequest { sketch_dir: dir, port: Some(BOARD_PORT.into()) },
            &CancelToken::new(),
            &mut |_| {},
        )
        .unwrap_err();
    match err {
        ProvisionError::UploadFailed { diagnostics } => assert!(diagnostics.contains("programmer is not responding")),
        other => panic!("unexpected {:?}", other),
    }
}
