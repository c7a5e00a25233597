use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("axon_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_axon"))
        .arg("help")
        .output()
        .expect("run axon help");

    assert!(
        output.status.success(),
        "axon help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("probe"), "missing probe in help output");
    assert!(
        stdout.contains("transcode"),
        "missing transcode in help output"
    );
}

#[test]
fn probe_json_reports_the_software_card() {
    let output = Command::new(env!("CARGO_BIN_EXE_axon"))
        .args(["probe", "--json"])
        .output()
        .expect("run axon probe --json");

    assert!(
        output.status.success(),
        "probe --json failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("probe output is JSON");
    assert_schema_version(&value);
    assert_eq!(value.get("driver").and_then(|v| v.as_str()), Some("sim"));
}

#[test]
fn transcode_round_trip_writes_output_and_report() {
    let dir = unique_temp_dir("transcode");
    let input = dir.join("input.h264");
    let output_path = dir.join("output.hevc");
    // Four synthetic packets at the default chunk size.
    fs::write(&input, vec![0x42u8; 4096 * 4]).expect("write input");

    let output = Command::new(env!("CARGO_BIN_EXE_axon"))
        .args([
            "transcode",
            "--input",
            input.to_str().expect("utf8 path"),
            "--output",
            output_path.to_str().expect("utf8 path"),
            "--json",
        ])
        .output()
        .expect("run axon transcode");

    assert!(
        output.status.success(),
        "transcode failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report is JSON");
    assert_schema_version(&value);
    assert_eq!(value.get("packets_in").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(value.get("chunks_out").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(
        value.get("pts_regressions").and_then(|v| v.as_u64()),
        Some(0)
    );

    let encoded = fs::read(&output_path).expect("encoded output exists");
    assert!(!encoded.is_empty(), "encoded stream written");

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn transcode_rejects_unknown_codec() {
    let dir = unique_temp_dir("badcodec");
    let input = dir.join("input.bin");
    fs::write(&input, b"data").expect("write input");

    let output = Command::new(env!("CARGO_BIN_EXE_axon"))
        .args([
            "transcode",
            "--input",
            input.to_str().expect("utf8 path"),
            "--output",
            dir.join("out.bin").to_str().expect("utf8 path"),
            "--codec",
            "av1",
        ])
        .output()
        .expect("run axon transcode");

    assert!(!output.status.success(), "unknown codec must fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown codec"), "got: {stderr}");

    fs::remove_dir_all(&dir).ok();
}
