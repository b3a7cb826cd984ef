#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn cw_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_cw") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/cw");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "callwatch-cli", "--bin", "cw"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build cw binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn cw_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(cw_binary_path());
    command.arg("--db").arg(db_path);
    command.env_remove("CALLWATCH_FEED_URL");
    command.env_remove("CALLWATCH_INTERVAL_SECS");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run cw command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_path(tag: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("callwatch-{tag}-{}.{extension}", Ulid::new()))
}

fn write_snapshot(rows: &Value) -> PathBuf {
    let path = temp_path("snapshot", "json");
    if let Err(err) = std::fs::write(&path, rows.to_string()) {
        panic!("failed to write snapshot fixture: {err}");
    }
    path
}

fn feed_row(entity_id: i64, status: &str, status_at: &str, creation: &str, location: &str) -> Value {
    json!({
        "id": entity_id + 9000,
        "sequencenumber": format!("CH24-{entity_id:06}"),
        "status": status,
        "creation": creation,
        "zone": "Z1",
        "location": location,
        "type": "FIRE",
        "latitude": 35.05,
        "longitude": -85.3,
        "priority": "1",
        "statusdatetime": status_at,
        "jurisdiction": "CHATT",
        "crossstreets": "",
        "city": "Chattanooga",
        "state": "TN",
        "agency_type": "Fire",
        "type_description": "Structure Fire",
        "master_incident_id": entity_id,
        "battalion": "B2",
        "stacked": false,
        "premise": null,
        "entered_queue": null
    })
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(cw_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["poll", "ingest", "history", "show", "stats"] {
        assert!(stdout.contains(required), "missing subcommand {required} in help");
    }
}

#[test]
fn ingest_closes_vanished_calls_and_history_returns_them() {
    let db_path = temp_path("contracts", "sqlite3");
    let first = write_snapshot(&json!([
        feed_row(1, "Enroute", "2024-03-01T09:05:00Z", "2024-03-01T09:00:00Z", "100 Main St"),
        feed_row(2, "Dispatched", "2024-03-01T09:10:00Z", "2024-03-02T09:00:00Z", "5 Elm Ave"),
    ]));
    let second = write_snapshot(&json!([feed_row(
        2,
        "Onscene",
        "2024-03-02T09:20:00Z",
        "2024-03-02T09:00:00Z",
        "5 Elm Ave"
    )]));

    let output = cw_output(
        &db_path,
        &["ingest", "--snapshot", &first.to_string_lossy(), "--now", "2024-03-01T09:30:00Z"],
    );
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["inserted"], json!(2));
    assert_eq!(report["synthesized_closures"], json!(0));

    let output = cw_output(&db_path, &["history", "--json"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), json!([]));

    let output = cw_output(
        &db_path,
        &["ingest", "--snapshot", &second.to_string_lossy(), "--now", "2024-03-02T10:00:00Z"],
    );
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["synthesized_closures"], json!(1));
    assert_eq!(report["updated"], json!(2));

    let output = cw_output(&db_path, &["history", "--json", "--search", "MAIN"]);
    assert!(output.status.success());
    let history = stdout_json(&output);
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert_eq!(history[0]["master_incident_id"], json!(1));
    assert_eq!(history[0]["status"], json!("Closed"));
    assert_eq!(history[0]["statusdatetime"], json!("2024-03-02T10:00:00Z"));
    assert_eq!(history[0]["creation"], json!("2024-03-01T09:00:00Z"));

    let output = cw_output(
        &db_path,
        &["history", "--json", "--start", "2024-03-02", "--end", "2024-03-02"],
    );
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), json!([]));

    let output = cw_output(&db_path, &["show", "--entity-id", "2"]);
    assert!(output.status.success());
    let shown = stdout_json(&output);
    assert_eq!(shown["status"], json!("Onscene"));

    let output = cw_output(&db_path, &["stats", "--json"]);
    assert!(output.status.success());
    assert_eq!(
        stdout_json(&output),
        json!([
            { "status": "Closed", "count": 1 },
            { "status": "Onscene", "count": 1 }
        ])
    );

    for path in [&db_path, &first, &second] {
        let _ = std::fs::remove_file(path);
    }
}

#[test]
fn inverted_history_range_exits_non_zero() {
    let db_path = temp_path("range", "sqlite3");
    let output = cw_output(
        &db_path,
        &["history", "--start", "2024-03-05", "--end", "2024-03-01"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("start_date"), "unexpected stderr: {stderr}");

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn show_unknown_entity_exits_non_zero() {
    let db_path = temp_path("show", "sqlite3");
    let output = cw_output(&db_path, &["show", "--entity-id", "404"]);
    assert!(!output.status.success());

    let _ = std::fs::remove_file(&db_path);
}
