#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use quarry::{col, lit, var, MemoryTable, SelectBuilder, Statement, ValueType};
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_workload(dir: &TempDir, name: &str, statement: &Statement) -> PathBuf {
    let people = MemoryTable::with_columns(["id", "age"], ValueType::Int)
        .row([1, 30])
        .row([2, 17])
        .row([3, 52]);
    let pets = MemoryTable::with_columns(["owner", "legs"], ValueType::Int)
        .row([1, 4])
        .row([3, 2]);
    let workload = json!({
        "tables": { "people": people, "pets": pets },
        "variables": { "time_zone": "UTC" },
        "statement": statement,
    });
    let path = dir.path().join(format!("{name}.json"));
    fs::write(&path, serde_json::to_vec_pretty(&workload).expect("encode")).expect("write");
    path
}

fn join_statement() -> Statement {
    SelectBuilder::new()
        .columns(["p.id", "x.legs"])
        .from_as("people", "p")
        .join_as("pets", "x", col("p.id").eq(col("x.owner")))
        .filter(col("p.age").ge(lit(18)))
        .build()
        .expect("statement")
}

fn setup(name: &str, statement: &Statement) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = write_workload(&dir, name, statement);
    (dir, path)
}

#[test]
fn explain_prints_tree_and_hash() {
    let (_dir, path) = setup("explain", &join_statement());
    let output = cargo_bin_cmd!("quarry")
        .arg("explain")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.starts_with("Sequential [name=select]\n"), "{text}");
    assert!(text.contains("MergeJoin [left=p, right=x, on=p.id = x.owner]"));
    assert!(text.contains("predicate=p.age >= 18"));
    let hash_line = text.lines().last().expect("hash line");
    assert!(hash_line.starts_with("plan_hash: "));
    assert_eq!(hash_line.len(), "plan_hash: ".len() + 16);
}

#[test]
fn explain_redacts_literals() {
    let (_dir, path) = setup("redact", &join_statement());
    let output = cargo_bin_cmd!("quarry")
        .args(["explain", "--redact"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("predicate=?"));
    assert!(!text.contains(">= 18"));
}

#[test]
fn explain_json_redacts_literals() {
    let (_dir, path) = setup("redact-json", &join_statement());
    let output = cargo_bin_cmd!("quarry")
        .args(["--format", "json", "explain", "--redact"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: Value = serde_json::from_slice(&output).expect("json output");
    let text = report["plan"].to_string();
    assert!(!text.contains("18"), "{text}");
    let final_filter = report["plan"]["inputs"]
        .as_array()
        .expect("inputs")
        .iter()
        .find(|node| node["op"] == "WhereFinal")
        .expect("final filter");
    let predicate = final_filter["props"]
        .as_array()
        .expect("props")
        .iter()
        .find(|prop| prop["key"] == "predicate")
        .expect("predicate prop");
    assert_eq!(predicate["value"], "?");
    assert_eq!(report["plan_hash"].as_str().map(str::len), Some(16));
}

#[test]
fn explain_json_is_stable() {
    let (_dir, path) = setup("json", &join_statement());
    let run = || {
        let output = cargo_bin_cmd!("quarry")
            .args(["--format", "json", "explain"])
            .arg(&path)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice::<Value>(&output).expect("json output")
    };
    let first = run();
    assert_eq!(first, run());
    assert_eq!(first["plan"]["op"], "Sequential");
    let ops: Vec<&str> = first["plan"]["inputs"]
        .as_array()
        .expect("inputs")
        .iter()
        .map(|node| node["op"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(ops, ["Parallel", "MergeJoin", "WhereFinal", "Projection"]);
    assert_eq!(first["plan_hash"].as_str().map(str::len), Some(16));
}

#[test]
fn run_prints_rows_and_counters() {
    let (_dir, path) = setup("run", &join_statement());
    let output = cargo_bin_cmd!("quarry")
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        [
            "id=1, legs=4",
            "id=3, legs=2",
            "(2 rows; scanned=5 joined=2 filtered=1)",
        ]
    );
}

#[test]
fn run_json_reads_session_variables() {
    let statement = SelectBuilder::new()
        .column_as(var("time_zone"), "tz")
        .column(var("max_allowed_packet"))
        .system()
        .build()
        .expect("statement");
    let (_dir, path) = setup("vars", &statement);
    let output = cargo_bin_cmd!("quarry")
        .args(["--format", "json", "run"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(
        result["rows"],
        json!([{ "tz": "UTC", "@@max_allowed_packet": 4194304 }])
    );
    assert_eq!(result["stats"]["rows_scanned"], 1);
}

#[test]
fn config_file_applies_join_limit() {
    let (dir, path) = setup("limit", &join_statement());
    let config = dir.path().join("quarry.toml");
    fs::write(&config, "max_join_rows = 1\n").expect("write config");

    let output = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("max_join_rows = 1"), "{text}");
    assert!(text.contains("system_source = \"system\""));

    let output = cargo_bin_cmd!("quarry")
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&path)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("error:"), "{text}");
}

#[test]
fn unknown_source_fails() {
    let statement = SelectBuilder::new()
        .wildcard()
        .from("ghosts")
        .build()
        .expect("statement");
    let (_dir, path) = setup("missing", &statement);
    let output = cargo_bin_cmd!("quarry")
        .arg("explain")
        .arg(&path)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("error: could not find source for 'ghosts'"), "{text}");
}
