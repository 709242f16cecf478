//! End-to-end runs of the cif-feeder binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

const FEED: &str = r#"
name = "e2e-feed"
format = "csv"
values = ["observable", "description"]

[defaults]
otype = "ipv4"
tags = ["scanner"]
"#;

#[test]
fn test_feeder_writes_json_lines_and_journal() {
    let dir = tempfile::tempdir().unwrap();
    let feed = dir.path().join("feed.toml");
    let data = dir.path().join("data.csv");
    let output = dir.path().join("out.jsonl");
    let journals = dir.path().join("journals");

    fs::write(&feed, FEED).unwrap();
    fs::write(&data, "192.0.2.1,ssh\n192.0.2.2,telnet\nbroken\n192.0.2.1,ssh\n").unwrap();

    for _ in 0..2 {
        Command::cargo_bin("cif-feeder")
            .unwrap()
            .env("LOG_LEVEL", "warn")
            .arg("--feed")
            .arg(&feed)
            .arg("--file")
            .arg(&data)
            .arg("--journal-dir")
            .arg(&journals)
            .arg("--output")
            .arg(&output)
            .args(["--batch", "1"])
            .assert()
            .success();
    }

    let written = fs::read_to_string(&output).unwrap();
    let lines: Vec<serde_json::Value> = written
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    // Second run finds a finished journal and emits nothing
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["observable"], "192.0.2.1");
    assert_eq!(lines[1]["otype"], "ipv4");

    let journal: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(journals.join("e2e-feed.journal.json")).unwrap())
            .unwrap();
    assert_eq!(journal["total_objects"], 2);
    assert_eq!(journal["parsing"], false);
}

#[test]
fn test_feeder_rejects_invalid_feed() {
    let dir = tempfile::tempdir().unwrap();
    let feed = dir.path().join("feed.toml");
    fs::write(&feed, "name = \"x\"\nvalues = [\"description\"]\n").unwrap();

    Command::cargo_bin("cif-feeder")
        .unwrap()
        .arg("--feed")
        .arg(&feed)
        .arg("--file")
        .arg(dir.path().join("missing.csv"))
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("observable"));
}
