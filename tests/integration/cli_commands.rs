#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn cairn(dir: &Path, repo: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("cairn");
    cmd.env("CAIRN_CONFIG", dir.join("missing-cli.toml"))
        .env_remove("CAIRN_REPO")
        .arg("--repo")
        .arg(repo);
    cmd
}

fn json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let repo = dir.path().join("kg.cairn");
    cairn(dir.path(), &repo).arg("init").assert().success();
    (dir, repo)
}

fn add(dir: &Path, repo: &Path, content: &str, extra: &[&str]) -> String {
    let value = json(
        cairn(dir, repo)
            .args(["--format", "json", "add", content])
            .args(extra),
    );
    value["id"].as_str().expect("id").to_string()
}

#[test]
fn add_get_and_cat() {
    let (dir, repo) = setup();
    let id = add(dir.path(), &repo, "hello world", &["--meta", "title=greeting", "--meta", "rank=3"]);
    assert_eq!(id.len(), 64);

    let node = json(cairn(dir.path(), &repo).args(["--format", "json", "get", &id]));
    assert_eq!(node["metadata"]["title"], "greeting");
    assert_eq!(node["metadata"]["rank"], 3);
    assert_eq!(node["node_type"], "note");

    let out = cairn(dir.path(), &repo)
        .args(["cat", &id])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(out, b"hello world");
}

#[test]
fn link_list_and_unlink() {
    let (dir, repo) = setup();
    let a = add(dir.path(), &repo, "a", &["--id", "a"]);
    let b = add(dir.path(), &repo, "b", &["--id", "b"]);
    assert_eq!(a, "a");
    cairn(dir.path(), &repo)
        .args(["link", &a, &b, "--type", "cites"])
        .assert()
        .success();
    let links = json(cairn(dir.path(), &repo).args(["--format", "json", "links", &b]));
    assert_eq!(links.as_array().map(Vec::len), Some(1));
    assert_eq!(links[0]["link_type"], "cites");

    cairn(dir.path(), &repo)
        .args(["unlink", &a, &b, "--type", "cites"])
        .assert()
        .success();
    let links = json(cairn(dir.path(), &repo).args(["--format", "json", "links", &b]));
    assert_eq!(links.as_array().map(Vec::len), Some(0));
}

#[test]
fn export_then_import_into_new_repository() {
    let (dir, repo) = setup();
    let a = add(dir.path(), &repo, "first", &[]);
    let b = add(dir.path(), &repo, "second", &[]);
    cairn(dir.path(), &repo).args(["link", &a, &b]).assert().success();
    let archive = dir.path().join("graph.tar");
    let summary = json(
        cairn(dir.path(), &repo)
            .args(["--format", "json", "export"])
            .arg(&archive),
    );
    assert_eq!(summary["nodes"], 2);

    let other = dir.path().join("other.cairn");
    let summary = json(
        cairn(dir.path(), &other)
            .args(["--format", "json", "import"])
            .arg(&archive),
    );
    assert_eq!(summary["nodes_imported"], 2);
    assert_eq!(summary["edges_imported"], 1);

    let ids = json(cairn(dir.path(), &other).args(["--format", "json", "ls"]));
    assert_eq!(ids.as_array().map(Vec::len), Some(2));
}

#[test]
fn verify_and_stats_report_json() {
    let (dir, repo) = setup();
    add(dir.path(), &repo, "content", &[]);
    let report = json(cairn(dir.path(), &repo).args(["--format", "json", "verify"]));
    assert_eq!(report["success"], true);
    assert_eq!(report["counts"]["nodes_checked"], 1);

    let stats = json(cairn(dir.path(), &repo).args(["--format", "json", "stats"]));
    assert_eq!(stats["repository"]["node_count"], 1);
    assert!(stats["filesystem"]["log_size_bytes"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn missing_node_fails() {
    let (dir, repo) = setup();
    cairn(dir.path(), &repo)
        .args(["get", "nope"])
        .assert()
        .failure();
}

#[test]
fn missing_repository_fails() {
    let dir = TempDir::new().expect("tempdir");
    cairn(dir.path(), &dir.path().join("absent.cairn"))
        .arg("ls")
        .assert()
        .failure();
}

#[test]
fn completions_need_no_repository() {
    let dir = TempDir::new().expect("tempdir");
    let out = cargo_bin_cmd!("cairn")
        .env("CAIRN_CONFIG", dir.path().join("missing-cli.toml"))
        .env_remove("CAIRN_REPO")
        .args(["completions", "bash"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8_lossy(&out).contains("cairn"));
}

#[test]
fn plain_text_stats_are_sectioned() {
    let (dir, repo) = setup();
    add(dir.path(), &repo, "content", &[]);
    let out = cairn(dir.path(), &repo)
        .args(["--theme", "plain", "stats"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("Repository"));
    assert!(text.contains("nodes: 1"));
}
