//! Integration tests for the devfleet binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
default = "box"

[aliases]
main = "box"

[servers.box]
address = "10.1.2.3"
user = "dev"
home_dir = "/home/dev/project"
private_key = "/keys/dev"

[servers.edge]
address = "10.1.2.4:2222"
user = "ops"
home_dir = "/srv/app"
private_key = "/keys/ops"
"#;

fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fleet.toml"), CONFIG).unwrap();
    dir
}

fn devfleet(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("devfleet").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("DEVFLEET_CONFIG")
        .env_remove("DEVFLEET_DAEMON")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = workspace();
    devfleet(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("transfer"))
        .stdout(predicate::str::contains("ssh"))
        .stdout(predicate::str::contains("open"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_version() {
    let dir = workspace();
    devfleet(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_deploy_requires_servers() {
    let dir = workspace();
    devfleet(&dir).arg("deploy").assert().failure();
}

#[test]
fn test_ssh_print_default_server() {
    let dir = workspace();
    devfleet(&dir)
        .args(["-C", "fleet.toml", "ssh", "--print"])
        .assert()
        .success()
        .stdout("ssh -A -i /keys/dev dev@10.1.2.3\n");
}

#[test]
fn test_ssh_print_alias_and_port() {
    let dir = workspace();
    devfleet(&dir)
        .args(["-C", "fleet.toml", "ssh", "edge", "--print"])
        .assert()
        .success()
        .stdout("ssh -A -i /keys/ops -p 2222 ops@10.1.2.4\n");

    devfleet(&dir)
        .args(["-C", "fleet.toml", "ssh", "main", "--print"])
        .assert()
        .success()
        .stdout(predicate::str::ends_with("dev@10.1.2.3\n"));
}

#[test]
fn test_config_from_environment() {
    let dir = workspace();
    devfleet(&dir)
        .env("DEVFLEET_CONFIG", "fleet.toml")
        .args(["ssh", "--print"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dev@10.1.2.3"));
}

#[test]
fn test_unknown_server_exits_with_2() {
    let dir = workspace();
    devfleet(&dir)
        .args(["-C", "fleet.toml", "ssh", "ghost", "--print"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn test_no_default_server_exits_with_2() {
    let dir = tempfile::tempdir().unwrap();
    devfleet(&dir)
        .args(["ssh", "--print"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_config_file_exits_with_2() {
    let dir = workspace();
    devfleet(&dir)
        .args(["-C", "missing.toml", "ssh", "--print"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing.toml"));
}

#[test]
fn test_invalid_config_exits_with_2() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "servers = 3\n").unwrap();
    devfleet(&dir)
        .args(["-C", "bad.toml", "ssh", "--print"])
        .assert()
        .code(2);
}

#[test]
fn test_put_rejects_skip_existing() {
    let dir = workspace();
    devfleet(&dir)
        .args([
            "-C",
            "fleet.toml",
            "transfer",
            "put",
            "src",
            "--skip-existing",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--skip-existing"));
}

#[test]
fn test_transfer_rejects_unknown_direction() {
    let dir = workspace();
    devfleet(&dir)
        .args(["-C", "fleet.toml", "transfer", "box", "sideways", "src"])
        .assert()
        .failure();
}
