//! Command line behaviour that needs no privileges: everything here fails or
//! exits before the network worker starts.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn cli_command() -> Command {
    Command::cargo_bin("netmirage-core").expect("Failed to find netmirage-core binary")
}

#[test]
fn test_help_and_version() {
    cli_command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Emulate a large IP network"))
        .stdout(predicate::str::contains("--edge-node"))
        .stdout(predicate::str::contains("--two-pass"));

    cli_command()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("netmirage-core"));
}

#[test]
fn test_invalid_vsubnet() {
    cli_command()
        .args(["--vsubnet", "10.0.0.0/99", "-f", "t.graphml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("10.0.0.0/99"));
}

#[test]
fn test_missing_topology() {
    cli_command()
        .args(["-e", "192.168.0.2,iface=eth1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No topology file given"));
}

#[test]
fn test_missing_edges_and_interfaces() {
    cli_command()
        .args(["-f", "t.graphml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No edge nodes given"));

    cli_command()
        .args(["-f", "t.graphml", "-e", "192.168.0.2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No interface for edge node 192.168.0.2"));
}

#[test]
fn test_setup_file_errors() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[emulator]\nbogus-option = 1").unwrap();
    cli_command()
        .arg("--setup-file")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown option 'bogus-option'"));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[emulator]\nfile = t.graphml\n[edge]\niface = eth0").unwrap();
    cli_command()
        .arg("-s")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains(":3: edge group has no ip"));

    cli_command()
        .args(["-s", "/nonexistent/netmirage.cfg"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not read setup file"));
}
