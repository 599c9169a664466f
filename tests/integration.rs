//! Integration tests for the openpath binary.
//!
//! Tests touching the packet filter or the resolver service require root
//! and are marked with #[ignore].
//! Run with: `sudo cargo test --release -- --ignored`

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Helper to get the path to the compiled binary
fn get_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_openpath"))
}

/// Check if running as root
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Run openpath command and return output
fn run_openpath(args: &[&str]) -> std::process::Output {
    Command::new(get_binary_path())
        .args(args)
        .output()
        .expect("Failed to execute openpath")
}

/// Write a config pointing every path into `dir`
fn write_config(dir: &Path, whitelist: &str) -> PathBuf {
    let whitelist_path = dir.join("whitelist.txt");
    std::fs::write(&whitelist_path, whitelist).unwrap();

    let config_path = dir.join("config.yaml");
    let yaml = format!(
        "state_dir: {state}\n\
         whitelist_path: {whitelist}\n\
         log_file: {log}\n\
         probe_timeout_secs: 1\n\
         firewall:\n  backend: nftables\n\
         resolver:\n  config_path: {resolver}\n",
        state = dir.join("state").display(),
        whitelist = whitelist_path.display(),
        log = dir.join("openpath.log").display(),
        resolver = dir.join("openpath.conf").display(),
    );
    std::fs::write(&config_path, yaml).unwrap();
    config_path
}

#[test]
fn test_version_command() {
    let output = run_openpath(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("openpath"));
}

#[test]
fn test_help_command() {
    let output = run_openpath(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("fail-open"));
    assert!(stdout.contains("watchdog"));
    assert!(stdout.contains("captive"));
}

#[test]
fn test_invalid_command() {
    let output = run_openpath(&["frobnicate"]);
    assert!(!output.status.success());
}

#[test]
fn test_check_allowed_and_blocked() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "example.invalid\n## BLOCKED-SUBDOMAINS\nads.example.invalid\n",
    );
    let config = config.to_str().unwrap();

    let output = run_openpath(&["check", "www.example.invalid", "--config", config]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("ALLOWED"));

    let output = run_openpath(&["check", "ads.example.invalid", "--config", config]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("BLOCKED"));

    let output = run_openpath(&["check", "other.invalid", "--config", config]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("NOT in the whitelist"));
}

#[test]
fn test_check_rejects_bad_domain() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "example.com\n");
    let output = run_openpath(&["check", "not a domain", "--config", config.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.yaml");
    std::fs::write(&config, "intervals:\n  update: forever\n").unwrap();

    let output = run_openpath(&["check", "example.com", "--config", config.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("intervals.update"));
}

#[test]
fn test_update_requires_root() {
    if is_root() {
        return;
    }
    let output = run_openpath(&["update"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("root"));
}

#[test]
#[ignore] // Queries systemctl and nft on the host
fn test_status_command() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "example.com\n");

    let output = run_openpath(&["status", "--config", config.to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FAIL-OPEN"));
    assert!(stdout.contains("Last cycle: never"));
}

#[test]
#[ignore] // Requires root, nftables and dnsmasq
fn test_update_and_fail_open_cycle() {
    if !is_root() {
        eprintln!("Skipping test_update_and_fail_open_cycle: requires root");
        return;
    }

    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "example.com\n");
    let config = config.to_str().unwrap();

    let output = run_openpath(&["update", "--config", config]);
    assert!(output.status.success());

    let output = run_openpath(&["fail-open", "integration test", "--config", config]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("fail"));
}
