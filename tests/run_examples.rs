/// Integration tests that run non-interactive examples
///
/// These tests verify that examples compile and execute successfully
/// without hanging or panicking.
use std::process::{Command, Stdio};

fn run_example(name: &str) {
    let status = Command::new("cargo")
        .args(["run", "--example", name, "--quiet"])
        .stdout(Stdio::null()) // Suppress stdout
        .stderr(Stdio::null()) // Suppress stderr
        .status()
        .unwrap_or_else(|e| panic!("Failed to run example {}: {}", name, e));

    assert!(
        status.success(),
        "Example '{}' failed with exit code: {:?}",
        name,
        status.code()
    );
}

#[test]
fn loopback_example() {
    run_example("loopback");
}
