//! CLI tests that run without a database.

use std::process::{Command, Output};

fn execute_lease_watch(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lease-watch"))
        .args(args)
        .env_remove("LEASE_WATCH_CONNECTION_STRING")
        .env_remove("LEASE_WATCH_TABLE")
        .env("RUST_LOG", "lease_watch=debug")
        .output()
        .expect("failed to run lease-watch")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_lists_subcommands() {
    let output = execute_lease_watch(&["--help"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["watch", "enable-tracking", "disable-tracking", "poisoned"] {
        assert!(stdout.contains(command), "missing {command} in:\n{stdout}");
    }
}

#[test]
fn test_watch_requires_connection_string() {
    let output = execute_lease_watch(&["watch", "--table", "public.products"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("missing connection string"));
}

#[test]
fn test_watch_rejects_invalid_config_before_connecting() {
    let output = execute_lease_watch(&[
        "watch",
        "--connection-string",
        "host=127.0.0.1 port=1 user=nobody",
        "--table",
        "public.products",
        "--batch-size",
        "0",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("batch_size"), "{}", stderr(&output));
}

#[test]
fn test_watch_rejects_renew_interval_not_shorter_than_lease() {
    let output = execute_lease_watch(&[
        "watch",
        "--connection-string",
        "host=127.0.0.1 port=1 user=nobody",
        "--table",
        "products",
        "--lease-duration",
        "10s",
        "--renew-interval",
        "10s",
    ]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_enable_tracking_rejects_malformed_table_name() {
    let output = execute_lease_watch(&[
        "enable-tracking",
        "--connection-string",
        "host=127.0.0.1 port=1 user=nobody",
        "--table",
        "a.b.c",
    ]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_watch_rejects_fractional_lease_duration() {
    let output = execute_lease_watch(&[
        "watch",
        "--connection-string",
        "host=127.0.0.1 port=1 user=nobody",
        "--table",
        "products",
        "--lease-duration",
        "1900ms",
        "--renew-interval",
        "1500ms",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("whole number of seconds"), "{}", stderr(&output));
}
