use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn shrun() -> Command {
    let mut cmd = Command::cargo_bin("shrun").unwrap();
    cmd.env_remove("SHRUN_LOG");
    cmd
}

fn script(source: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

#[test]
fn run_prints_script_output() {
    let file = script("greet() {\n  Print hello $1\n}\ngreet world\nPrintln done\n");
    shrun()
        .arg("run")
        .arg(file.path())
        .assert()
        .success()
        .stdout("hello world\ndone\n");
}

#[test]
fn exec_joins_arguments() {
    shrun()
        .args(["exec", "Print", "one", "two"])
        .assert()
        .success()
        .stdout("one two\n");
}

#[test]
fn failing_command_sets_the_exit_code() {
    shrun()
        .args(["exec", "ToUpper"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ToUpper"));
}

#[test]
fn security_violations_are_reported() {
    shrun()
        .args(["exec", "rm -rf /"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Security violation"));
}

#[test]
fn parse_errors_fail_the_run() {
    let file = script("if FileExists x\nthen\n  Print yes\n");
    shrun()
        .arg("run")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unterminated"));
}

#[test]
fn missing_config_is_an_error() {
    shrun()
        .args(["exec", "--config", "/nonexistent/shrun.toml", "Print x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn config_file_limits_loops() {
    let config = script("max_while_iterations = 3\n");
    shrun()
        .args(["exec", "--config"])
        .arg(config.path())
        .arg("while FileExists x\ndo\n  Print loop\ndone")
        .assert()
        .failure()
        .stderr(predicate::str::contains("resource exhausted"));
}

#[test]
fn check_counts_statements() {
    let file = script("# comment\nPrint a\nPrint b\n");
    shrun()
        .arg("check")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::ends_with(": 2 statements\n"));
}

#[cfg(unix)]
#[test]
fn timeout_exits_with_124() {
    shrun()
        .args(["exec", "--timeout-ms", "200", "sleep 5"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .code(124)
        .stderr(predicate::str::contains("timed out"));
}

#[cfg(unix)]
#[test]
fn external_exit_codes_pass_through() {
    shrun().args(["exec", "sh -c 'exit 7'"]).assert().code(7);
}

#[test]
fn debug_adapter_answers_initialize() {
    let body = r#"{"seq":1,"type":"request","command":"initialize","arguments":{}}"#;
    let disconnect = r#"{"seq":2,"type":"request","command":"disconnect"}"#;
    let input = format!(
        "Content-Length: {}\r\n\r\n{body}Content-Length: {}\r\n\r\n{disconnect}",
        body.len(),
        disconnect.len()
    );
    shrun()
        .arg("debug-adapter")
        .write_stdin(input)
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stdout(predicate::str::contains("supportsConfigurationDoneRequest"))
        .stdout(predicate::str::contains(r#""event":"terminated""#));
}
