use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("launchpad");
    let mut cmd = Command::new(path);
    cmd.env_remove("LAUNCHPAD_CONFIG")
        .env_remove("LAUNCHPAD_AUTH_COOKIE")
        .env_remove("RUST_LOG");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, format!("version: 1\n{body}")).unwrap();
    config_path
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("LAUNCHPAD_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    assert!(value["result"]["created"].as_bool().unwrap());

    let config_path = config_dir.join("config.yaml");
    assert!(config_path.exists());

    fs::write(&config_path, "sentinel: true\n").unwrap();

    let output = bin()
        .env("LAUNCHPAD_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["result"]["created"].as_bool().unwrap());
    assert_eq!(fs::read_to_string(&config_path).unwrap(), "sentinel: true\n");
}

#[test]
fn default_template_validates() {
    bin()
        .arg("--config")
        .arg("config/default.yaml")
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .stdout(contains("\"valid\":true"));
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path(), "unknown_field: true\n");

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    let error = value["error"].as_str().unwrap_or_default();
    assert!(error.contains("unknown_field") || error.contains("unknown field"));
}

#[test]
fn config_validate_rejects_bad_compression_level() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path(), "deployment:\n  compression_level: 12\n");

    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .stderr(contains("compression_level"));
}

#[test]
fn paths_follow_configured_root() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("data");
    let config_path = write_config(dir.path(), &format!("paths:\n  root: {}\n", root.display()));

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("paths")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    let result = &value["result"];
    assert_eq!(
        result["versions_dir"].as_str().unwrap(),
        root.join("Versions").to_string_lossy()
    );
    assert_eq!(
        result["lock_path"].as_str().unwrap(),
        root.join("Runtime").join("launchpad.lock").to_string_lossy()
    );
    assert!(result["lock_owner_pid"].is_null());
}

#[test]
fn resolve_with_pinned_version_needs_no_network() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("missing.yaml");

    let output = bin()
        .env("LAUNCHPAD_ROOT", dir.path())
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("resolve")
        .arg("--pin")
        .arg("123.45")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert_eq!(value["result"]["version_hash"], "123.45");
    assert_eq!(value["result"]["source"], "override");
}

#[test]
fn launch_without_installed_executable_fails() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("missing.yaml");

    let output = bin()
        .env("LAUNCHPAD_ROOT", dir.path())
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("launch")
        .arg("--no-deploy")
        .arg("--pin")
        .arg("version-missing")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["error"].as_str().unwrap().contains("launch failed"));
}

#[test]
fn ticket_requires_cookie() {
    bin()
        .arg("--config")
        .arg("config/default.yaml")
        .arg("ticket")
        .assert()
        .failure()
        .stderr(contains("LAUNCHPAD_AUTH_COOKIE"));
}

#[cfg(unix)]
#[test]
fn launch_installed_version_without_coordination() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("data");
    let config_path = write_config(
        dir.path(),
        &format!(
            "deployment:\n  executable: \"true\"\ncoordination:\n  readiness_settle_ms: 50\npaths:\n  root: {}\n",
            root.display()
        ),
    );
    let version_dir = root.join("Versions").join("v1");
    fs::create_dir_all(&version_dir).unwrap();
    let system_true = ["/bin/true", "/usr/bin/true"]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .expect("true binary");
    std::os::unix::fs::symlink(system_true, version_dir.join("true")).unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("launch")
        .arg("--pin")
        .arg("v1")
        .arg("--no-coordination")
        .arg("roblox-player:1+launchmode:play")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    let launch = &value["result"]["launch"];
    assert!(launch["launched"].as_bool().unwrap());
    assert!(launch["ready"].as_bool().unwrap());
    assert_eq!(launch["role"], "none");
    assert!(!value["result"]["deploy"]["freshly_installed"].as_bool().unwrap());
}

#[cfg(unix)]
#[test]
fn second_interrupt_terminates_blocked_request() {
    use std::net::TcpListener;
    use std::process::{Command as StdCommand, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let dir = tempdir().unwrap();
    let config_path = write_config(
        dir.path(),
        &format!(
            "http:\n  timeout_sec: 120\n  max_attempts: 1\nendpoints:\n  csrf_url: http://{addr}/csrf\n  ticket_url: http://{addr}/ticket\n"
        ),
    );

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("launchpad"))
        .arg("--config")
        .arg(&config_path)
        .arg("ticket")
        .env("LAUNCHPAD_AUTH_COOKIE", "cookie")
        .env_remove("RUST_LOG")
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy")
        .env("NO_PROXY", "127.0.0.1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Signal handlers are in place once the request reaches the listener.
    let (_stream, _) = listener.accept().unwrap();
    let started = Instant::now();
    let pid = child.id().to_string();
    let interrupt = || {
        let status = StdCommand::new("kill")
            .arg("-INT")
            .arg(&pid)
            .status()
            .unwrap();
        assert!(status.success());
    };
    interrupt();
    thread::sleep(Duration::from_millis(200));
    interrupt();

    let status = child.wait().unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(status.code(), Some(1));
}
