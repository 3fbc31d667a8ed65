use std::ffi::OsString;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use vendtally_core::{BlobStore, PersistedState, SqliteBlobStore};

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::create_dir_all(&xdg_runtime).expect("failed to create XDG_RUNTIME_DIR");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn with_config(toml: &str) -> Self {
        let env = Self::new();
        let dir = env.xdg_config.join("vendtally");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), toml).expect("failed to write config");
        env
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("vendtally/state.db")
    }

    fn persisted_state(&self) -> PersistedState {
        let mut store = SqliteBlobStore::open(&self.db_path()).expect("failed to open state db");
        let blob = store
            .read()
            .expect("failed to read state")
            .expect("no state persisted");
        PersistedState::decode(&blob).expect("state should decode")
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(assert_cmd::cargo::cargo_bin!("vendtally"));
        command
            .args(args)
            .env("HOME", &self.home)
            .env("XDG_DATA_HOME", &self.xdg_data)
            .env("XDG_CONFIG_HOME", &self.xdg_config)
            .env("XDG_STATE_HOME", &self.xdg_state)
            .env("XDG_RUNTIME_DIR", &self.xdg_runtime)
            .env_remove("RUST_LOG");
        command
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    env.command(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute vendtally: {e}"))
}

fn run_with_stdin(env: &CliTestEnv, args: &[&str], input: &str) -> Output {
    let mut child = env
        .command(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("failed to spawn vendtally: {e}"));

    {
        let mut stdin = child.stdin.take().expect("stdin should be piped");
        stdin
            .write_all(input.as_bytes())
            .expect("failed to write stdin");
    }

    child
        .wait_with_output()
        .unwrap_or_else(|e| panic!("failed to wait for vendtally: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "vendtally {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

const MACHINE_CONFIG: &str = r#"
[counter]
machine_id = 4242
ring_buffer_size = 16
aggregation_interval = 3600
"#;

#[test]
fn status_without_state_reports_nothing() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("No counter state"),
        "expected empty status, got:\n{stdout}"
    );
    assert!(!env.db_path().exists());
}

#[test]
fn config_prints_effective_values_and_masks_key() {
    let env = CliTestEnv::with_config(
        r#"
[counter]
machine_id = 7
api_key = "vt_live_secret"
aggregation_interval = 900
"#,
    );

    let output = run_bin(&env, &["config"]);
    assert_success(&["config"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"machine_id\": 7"), "got:\n{stdout}");
    assert!(stdout.contains("\"aggregation_interval\": 900"));
    assert!(stdout.contains("\"ring_buffer_size\": 1000"));
    assert!(!stdout.contains("vt_live_secret"));
    assert!(stdout.contains("********"));
}

#[test]
fn config_warns_when_machine_id_missing() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["config"]);
    assert_success(&["config"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Warning:"), "got:\n{stdout}");
}

#[test]
fn record_without_machine_id_fails() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["record", "3"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to initialize counter"),
        "got:\n{stderr}"
    );
}

#[test]
fn record_persists_lifetime_total_across_runs() {
    let env = CliTestEnv::with_config(MACHINE_CONFIG);

    let args = ["record", "1", "2", "2"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let args = ["record", "9"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let state = env.persisted_state();
    assert_eq!(state.total_events, 4);
    assert_eq!(state.config.machine_id, 4242);
    assert_eq!(state.config.ring_buffer_size, 16);

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Lifetime events:  4"), "got:\n{stdout}");
    assert!(stdout.contains("Machine id:       4242"));
}

#[test]
fn record_rejects_category_zero_but_keeps_others() {
    let env = CliTestEnv::with_config(MACHINE_CONFIG);

    let args = ["record", "5", "0", "6"];
    let output = run_bin(&env, &args);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Rejected category 0"), "got:\n{stderr}");
    assert_eq!(env.persisted_state().total_events, 2);
}

#[test]
fn machine_id_flag_overrides_config() {
    let env = CliTestEnv::new();

    let args = ["--machine-id", "77", "record", "3"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    assert_eq!(env.persisted_state().config.machine_id, 77);
}

#[test]
fn run_counts_stdin_until_eof() {
    let env = CliTestEnv::with_config(MACHINE_CONFIG);

    let args = ["run", "--poll", "20"];
    let output = run_with_stdin(&env, &args, "1\n2\n\n# restock\n300\ncola\n2\n");
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Recorded 3 event(s), rejected 2"),
        "got:\n{stdout}"
    );
    assert!(stdout.contains("Lifetime events: 3"));

    assert_eq!(env.persisted_state().total_events, 3);
}

#[test]
fn sync_with_disabled_api_sends_nothing() {
    let env = CliTestEnv::with_config(MACHINE_CONFIG);

    let output = run_bin(&env, &["sync"]);
    assert_success(&["sync"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("External API is disabled"), "got:\n{stdout}");
}

#[test]
fn status_json_reports_persisted_state() {
    let env = CliTestEnv::with_config(MACHINE_CONFIG);

    let args = ["record", "4"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let args = ["status", "--json"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status --json should print JSON");
    assert_eq!(value["total_events"], 1);
    assert_eq!(value["config"]["machine_id"], 4242);
    assert_eq!(value["last_sync"], 0);
}

/// Answer every request with `status` and count them
fn spawn_collector(status: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind collector");
    let addr = listener.local_addr().expect("collector has no address");
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            read_http_request(&mut stream);
            seen.fetch_add(1, Ordering::SeqCst);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (format!("http://{addr}/consumption"), requests)
}

fn read_http_request(stream: &mut TcpStream) {
    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let Ok(n) = stream.read(&mut chunk) else { return };
        if n == 0 {
            return;
        }
        data.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&data);
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + content_length {
                return;
            }
        }
    }
}

#[test]
fn record_does_not_resend_failed_sync_on_shutdown() {
    let (endpoint, requests) = spawn_collector("400 Bad Request");
    let env = CliTestEnv::with_config(&format!(
        r#"
[counter]
machine_id = 4242
enable_external_api = true
aggregation_interval = 0
api_endpoint = "{endpoint}"
max_retry_attempts = 0
"#
    ));

    let output = run_bin(&env, &["record", "3"]);
    assert_success(&["record", "3"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Sync failed"), "stdout:\n{stdout}\nstderr:\n{stderr}");
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    // The unsent window is still open for the next run
    let state = env.persisted_state();
    assert_eq!(state.total_events, 1);
    assert_eq!(state.last_sync, 0);
}

#[test]
fn record_syncs_due_window_once() {
    let (endpoint, requests) = spawn_collector("200 OK");
    let env = CliTestEnv::with_config(&format!(
        r#"
[counter]
machine_id = 4242
enable_external_api = true
aggregation_interval = 0
api_endpoint = "{endpoint}"
"#
    ));

    let output = run_bin(&env, &["record", "3", "3"]);
    assert_success(&["record", "3", "3"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Synced 2 event(s)"), "got:\n{stdout}");
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert!(env.persisted_state().last_sync > 0);
}
