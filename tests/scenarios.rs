use chrono::Local;
use log::LevelFilter;
use rethebes::config::{process_configuration, Configuration, RunConfiguration};
use rethebes::director::Outcome;
use rethebes::loader::WorkerLauncher;
use rethebes::run::Session;
use rethebes::topology::Topology;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

fn configuration(text: &str, home: &Path) -> RunConfiguration {
    let configuration: Configuration = serde_json::from_str(text).unwrap();
    process_configuration(configuration, home, Local::now()).unwrap()
}

fn launcher() -> WorkerLauncher {
    WorkerLauncher::new(PathBuf::from(env!("CARGO_BIN_EXE_rethebes")), LevelFilter::Warn)
}

/// First logical CPU this process may run on.
fn allowed_cpu() -> usize {
    // SAFETY: `set` is written by the kernel before being read.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        assert_eq!(
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set),
            0
        );
        (0..std::mem::size_of::<libc::cpu_set_t>() * 8)
            .find(|&cpu| libc::CPU_ISSET(cpu, &set))
            .unwrap()
    }
}

#[test]
fn test_missing_temperature_is_critical() {
    let home = tempfile::tempdir().unwrap();
    let sysfs = home.path().join("sys");
    let procfs = home.path().join("proc");
    fs::create_dir_all(&sysfs).unwrap();
    fs::create_dir_all(&procfs).unwrap();
    fs::write(procfs.join("stat"), "cpu  1 0 1 8 0 0 0 0 0 0\ncpu0 1 0 1 8 0 0 0 0 0 0\n").unwrap();

    let configuration = configuration(
        r#"{"instruments": ["sensor"], "sensor": {"accept_incomplete_data": false}}"#,
        home.path(),
    );
    let session = Session::new(configuration, Topology::flat(1), launcher())
        .unwrap()
        .with_sensor_roots(sysfs, procfs);

    let begin = Instant::now();
    match session.run().unwrap() {
        Outcome::Critical { sender, reason } => {
            assert_eq!(sender, "sensor");
            assert!(reason.contains("Could not read temperature"), "{reason}");
        }
        other => panic!("expected a critical outcome, got {other}"),
    }
    // The timer never got to finish
    assert!(begin.elapsed() < Duration::from_secs(5));
    assert!(!home.path().join("output").exists());
}

#[test]
fn test_short_idle_step_completes() {
    let home = tempfile::tempdir().unwrap();
    let configuration = configuration(
        r#"{
            "loader": [{"target_cores": "all", "target_loads": 0, "duration": 0.5, "sampling_interval": 0.1}],
            "sensor": {"accept_incomplete_data": true, "write": false}
        }"#,
        home.path(),
    );
    let topology = Topology::from_cores(vec![vec![allowed_cpu()]]);
    let session = Session::new(configuration, topology, launcher()).unwrap();

    let begin = Instant::now();
    assert_eq!(session.run().unwrap(), Outcome::Finished);
    assert!(begin.elapsed() < Duration::from_millis(3500), "{:?}", begin.elapsed());
}

#[test]
fn test_worker_converges_to_target() {
    let output = Command::new(env!("CARGO_BIN_EXE_rethebes"))
        .args(["--log-level", "warn", "worker", "--core"])
        .arg(allowed_cpu().to_string())
        .args(["--load", "50", "--duration", "4", "--sampling-interval", "0.1", "--report"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let report: Value = stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|value| value.get("tail_load").is_some())
        .unwrap();
    let tail_load = report["tail_load"].as_f64().unwrap();
    assert!((tail_load - 0.5).abs() <= 0.1, "{report}");
    assert!(report["elapsed_secs"].as_f64().unwrap() >= 4.0);
}

#[test]
fn test_missing_configuration_fails() {
    let home = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_rethebes"))
        .env("HOME", home.path())
        .env_remove("RUST_LOG")
        .args(["run", "does-not-exist"])
        .status()
        .unwrap();
    assert!(!status.success());
}
