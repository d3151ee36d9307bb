use crate::loader::actuator::{ActuationReport, Actuator};
use crate::loader::controller::Controller;
use crate::loader::monitor::Monitor;
use crate::loader::Role;
use anyhow::{bail, Context, Result};
use log::{debug, info, LevelFilter};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// What one worker process does: hold `load` on logical CPU `cpu`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub cpu: usize,
    /// Fraction of the CPU, 0.0 to 1.0.
    pub load: f64,
    /// `None` runs until interrupted.
    pub duration: Option<Duration>,
    pub sampling_interval: Duration,
}

impl Display for WorkerSpec {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "--core {} --load {} --sampling-interval {}",
            self.cpu,
            self.load * 100.0,
            self.sampling_interval.as_secs_f64()
        )?;
        if let Some(duration) = self.duration {
            write!(f, " --duration {}", duration.as_secs_f64())?;
        }
        Ok(())
    }
}

/// Starts worker processes by re-executing a program (normally this very
/// binary) with the hidden `worker` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    log_level: LevelFilter,
}

impl WorkerLauncher {
    #[must_use]
    pub fn new(program: PathBuf, log_level: LevelFilter) -> Self {
        Self { program, log_level }
    }

    /// Launch workers from the running executable.
    pub fn current(log_level: LevelFilter) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self::new(program, log_level))
    }

    /// Workers get the supervisor's log level explicitly on their command
    /// line; `--load` is in percent there.
    #[must_use]
    pub fn command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--log-level")
            .arg(self.log_level.to_string())
            .arg("worker")
            .arg("--core")
            .arg(spec.cpu.to_string())
            .arg("--load")
            .arg((spec.load * 100.0).to_string())
            .arg("--sampling-interval")
            .arg(spec.sampling_interval.as_secs_f64().to_string());
        if let Some(duration) = spec.duration {
            command.arg("--duration").arg(duration.as_secs_f64().to_string());
        }
        command
    }

    pub fn spawn(&self, spec: &WorkerSpec) -> Result<Child> {
        debug!("worker: {} worker {spec}", self.program.display());
        self.command(spec)
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program.display()))
    }
}

/// Restrict the calling thread, and every thread it spawns afterwards, to
/// logical CPU `cpu`.
pub fn pin_to_core(cpu: usize) -> Result<()> {
    let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
    if cpu >= capacity {
        bail!("CPU {cpu} is beyond the affinity mask ({capacity} CPUs)");
    }
    // SAFETY: `set` is a plain bitmask and `cpu` was checked against its size.
    let result = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if result != 0 {
        bail!(
            "Failed to pin to cpu{cpu}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Stops the Monitor and Controller threads however the actuation ends.
struct Roles(Vec<Role>);

impl Drop for Roles {
    fn drop(&mut self) {
        for role in self.0.drain(..) {
            role.stop();
        }
    }
}

/// Body of a worker process: pin, regulate and actuate until the duration
/// has passed or `stop` is raised.
pub fn load_core(spec: &WorkerSpec, stop: Arc<AtomicBool>) -> Result<ActuationReport> {
    pin_to_core(spec.cpu)?;

    let controller = Arc::new(Controller::default());
    controller.set_cpu_target(spec.load);
    let monitor = Arc::new(Monitor::new(spec.cpu, spec.sampling_interval));

    let mut roles = Roles(Vec::with_capacity(2));
    roles
        .0
        .push(monitor.start().context("Failed to start monitor")?);
    roles.0.push(
        controller
            .start(spec.sampling_interval)
            .context("Failed to start controller")?,
    );

    info!("cpu{}: loading at {:.0}%", spec.cpu, spec.load * 100.0);
    let report = Actuator::new(&controller, &monitor, spec.duration, stop).run();
    drop(roles);
    debug!("cpu{}: {report:?}", spec.cpu);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

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

    fn spec(duration: Option<Duration>) -> WorkerSpec {
        WorkerSpec {
            cpu: 3,
            load: 0.25,
            duration,
            sampling_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_command_line() {
        let launcher = WorkerLauncher::new(PathBuf::from("/usr/bin/rethebes"), LevelFilter::Debug);
        let command = launcher.command(&spec(Some(Duration::from_millis(1500))));
        let args: Vec<String> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--log-level",
                "DEBUG",
                "worker",
                "--core",
                "3",
                "--load",
                "25",
                "--sampling-interval",
                "0.1",
                "--duration",
                "1.5"
            ]
        );
    }

    #[test]
    fn test_endless_worker_has_no_duration() {
        let launcher = WorkerLauncher::new(PathBuf::from("rethebes"), LevelFilter::Info);
        let command = launcher.command(&spec(None));
        assert!(!command.get_args().any(|arg| arg == "--duration"));
        assert_eq!(spec(None).to_string(), "--core 3 --load 25 --sampling-interval 0.1");
    }

    #[test]
    fn test_pin_out_of_range() {
        assert!(pin_to_core(1 << 20).is_err());
    }

    #[test]
    fn test_load_core_stops_roles() {
        // Run on a helper thread so pinning does not affect other tests
        let cpu = allowed_cpu();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = std::thread::spawn(move || {
            let spec = WorkerSpec {
                cpu,
                load: 0.1,
                duration: Some(Duration::from_millis(300)),
                sampling_interval: Duration::from_millis(50),
            };
            load_core(&spec, flag)
        });
        let report = worker.join().unwrap().unwrap();
        assert!(!stop.load(Ordering::Relaxed));
        assert_eq!(report.cpu, cpu);
        assert!((report.target - 0.1).abs() < 1e-12);
        assert!(report.ticks > 0);
        assert!(report.elapsed_secs >= 0.3);
    }
}
