//! Closed-loop CPU load generation.
//!
//! The [`Loader`] instrument walks through its load steps, launching one
//! worker process per targeted logical CPU. Each worker pins itself and runs
//! a Monitor, Controller and Actuator until the step's duration is over.

mod actuator;
pub mod controller;
pub mod monitor;
mod worker;

pub use actuator::{ActuationReport, Actuator, ACTUATION_PERIOD};
pub use worker::{load_core, pin_to_core, WorkerLauncher, WorkerSpec};

use crate::config::{ConfigError, LoadStep};
use crate::instrument::{Core, Instrument, State};
use crate::message::{Body, Command};
use crate::topology::Topology;
use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use std::process::Child;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

/// A background thread of a worker process, stopped through its channel.
pub struct Role {
    name: String,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Role {
    #[must_use]
    pub fn new(name: &str, stop: Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.to_owned(),
            stop,
            handle,
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(self) {
        // An error only means the thread has already gone
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("{} thread panicked", self.name);
        }
        trace!("{} stopped", self.name);
    }
}

/// A load step with every shorthand expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    /// Physical cores, numbered from 1.
    pub target_cores: Vec<usize>,
    /// Percent of one logical CPU, one per entry of `target_cores`.
    pub target_loads: Vec<f64>,
    /// `None` runs until the workers are interrupted.
    pub duration: Option<Duration>,
    pub sampling_interval: Duration,
}

impl ResolvedStep {
    /// One worker per logical sibling of every target core. Every sibling is
    /// given the full percentage configured for its physical core, matching
    /// the per-thread load the sensor reports.
    #[must_use]
    pub fn workers(&self, topology: &Topology) -> Vec<WorkerSpec> {
        let mut workers = Vec::new();
        for (&core, &load) in self.target_cores.iter().zip(&self.target_loads) {
            let Some(siblings) = topology.siblings(core) else {
                warn!("Core {core} is not present, skipping");
                continue;
            };
            for &cpu in siblings {
                workers.push(WorkerSpec {
                    cpu,
                    load: load / 100.0,
                    duration: self.duration,
                    sampling_interval: self.sampling_interval,
                });
            }
        }
        workers
    }

    /// The step as announced in `start` and `stop` events.
    #[must_use]
    pub fn payload(&self) -> Body {
        let mut body = Body::new();
        body.insert("target_cores".to_owned(), Value::from(self.target_cores.clone()));
        body.insert("target_loads".to_owned(), Value::from(self.target_loads.clone()));
        body.insert(
            "duration".to_owned(),
            self.duration
                .map_or(Value::Null, |duration| Value::from(duration.as_secs_f64())),
        );
        body.insert(
            "sampling_interval".to_owned(),
            Value::from(self.sampling_interval.as_secs_f64()),
        );
        body
    }
}

/// Runs the configured load steps one after another.
///
/// A `stop` received between steps pauses the sequence; the next `start`
/// resumes it with the first step not yet executed. `finish` is sent once
/// every step has run.
pub struct Loader {
    core: Core,
    steps: Vec<LoadStep>,
    launcher: WorkerLauncher,
    topology: Option<Topology>,
    resolved: Vec<ResolvedStep>,
    next_step: usize,
}

impl Loader {
    #[must_use]
    pub fn new(name: &str, steps: Vec<LoadStep>, launcher: WorkerLauncher) -> Self {
        Self {
            core: Core::new(name),
            steps,
            launcher,
            topology: None,
            resolved: Vec::new(),
            next_step: 0,
        }
    }

    /// Use `topology` instead of the host's.
    #[must_use]
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    #[must_use]
    pub fn steps_done(&self) -> usize {
        self.next_step
    }

    fn resolve(&self, topology: &Topology) -> Result<Vec<ResolvedStep>, ConfigError> {
        self.steps
            .iter()
            .map(|step| step.resolve(topology))
            .collect()
    }

    /// Launch every worker of `step` and wait for all of them. Worker
    /// failures are logged; they never abort the step.
    fn execute(&self, step: &ResolvedStep, topology: &Topology) {
        let workers = step.workers(topology);
        debug!("{}: launching {} workers", self.name(), workers.len());
        let children: Vec<(WorkerSpec, Child)> = workers
            .into_iter()
            .filter_map(|spec| match self.launcher.spawn(&spec) {
                Ok(child) => Some((spec, child)),
                Err(e) => {
                    error!("Failed to launch worker for cpu{}: {e:#}", spec.cpu);
                    None
                }
            })
            .collect();

        for (spec, mut child) in children {
            match child.wait() {
                Ok(status) if status.success() => trace!("Worker on cpu{} done", spec.cpu),
                Ok(status) => warn!("Worker on cpu{} exited with {status}", spec.cpu),
                Err(e) => error!("Failed to wait for worker on cpu{}: {e}", spec.cpu),
            }
        }
    }
}

impl Instrument for Loader {
    fn core(&self) -> &Core {
        &self.core
    }

    fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    fn open(&mut self) -> Result<()> {
        let topology = match self.topology.take() {
            Some(topology) => topology,
            None => Topology::detect()?,
        };
        info!(
            "{} physical cores, {} logical, {} threads per core",
            topology.physical_cores(),
            topology.logical_cores(),
            topology.hyperthreading()
        );
        self.resolved = self
            .resolve(&topology)
            .context("Invalid load configuration")?;
        self.topology = Some(topology);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let Some(step) = self.resolved.get(self.next_step).cloned() else {
            self.send_event(Command::Finish, Body::new());
            self.core.set_state(State::Waiting);
            return Ok(());
        };
        let Some(topology) = self.topology.clone() else {
            // open() always stores one
            return Ok(());
        };

        let payload = step.payload();
        info!("Starting load: {}", Value::Object(payload.clone()));
        self.send_event(Command::Start, payload.clone());
        self.execute(&step, &topology);
        self.send_event(Command::Stop, payload);
        self.next_step += 1;

        if self.next_step == self.resolved.len() {
            info!("All {} load steps done", self.resolved.len());
            self.send_event(Command::Finish, Body::new());
            self.core.set_state(State::Waiting);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreSelection, LoadSelection};
    use crate::director::{Manager, Outcome};
    use crate::instrument::Link;
    use crate::message::Message;
    use log::LevelFilter;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Instant;

    fn step(cores: CoreSelection, loads: LoadSelection, duration: f64) -> LoadStep {
        LoadStep {
            target_cores: cores,
            target_loads: loads,
            duration,
            sampling_interval: 0.1,
        }
    }

    // `true` ignores its arguments, so workers finish immediately
    fn launcher() -> WorkerLauncher {
        WorkerLauncher::new(PathBuf::from("true"), LevelFilter::Warn)
    }

    fn receive(rx: &mpsc::Receiver<Message>) -> Message {
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    /// A stand-in worker program running `body` under /bin/sh.
    fn worker_script(directory: &Path, body: &str) -> WorkerLauncher {
        let path = directory.join("worker.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        WorkerLauncher::new(path, LevelFilter::Warn)
    }

    #[test]
    fn test_workers_per_sibling() {
        let topology = Topology::from_cores(vec![vec![0, 2], vec![1, 3]]);
        let resolved = ResolvedStep {
            target_cores: vec![2],
            target_loads: vec![40.0],
            duration: Some(Duration::from_secs(1)),
            sampling_interval: Duration::from_millis(100),
        };
        let workers = resolved.workers(&topology);
        let cpus: Vec<usize> = workers.iter().map(|w| w.cpu).collect();
        assert_eq!(cpus, [1, 3]);
        // Each hardware thread gets the whole percentage
        assert!(workers.iter().all(|w| (w.load - 0.4).abs() < 1e-12));
    }

    #[test]
    fn test_payload_keys() {
        let resolved = ResolvedStep {
            target_cores: vec![1, 2],
            target_loads: vec![10.0, 10.0],
            duration: None,
            sampling_interval: Duration::from_millis(100),
        };
        let payload = resolved.payload();
        let keys: Vec<&String> = payload.keys().collect();
        assert_eq!(
            keys,
            ["target_cores", "target_loads", "duration", "sampling_interval"]
        );
        assert_eq!(payload["duration"], Value::Null);
    }

    #[test]
    fn test_start_stop_per_step_then_finish() {
        let steps = vec![
            step(CoreSelection::all(), LoadSelection::Uniform(0.0), 0.1),
            step(
                CoreSelection::List(vec![2, 1]),
                LoadSelection::Each(vec![30.0, 20.0]),
                0.1,
            ),
            step(CoreSelection::List(vec![3]), LoadSelection::Uniform(5.0), 0.1),
        ];
        let mut loader = Loader::new("loader", steps, launcher()).with_topology(Topology::flat(3));
        let (link, peer) = Link::pair();
        loader.core_mut().attach(link);
        let handle = thread::spawn(move || {
            loader.main();
            loader.steps_done()
        });

        assert_eq!(receive(&peer.rx).command(), Some(Command::Ready));
        peer.tx
            .send(Message::event("manager", Command::Start, Body::new()))
            .unwrap();

        let mut events = Vec::new();
        loop {
            let message = receive(&peer.rx);
            let command = message.command().unwrap();
            events.push((command, message.body.get("target_cores").cloned()));
            if command == Command::Finish {
                break;
            }
        }
        peer.tx
            .send(Message::event("manager", Command::Close, Body::new()))
            .unwrap();
        assert_eq!(handle.join().unwrap(), 3);

        let commands: Vec<Command> = events.iter().map(|(command, _)| *command).collect();
        assert_eq!(
            commands,
            [
                Command::Start,
                Command::Stop,
                Command::Start,
                Command::Stop,
                Command::Start,
                Command::Stop,
                Command::Finish
            ]
        );
        assert_eq!(events[0].1, Some(serde_json::json!([1, 2, 3])));
        assert_eq!(events[2].1, Some(serde_json::json!([2, 1])));
        assert_eq!(events[5].1, Some(serde_json::json!([3])));
        // Nothing after finish
        assert!(peer.rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_pauses_between_steps() {
        let steps = vec![
            step(CoreSelection::all(), LoadSelection::Uniform(0.0), 0.1),
            step(CoreSelection::all(), LoadSelection::Uniform(0.0), 0.1),
        ];
        let mut loader = Loader::new("loader", steps, launcher()).with_topology(Topology::flat(1));
        loader.open().unwrap();
        loader.core().set_state(State::Running);
        loader.run().unwrap();
        assert_eq!(loader.steps_done(), 1);

        loader.process_message(Message::event("manager", Command::Stop, Body::new()));
        assert_eq!(loader.core().state(), State::Waiting);
        loader.process_message(Message::event("manager", Command::Start, Body::new()));
        assert_eq!(loader.core().state(), State::Running);
        loader.run().unwrap();
        assert_eq!(loader.steps_done(), 2);
        assert_eq!(loader.core().state(), State::Waiting);
    }

    #[test]
    fn test_invalid_step_fails_open() {
        let steps = vec![step(CoreSelection::List(vec![5]), LoadSelection::Uniform(10.0), 1.0)];
        let mut loader = Loader::new("loader", steps, launcher()).with_topology(Topology::flat(2));
        let error = loader.open().unwrap_err();
        assert!(format!("{error:#}").contains("Invalid load configuration"));
    }

    #[test]
    fn test_missing_program_does_not_abort_step() {
        let steps = vec![step(CoreSelection::all(), LoadSelection::Uniform(0.0), 0.1)];
        let launcher = WorkerLauncher::new(
            PathBuf::from("/nonexistent/rethebes-worker"),
            LevelFilter::Warn,
        );
        let mut loader = Loader::new("loader", steps, launcher).with_topology(Topology::flat(2));
        loader.open().unwrap();
        loader.core().set_state(State::Running);
        loader.run().unwrap();
        assert_eq!(loader.steps_done(), 1);
        assert_eq!(loader.core().state(), State::Waiting);
    }

    #[test]
    fn test_failed_worker_does_not_cut_step_short() {
        let directory = tempfile::tempdir().unwrap();
        // cpu0 dies at once, cpu1 outlives it
        let launcher = worker_script(
            directory.path(),
            r#"case "$*" in *"--core 0 "*) exit 3 ;; esac
sleep 0.4"#,
        );
        let steps = vec![step(CoreSelection::all(), LoadSelection::Uniform(10.0), 0.1)];
        let mut loader = Loader::new("loader", steps, launcher).with_topology(Topology::flat(2));
        let (link, peer) = Link::pair();
        loader.core_mut().attach(link);
        let handle = thread::spawn(move || loader.main());

        assert_eq!(receive(&peer.rx).command(), Some(Command::Ready));
        peer.tx
            .send(Message::event("manager", Command::Start, Body::new()))
            .unwrap();
        assert_eq!(receive(&peer.rx).command(), Some(Command::Start));
        let begin = Instant::now();
        assert_eq!(receive(&peer.rx).command(), Some(Command::Stop));
        let step_time = begin.elapsed();
        assert_eq!(receive(&peer.rx).command(), Some(Command::Finish));
        peer.tx
            .send(Message::event("manager", Command::Close, Body::new()))
            .unwrap();
        handle.join().unwrap();

        assert!(step_time >= Duration::from_millis(350), "{step_time:?}");
    }

    #[test]
    fn test_interrupt_during_step_runs_no_further_step() {
        let directory = tempfile::tempdir().unwrap();
        let calls = directory.path().join("calls");
        let launcher = worker_script(
            directory.path(),
            &format!("echo \"$*\" >> {}\nsleep 0.3", calls.display()),
        );
        let steps = (0..3)
            .map(|_| step(CoreSelection::all(), LoadSelection::Uniform(0.0), 0.3))
            .collect();
        let loader = Loader::new("loader", steps, launcher).with_topology(Topology::flat(1));
        // Polls so rarely that only the loader itself can notice in time
        let mut manager = Manager::new("manager", vec![Box::new(loader)], "loader")
            .unwrap()
            .with_poll_interval(Duration::from_secs(30));
        let interrupt = Arc::new(AtomicBool::new(false));
        manager.core_mut().set_interrupt(Arc::clone(&interrupt));
        let flag = Arc::clone(&interrupt);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            flag.store(true, Ordering::Relaxed);
        });

        let begin = Instant::now();
        manager.main();
        stopper.join().unwrap();

        assert_eq!(manager.outcome(), Some(&Outcome::Interrupted));
        assert!(begin.elapsed() < Duration::from_secs(5));
        let launched = fs::read_to_string(&calls).unwrap();
        assert_eq!(launched.lines().count(), 1, "{launched}");
    }
}
