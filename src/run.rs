use crate::config::{ConfigError, RunConfiguration};
use crate::director::{Manager, Outcome};
use crate::instrument::Instrument;
use crate::loader::{Loader, WorkerLauncher};
use crate::sensor::Sensor;
use crate::timer::Timer;
use crate::topology::Topology;
use anyhow::Result;
use log::info;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// The instruments a run can be made of.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstrumentKind {
    Loader,
    Sensor,
    Timer,
}

impl InstrumentKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            InstrumentKind::Loader => "loader",
            InstrumentKind::Sensor => "sensor",
            InstrumentKind::Timer => "timer",
        }
    }
}

impl Display for InstrumentKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for InstrumentKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loader" => Ok(InstrumentKind::Loader),
            "sensor" => Ok(InstrumentKind::Sensor),
            "timer" => Ok(InstrumentKind::Timer),
            other => Err(ConfigError::UnknownInstrument(other.to_owned())),
        }
    }
}

/// One benchmarking run: the configured instruments under a manager named
/// `manager`.
pub struct Session {
    configuration: RunConfiguration,
    topology: Topology,
    launcher: WorkerLauncher,
    interrupt: Arc<AtomicBool>,
    sensor_roots: Option<(PathBuf, PathBuf)>,
}

impl Session {
    /// Fails if a load step does not fit `topology`, before anything starts.
    pub fn new(
        configuration: RunConfiguration,
        topology: Topology,
        launcher: WorkerLauncher,
    ) -> Result<Self> {
        configuration.validate(&topology)?;
        Ok(Self {
            configuration,
            topology,
            launcher,
            interrupt: Arc::new(AtomicBool::new(false)),
            sensor_roots: None,
        })
    }

    /// Flag that, once raised, closes every instrument.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Have the sensor read these sysfs and procfs trees.
    #[must_use]
    pub fn with_sensor_roots(mut self, sysfs_root: PathBuf, procfs_root: PathBuf) -> Self {
        self.sensor_roots = Some((sysfs_root, procfs_root));
        self
    }

    fn build(&self, kind: InstrumentKind) -> Box<dyn Instrument> {
        let name = kind.name();
        match kind {
            InstrumentKind::Loader => Box::new(
                Loader::new(name, self.configuration.loader.clone(), self.launcher.clone())
                    .with_topology(self.topology.clone()),
            ),
            InstrumentKind::Sensor => {
                let sensor = Sensor::new(name, self.configuration.sensor.clone());
                match &self.sensor_roots {
                    Some((sysfs_root, procfs_root)) => {
                        Box::new(sensor.with_roots(sysfs_root, procfs_root))
                    }
                    None => Box::new(sensor),
                }
            }
            InstrumentKind::Timer => Box::new(Timer::new(name, self.configuration.timer)),
        }
    }

    /// Run to completion on the calling thread.
    pub fn run(self) -> Result<Outcome> {
        let instruments = self
            .configuration
            .instruments
            .iter()
            .map(|&kind| self.build(kind))
            .collect();
        let mut manager = Manager::new("manager", instruments, self.configuration.master.name())?;
        if let Some(events_file) = &self.configuration.events_file {
            manager = manager.with_event_log(events_file)?;
        }
        manager.core_mut().set_interrupt(Arc::clone(&self.interrupt));
        manager.main();

        let outcome = manager.outcome().cloned().unwrap_or(Outcome::Abandoned);
        info!("Run {outcome}");
        Ok(outcome)
    }
}
