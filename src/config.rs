//! JSON run configuration: parsing, defaulting and validation.

use crate::loader::ResolvedStep;
use crate::run::InstrumentKind;
use crate::topology::Topology;
use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    /// Used as is when `run` gets no configuration, and to complete the
    /// sections a configuration leaves out.
    pub static ref DEFAULT_CONFIGURATION: Configuration = Configuration {
        instruments: InstrumentList::List(vec!["loader".to_owned(), "sensor".to_owned()]),
        master: None,
        loader: Some(vec![LoadStep::default()]),
        sensor: Some(SensorConfig::default()),
        timer: Some(TimerConfig::default()),
        events_file: None,
    };
}

const AUTO: &str = "auto";

#[derive(Debug)]
pub enum ConfigError {
    NoHome,
    NotFound(String),
    Read { path: PathBuf, error: std::io::Error },
    Parse { path: PathBuf, error: serde_json::Error },
    UnknownInstrument(String),
    DuplicateInstrument(String),
    MasterNotListed(String),
    InvalidCores(String),
    NoCores,
    CoreOutOfRange { core: usize, available: usize },
    LoadCountMismatch { cores: usize, loads: usize },
    LoadOutOfRange(f64),
    InvalidInterval(f64),
    InvalidDuration(f64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoHome => write!(f, "HOME is not set, cannot locate ~/rethebes"),
            ConfigError::NotFound(name) => write!(f, "Config file not found: {name}"),
            ConfigError::Read { path, error } => {
                write!(f, "Failed to read '{}': {error}", path.display())
            }
            ConfigError::Parse { path, error } => {
                write!(f, "Failed to parse '{}': {error}", path.display())
            }
            ConfigError::UnknownInstrument(name) => write!(f, "Unknown instrument: {name}"),
            ConfigError::DuplicateInstrument(name) => {
                write!(f, "Instrument {name} is listed more than once")
            }
            ConfigError::MasterNotListed(name) => {
                write!(f, "Master {name} is not among the instruments")
            }
            ConfigError::InvalidCores(value) => {
                write!(f, "target_cores must be a list or \"all\", got \"{value}\"")
            }
            ConfigError::NoCores => write!(f, "target_cores is empty"),
            ConfigError::CoreOutOfRange { core, available } => write!(
                f,
                "Core {core} does not exist, cores are numbered 1 to {available}"
            ),
            ConfigError::LoadCountMismatch { cores, loads } => write!(
                f,
                "{loads} target_loads given for {cores} target_cores"
            ),
            ConfigError::LoadOutOfRange(load) => {
                write!(f, "Load {load} is outside 0 to 100")
            }
            ConfigError::InvalidInterval(interval) => {
                write!(f, "sampling_interval must be positive, got {interval}")
            }
            ConfigError::InvalidDuration(duration) => write!(f, "Invalid duration {duration}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { error, .. } => Some(error),
            ConfigError::Parse { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// `"all"` or physical core numbers starting at 1.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum CoreSelection {
    List(Vec<usize>),
    Keyword(String),
}

impl CoreSelection {
    #[must_use]
    pub fn all() -> Self {
        CoreSelection::Keyword("all".to_owned())
    }
}

impl Default for CoreSelection {
    fn default() -> Self {
        Self::all()
    }
}

/// Percent per target core, or one value for all of them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum LoadSelection {
    Each(Vec<f64>),
    Uniform(f64),
}

impl Default for LoadSelection {
    fn default() -> Self {
        LoadSelection::Uniform(0.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoadStep {
    pub target_cores: CoreSelection,
    pub target_loads: LoadSelection,
    /// Seconds; negative runs until interrupted.
    pub duration: f64,
    pub sampling_interval: f64,
}

impl Default for LoadStep {
    fn default() -> Self {
        Self {
            target_cores: CoreSelection::default(),
            target_loads: LoadSelection::default(),
            duration: 5.0,
            sampling_interval: 0.1,
        }
    }
}

impl LoadStep {
    /// Expand `"all"` and scalar loads against `topology` and check every
    /// value.
    pub fn resolve(&self, topology: &Topology) -> Result<ResolvedStep, ConfigError> {
        let available = topology.physical_cores();
        let target_cores = match &self.target_cores {
            CoreSelection::Keyword(keyword) if keyword == "all" => (1..=available).collect(),
            CoreSelection::Keyword(keyword) => {
                return Err(ConfigError::InvalidCores(keyword.clone()))
            }
            CoreSelection::List(cores) => cores.clone(),
        };
        if target_cores.is_empty() {
            return Err(ConfigError::NoCores);
        }
        if let Some(&core) = target_cores
            .iter()
            .find(|&&core| core == 0 || core > available)
        {
            return Err(ConfigError::CoreOutOfRange { core, available });
        }

        let target_loads = match &self.target_loads {
            LoadSelection::Uniform(load) => vec![*load; target_cores.len()],
            LoadSelection::Each(loads) if loads.len() == target_cores.len() => loads.clone(),
            LoadSelection::Each(loads) => {
                return Err(ConfigError::LoadCountMismatch {
                    cores: target_cores.len(),
                    loads: loads.len(),
                })
            }
        };
        if let Some(&load) = target_loads
            .iter()
            .find(|load| !(0.0..=100.0).contains(*load))
        {
            return Err(ConfigError::LoadOutOfRange(load));
        }

        Ok(ResolvedStep {
            target_cores,
            target_loads,
            duration: step_duration(self.duration)?,
            sampling_interval: interval(self.sampling_interval)?,
        })
    }
}

fn step_duration(seconds: f64) -> Result<Option<Duration>, ConfigError> {
    if seconds.is_nan() || seconds == f64::INFINITY {
        return Err(ConfigError::InvalidDuration(seconds));
    }
    if seconds < 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|_| ConfigError::InvalidDuration(seconds))
}

fn interval(seconds: f64) -> Result<Duration, ConfigError> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(ConfigError::InvalidInterval(seconds));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidInterval(seconds))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SensorConfig {
    pub sampling_interval: f64,
    /// Carry on with a warning when the temperature cannot be read.
    pub accept_incomplete_data: bool,
    pub write: bool,
    /// `"auto"` picks a time-stamped file under `~/rethebes/output`.
    pub file_name: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sampling_interval: 0.1,
            accept_incomplete_data: false,
            write: true,
            file_name: AUTO.to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TimerConfig {
    pub duration: f64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { duration: 5.0 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum InstrumentList {
    List(Vec<String>),
    Keyword(String),
}

impl Default for InstrumentList {
    fn default() -> Self {
        InstrumentList::Keyword(AUTO.to_owned())
    }
}

/// A configuration file as written by the user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Configuration {
    pub instruments: InstrumentList,
    pub master: Option<String>,
    pub loader: Option<Vec<LoadStep>>,
    pub sensor: Option<SensorConfig>,
    pub timer: Option<TimerConfig>,
    /// JSON-lines log of every message the manager routes.
    pub events_file: Option<PathBuf>,
}

/// Sensor settings with the output file decided.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub sampling_interval: Duration,
    pub accept_incomplete_data: bool,
    pub write: bool,
    pub file_name: PathBuf,
}

/// A configuration with every default applied, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub instruments: Vec<InstrumentKind>,
    pub master: InstrumentKind,
    pub loader: Vec<LoadStep>,
    pub sensor: SensorSettings,
    pub timer: Duration,
    pub events_file: Option<PathBuf>,
}

/// `~/rethebes`, where configurations and outputs live by default.
pub fn rethebes_home() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join("rethebes"))
        .ok_or(ConfigError::NoHome)
}

/// Look `name` up as a path, then in `<home>/config`, then with a `.json`
/// extension added.
pub fn find(name: &str, home: &Path) -> Result<PathBuf, ConfigError> {
    let config_dir = home.join("config");
    let candidates = [
        PathBuf::from(name),
        config_dir.join(name),
        config_dir.join(format!("{name}.json")),
    ];
    candidates
        .into_iter()
        .inspect(|candidate| trace!("Looking for configuration at {}", candidate.display()))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigError::NotFound(name.to_owned()))
}

pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
    let text = fs::read_to_string(path).map_err(|error| ConfigError::Read {
        path: path.to_owned(),
        error,
    })?;
    serde_json::from_str(&text).map_err(|error| ConfigError::Parse {
        path: path.to_owned(),
        error,
    })
}

/// Apply the defaulting rules: `"auto"` instruments, an implicit timer when
/// nothing else would end the run, the master choice, missing sections and
/// the automatic output file name under `home`.
pub fn process_configuration(
    configuration: Configuration,
    home: &Path,
    now: DateTime<Local>,
) -> Result<RunConfiguration, ConfigError> {
    let defaults = &*DEFAULT_CONFIGURATION;
    let names = match configuration.instruments {
        InstrumentList::Keyword(keyword) if keyword == AUTO => match &defaults.instruments {
            InstrumentList::List(names) => names.clone(),
            InstrumentList::Keyword(_) => Vec::new(),
        },
        InstrumentList::Keyword(name) => vec![name],
        InstrumentList::List(names) => names,
    };
    let mut instruments = Vec::with_capacity(names.len() + 1);
    for name in &names {
        let kind: InstrumentKind = name.parse()?;
        if instruments.contains(&kind) {
            return Err(ConfigError::DuplicateInstrument(name.clone()));
        }
        instruments.push(kind);
    }
    if !instruments.contains(&InstrumentKind::Loader) && !instruments.contains(&InstrumentKind::Timer)
    {
        debug!("No loader configured, adding a timer");
        instruments.push(InstrumentKind::Timer);
    }

    let master = match configuration.master {
        Some(name) => name.parse()?,
        None if instruments.contains(&InstrumentKind::Loader) => InstrumentKind::Loader,
        None => InstrumentKind::Timer,
    };
    if !instruments.contains(&master) {
        return Err(ConfigError::MasterNotListed(master.to_string()));
    }

    let loader = configuration
        .loader
        .or_else(|| defaults.loader.clone())
        .unwrap_or_default();
    let sensor = configuration
        .sensor
        .or_else(|| defaults.sensor.clone())
        .unwrap_or_default();
    let timer = configuration
        .timer
        .or_else(|| defaults.timer.clone())
        .unwrap_or_default();

    let file_name = if sensor.file_name == AUTO || sensor.file_name.is_empty() {
        home.join("output").join(auto_file_name(now))
    } else {
        PathBuf::from(&sensor.file_name)
    };
    let settings = RunConfiguration {
        instruments,
        master,
        loader,
        sensor: SensorSettings {
            sampling_interval: interval(sensor.sampling_interval)?,
            accept_incomplete_data: sensor.accept_incomplete_data,
            write: sensor.write,
            file_name,
        },
        timer: step_duration(timer.duration)?.ok_or(ConfigError::InvalidDuration(timer.duration))?,
        events_file: configuration.events_file,
    };
    debug!("Configuration: {settings:?}");
    Ok(settings)
}

/// Local ISO timestamp at second precision, `:` replaced so the name is
/// valid everywhere.
#[must_use]
pub fn auto_file_name(now: DateTime<Local>) -> String {
    format!("{}.csv", now.format("%Y-%m-%d-%H-%M-%S"))
}

impl RunConfiguration {
    /// Check every load step against `topology`.
    pub fn validate(&self, topology: &Topology) -> Result<(), ConfigError> {
        if self.instruments.contains(&InstrumentKind::Loader) {
            for step in &self.loader {
                step.resolve(topology)?;
            }
        }
        Ok(())
    }
}
