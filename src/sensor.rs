mod cpu;

pub use cpu::{Cpu, Readings, PACKAGE_POWER, PACKAGE_TEMPERATURE, TOTAL_LOAD};

use crate::config::SensorSettings;
use crate::instrument::{Core, Instrument};
use crate::message::{Body, Message};
use anyhow::{bail, Context, Result};
use chrono::{Local, SecondsFormat};
use log::{info, warn};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

const TEMPERATURE_UNAVAILABLE: &str = "Could not read temperature. This is most likely due to \
    rethebes not running with elevated privileges or to a CPU without a coretemp, k10temp or \
    zenpower driver. Please re-execute with elevated privileges or set accept_incomplete_data.";

/// Sample file: a `Time` column followed by one column per measurement.
struct CsvLog {
    path: PathBuf,
    file: BufWriter<File>,
    header_written: bool,
}

impl CsvLog {
    fn create(path: &Path) -> Result<Self> {
        if let Some(directory) = path.parent() {
            if !directory.as_os_str().is_empty() && !directory.exists() {
                fs::create_dir_all(directory)
                    .with_context(|| format!("Failed to create {}", directory.display()))?;
                info!("Created directory {}", directory.display());
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_owned(),
            file: BufWriter::new(file),
            header_written: false,
        })
    }

    fn write(&mut self, time: &str, readings: &Readings) -> Result<()> {
        if !self.header_written {
            let header: Vec<&str> = readings.iter().map(|(key, _)| key).collect();
            writeln!(self.file, "Time,{}", header.join(","))?;
            self.header_written = true;
        }
        let row: Vec<String> = readings
            .iter()
            .map(|(_, value)| value.map(|v| v.to_string()).unwrap_or_default())
            .collect();
        writeln!(self.file, "{time},{}", row.join(","))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Samples CPU load, clock, temperature and power once per sampling
/// interval, writing each sample to a CSV file and sending it to the
/// supervisor as a data message.
pub struct Sensor {
    core: Core,
    settings: SensorSettings,
    sysfs_root: PathBuf,
    procfs_root: PathBuf,
    cpu: Option<Cpu>,
    log: Option<CsvLog>,
}

impl Sensor {
    #[must_use]
    pub fn new(name: &str, settings: SensorSettings) -> Self {
        Self {
            core: Core::new(name),
            settings,
            sysfs_root: PathBuf::from("/sys"),
            procfs_root: PathBuf::from("/proc"),
            cpu: None,
            log: None,
        }
    }

    /// Read from alternative sysfs and procfs trees.
    #[must_use]
    pub fn with_roots(mut self, sysfs_root: &Path, procfs_root: &Path) -> Self {
        self.sysfs_root = sysfs_root.to_owned();
        self.procfs_root = procfs_root.to_owned();
        self
    }

    fn sample(&mut self) -> Result<()> {
        let Some(cpu) = self.cpu.as_mut() else {
            bail!("Sensor used before opening");
        };
        let readings = cpu.read().context("Reading sensors failed")?;
        let time = Local::now().to_rfc3339_opts(SecondsFormat::Micros, false);
        if let Some(log) = self.log.as_mut() {
            log.write(&time, &readings)?;
        }

        let mut body = Body::new();
        body.insert("Time".to_owned(), Value::from(time));
        for (key, value) in readings.iter() {
            body.insert(key.to_owned(), value.map_or(Value::Null, Value::from));
        }
        let message = Message::data(self.name(), body);
        self.send_message(message);
        Ok(())
    }
}

impl Instrument for Sensor {
    fn core(&self) -> &Core {
        &self.core
    }

    fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    fn open(&mut self) -> Result<()> {
        let mut cpu =
            Cpu::discover(&self.sysfs_root, &self.procfs_root).context("Reading sensors failed")?;
        let test_read = cpu.read().context("Reading sensors failed")?;
        if test_read.is_empty() {
            bail!("Reading sensors failed");
        }
        if test_read.get(PACKAGE_TEMPERATURE).flatten().is_none() {
            if self.settings.accept_incomplete_data {
                warn!("{TEMPERATURE_UNAVAILABLE}");
            } else {
                bail!(TEMPERATURE_UNAVAILABLE);
            }
        }
        self.cpu = Some(cpu);

        if self.settings.write {
            self.log = Some(CsvLog::create(&self.settings.file_name)?);
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.sampling_interval;
        self.sample()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            self.listen(Some(remaining));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut log) = self.log.take() {
            log.flush()?;
            info!("Sensor data saved correctly in {}", log.path.display());
        }
        Ok(())
    }
}
