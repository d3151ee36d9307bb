use crate::rapl::Rapl;
use anyhow::{bail, Context, Result};
use glob::glob;
use log::{debug, trace};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const TOTAL_LOAD: &str = "Load CPU Total";
pub const PACKAGE_TEMPERATURE: &str = "Temperature CPU Package";
pub const PACKAGE_POWER: &str = "Power CPU Package";

// hwmon drivers exposing a package (or control) temperature
const HWMON_DRIVERS: [&str; 3] = ["coretemp", "k10temp", "zenpower"];
const PACKAGE_LABELS: [&str; 3] = ["Package id 0", "Tctl", "Tdie"];

/// Named measurements in a fixed order. `None` marks a measurement that
/// exists but could not be read this time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings(Vec<(String, Option<f64>)>);

impl Readings {
    pub fn push(&mut self, name: String, value: Option<f64>) {
        self.0.push((name, value));
    }

    /// `None` if there is no such measurement, `Some(None)` if it was
    /// unavailable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Option<f64>> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }
}

/// Jiffies from one `cpu` line of /proc/stat.
#[derive(Debug, Copy, Clone, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl CpuTimes {
    fn parse(fields: &[&str]) -> Option<Self> {
        // user nice system idle iowait irq softirq steal
        let values: Vec<u64> = fields
            .iter()
            .take(8)
            .map(|v| v.parse::<u64>().ok())
            .collect::<Option<_>>()?;
        if values.len() < 4 {
            return None;
        }
        let total: u64 = values.iter().sum();
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        Some(Self {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    /// Percent busy between `before` and `self`.
    fn load_since(&self, before: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(before.total)?;
        if total == 0 {
            return None;
        }
        let busy = self.busy.saturating_sub(before.busy);
        Some(100.0 * busy as f64 / total as f64)
    }
}

/// `cpu` lines of /proc/stat in file order, the aggregate line first.
fn read_stat(procfs_root: &Path) -> Result<Vec<(String, CpuTimes)>> {
    let path = procfs_root.join("stat");
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let lines: Vec<(String, CpuTimes)> = text
        .lines()
        .filter(|line| line.starts_with("cpu"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (label, values) = fields.split_first()?;
            CpuTimes::parse(values).map(|times| ((*label).to_owned(), times))
        })
        .collect();
    if lines.is_empty() {
        bail!("No cpu lines in {}", path.display());
    }
    Ok(lines)
}

fn load_key(label: &str) -> Option<String> {
    match label.strip_prefix("cpu")? {
        "" => Some(TOTAL_LOAD.to_owned()),
        id => id
            .parse::<usize>()
            .ok()
            .map(|id| format!("Load CPU Core #{}", id + 1)),
    }
}

/// Package temperature input of the first supported hwmon device.
fn find_temperature(sysfs_root: &Path) -> Option<PathBuf> {
    let pattern = sysfs_root.join("class/hwmon/hwmon*/name");
    for name_path in glob(&pattern.to_string_lossy()).ok()?.filter_map(Result::ok) {
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };
        let name = name.trim();
        if !HWMON_DRIVERS.contains(&name) {
            trace!("Skipping hwmon driver {name}");
            continue;
        }
        let dir = name_path.parent()?;
        let mut inputs: Vec<PathBuf> = glob(&dir.join("temp*_input").to_string_lossy())
            .ok()?
            .filter_map(Result::ok)
            .collect();
        inputs.sort();
        let labelled = inputs.iter().find(|input| {
            let label = input.to_string_lossy().replace("_input", "_label");
            fs::read_to_string(label)
                .map(|label| PACKAGE_LABELS.contains(&label.trim()))
                .unwrap_or(false)
        });
        if let Some(input) = labelled.or_else(|| inputs.first()) {
            debug!("Temperature from {name}: {}", input.display());
            return Some(input.clone());
        }
    }
    None
}

fn read_f64(path: &Path) -> Option<f64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// CPU measurements from sysfs and procfs.
#[derive(Debug)]
pub struct Cpu {
    procfs_root: PathBuf,
    clocks: Vec<(String, PathBuf)>,
    temperature: Option<PathBuf>,
    rapl: Rapl,
    previous: HashMap<String, CpuTimes>,
}

impl Cpu {
    /// Find every source once. Fails only if /proc/stat is unusable.
    pub fn discover(sysfs_root: &Path, procfs_root: &Path) -> Result<Self> {
        let stat = read_stat(procfs_root)?;
        let clocks = stat
            .iter()
            .filter_map(|(label, _)| {
                let id = label.strip_prefix("cpu")?.parse::<usize>().ok()?;
                let path = sysfs_root.join(format!(
                    "devices/system/cpu/cpu{id}/cpufreq/scaling_cur_freq"
                ));
                Some((format!("Clock CPU Core #{}", id + 1), path))
            })
            .collect();
        let temperature = find_temperature(sysfs_root);
        let mut rapl = Rapl::discover(sysfs_root);
        // Baseline so the first read already has a power figure
        let _ = rapl.power();
        Ok(Self {
            procfs_root: procfs_root.to_owned(),
            clocks,
            temperature,
            rapl,
            previous: stat.into_iter().collect(),
        })
    }

    /// One sample of every measurement. Loads and power cover the time
    /// since the previous call.
    pub fn read(&mut self) -> Result<Readings> {
        let mut readings = Readings::default();
        for (label, times) in read_stat(&self.procfs_root)? {
            let Some(key) = load_key(&label) else {
                continue;
            };
            let load = self
                .previous
                .get(&label)
                .and_then(|before| times.load_since(before));
            readings.push(key, load);
            self.previous.insert(label, times);
        }
        for (key, path) in &self.clocks {
            // kHz in sysfs
            readings.push(key.clone(), read_f64(path).map(|khz| khz / 1000.0));
        }
        let temperature = self
            .temperature
            .as_deref()
            .and_then(read_f64)
            .map(|millidegrees| millidegrees / 1000.0);
        readings.push(PACKAGE_TEMPERATURE.to_owned(), temperature);
        readings.push(PACKAGE_POWER.to_owned(), self.rapl.power());
        Ok(readings)
    }
}
