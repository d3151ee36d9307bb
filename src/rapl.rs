use glob::glob;
use log::{error, trace};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

// One sub-directory per RAPL domain, usually one per package. Energy of the
// whole package is in the domain's own energy_uj; sub-domains (core, uncore,
// dram) sit one level deeper and are not summed here.
const RAPL_DIR: &str = "devices/virtual/powercap/intel-rapl";

#[derive(Debug, Clone)]
struct Domain {
    id: u64,
    energy_path: PathBuf,
    /// Value at which the counter wraps back to zero, in µJ.
    max_energy_range: Option<u64>,
}

/// Energy counters of every package, read to derive package power.
#[derive(Debug)]
pub struct Rapl {
    domains: Vec<Domain>,
    previous: Option<EnergySample>,
}

#[derive(Debug, Clone)]
struct EnergySample {
    taken: Instant,
    /// µJ per domain, in the order of `Rapl::domains`.
    energy: Vec<u64>,
}

impl Rapl {
    /// Find the package domains under `sysfs_root` (normally `/sys`). Having
    /// none is not an error: power is then simply unavailable.
    #[must_use]
    pub fn discover(sysfs_root: &Path) -> Self {
        // Matches intel-rapl:0/energy_uj but not the nested intel-rapl:0:0
        let pattern = sysfs_root.join(RAPL_DIR).join("intel-rapl:*/energy_uj");
        let mut domains = Vec::new();
        match glob(&pattern.to_string_lossy()) {
            Ok(paths) => {
                for path in paths {
                    match path {
                        Ok(energy_path) => match Rapl::domain_from_path(&energy_path) {
                            Some(id) => {
                                let max_energy_range = energy_path
                                    .parent()
                                    .map(|dir| dir.join("max_energy_range_uj"))
                                    .and_then(|path| read_u64(&path));
                                domains.push(Domain {
                                    id,
                                    energy_path,
                                    max_energy_range,
                                });
                            }
                            None => trace!("Not a RAPL domain: {}", energy_path.display()),
                        },
                        Err(e) => error!("Failed to load RAPL path: {e}"),
                    }
                }
            }
            Err(e) => error!("Bad RAPL glob pattern: {e}"),
        }
        domains.sort_by_key(|domain| domain.id);
        trace!("RAPL domains: {domains:#?}");
        Self {
            domains,
            previous: None,
        }
    }

    #[must_use]
    pub fn domains(&self) -> usize {
        self.domains.len()
    }

    /// Read all counters; `None` if any of them is unreadable (energy_uj is
    /// root-only on recent kernels).
    fn read_energy(&self) -> Option<EnergySample> {
        if self.domains.is_empty() {
            return None;
        }
        let energy = self
            .domains
            .iter()
            .map(|domain| read_u64(&domain.energy_path))
            .collect::<Option<Vec<u64>>>()?;
        Some(EnergySample {
            taken: Instant::now(),
            energy,
        })
    }

    /// Total package power in watts since the previous call. The first call
    /// only takes a baseline and returns `None`.
    pub fn power(&mut self) -> Option<f64> {
        let current = self.read_energy()?;
        let previous = self.previous.replace(current.clone())?;
        let seconds = current.taken.duration_since(previous.taken).as_secs_f64();
        if seconds <= 0.0 {
            return None;
        }
        let joules: f64 = self
            .domains
            .iter()
            .zip(previous.energy.iter().zip(&current.energy))
            .map(|(domain, (&before, &after))| {
                let delta = if after >= before {
                    after - before
                } else {
                    // The counter wrapped
                    domain
                        .max_energy_range
                        .map_or(0, |range| range.saturating_sub(before) + after)
                };
                delta as f64 / 1e6
            })
            .sum();
        Some(joules / seconds)
    }

    /// Domain id from `.../intel-rapl:<id>/energy_uj`.
    #[must_use]
    pub fn domain_from_path(path: &Path) -> Option<u64> {
        path.parent()?
            .file_name()?
            .to_str()?
            .strip_prefix("intel-rapl:")?
            .parse::<u64>()
            .ok()
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
