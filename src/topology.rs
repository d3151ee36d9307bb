use anyhow::{anyhow, bail, Context, Result};
use glob::glob;
use log::{trace, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// One sub-directory per logical CPU; siblings of a physical core share a
// (physical_package_id, core_id) pair.
const CPU_DIR: &str = "devices/system/cpu";

/// Logical CPUs grouped by physical core.
///
/// Physical cores are numbered from 1 in ascending order of their first
/// logical CPU, matching the numbering used in load configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    cores: Vec<Vec<usize>>,
}

impl Topology {
    /// Topology of the running host, falling back to one physical core per
    /// online CPU if sysfs has no topology information.
    pub fn detect() -> Result<Self> {
        match Self::from_sysfs(Path::new("/sys")) {
            Ok(topology) => Ok(topology),
            Err(e) => {
                warn!("No CPU topology in sysfs ({e:#}), assuming no SMT");
                let online = sysconf::sysconf(sysconf::SysconfVariable::ScNprocessorsOnln)
                    .map_err(|e| anyhow!("Failed to count online CPUs: {e:?}"))?;
                Ok(Self::flat(online.max(1) as usize))
            }
        }
    }

    /// Read `cpu*/topology` under `sysfs_root` (normally `/sys`).
    pub fn from_sysfs(sysfs_root: &Path) -> Result<Self> {
        let pattern = sysfs_root.join(CPU_DIR).join("cpu[0-9]*");
        let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        for cpu_path in glob(&pattern.to_string_lossy())?.filter_map(Result::ok) {
            let cpu_id = cpu_path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("cpu"))
                .and_then(|id| id.parse::<usize>().ok())
                .ok_or_else(|| anyhow!("Failed to parse cpu ID {}", cpu_path.display()))?;
            let top_path = cpu_path.join("topology");
            if !top_path.exists() {
                // Offline CPUs have no topology directory
                trace!("Skipping cpu{cpu_id}: no topology");
                continue;
            }
            let core_id = read_file_usize(&top_path.join("core_id"))?;
            let package_id = read_file_usize(&top_path.join("physical_package_id")).unwrap_or(0);
            groups.entry((package_id, core_id)).or_default().push(cpu_id);
        }
        if groups.is_empty() {
            bail!("No CPU topology under {}", pattern.display());
        }

        let mut cores: Vec<Vec<usize>> = groups
            .into_values()
            .map(|mut siblings| {
                siblings.sort_unstable();
                siblings
            })
            .collect();
        cores.sort_by_key(|siblings| siblings[0]);
        trace!("CPU topology: {cores:?}");
        Ok(Self { cores })
    }

    /// `count` physical cores without SMT.
    #[must_use]
    pub fn flat(count: usize) -> Self {
        Self {
            cores: (0..count).map(|cpu| vec![cpu]).collect(),
        }
    }

    /// Explicit sibling lists, one per physical core.
    #[must_use]
    pub fn from_cores(cores: Vec<Vec<usize>>) -> Self {
        Self { cores }
    }

    #[must_use]
    pub fn physical_cores(&self) -> usize {
        self.cores.len()
    }

    #[must_use]
    pub fn logical_cores(&self) -> usize {
        self.cores.iter().map(Vec::len).sum()
    }

    /// Hardware threads per physical core.
    #[must_use]
    pub fn hyperthreading(&self) -> usize {
        match self.physical_cores() {
            0 => 1,
            physical => (self.logical_cores() / physical).max(1),
        }
    }

    /// Logical CPUs of physical core `core` (1-based).
    #[must_use]
    pub fn siblings(&self, core: usize) -> Option<&[usize]> {
        core.checked_sub(1)
            .and_then(|index| self.cores.get(index))
            .map(Vec::as_slice)
    }
}

fn read_file_usize(path: &Path) -> Result<usize> {
    let val = fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {}", path.display()))?;
    val.trim()
        .parse::<usize>()
        .with_context(|| format!("Failed to parse {} as usize", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fake_cpu(root: &Path, cpu: usize, package: usize, core: usize) {
        let top_path: PathBuf = root.join(CPU_DIR).join(format!("cpu{cpu}/topology"));
        fs::create_dir_all(&top_path).unwrap();
        fs::write(top_path.join("core_id"), format!("{core}\n")).unwrap();
        fs::write(top_path.join("physical_package_id"), format!("{package}\n")).unwrap();
    }

    #[test]
    fn test_smt_siblings_grouped() {
        let root = tempfile::tempdir().unwrap();
        // Linux usually numbers the second hardware thread after all first ones
        for (cpu, core) in [(0, 0), (1, 1), (2, 0), (3, 1)] {
            fake_cpu(root.path(), cpu, 0, core);
        }
        let topology = Topology::from_sysfs(root.path()).unwrap();
        assert_eq!(topology.physical_cores(), 2);
        assert_eq!(topology.logical_cores(), 4);
        assert_eq!(topology.hyperthreading(), 2);
        assert_eq!(topology.siblings(1), Some(&[0, 2][..]));
        assert_eq!(topology.siblings(2), Some(&[1, 3][..]));
        assert_eq!(topology.siblings(0), None);
        assert_eq!(topology.siblings(3), None);
    }

    #[test]
    fn test_packages_kept_apart() {
        let root = tempfile::tempdir().unwrap();
        for (cpu, package) in [(0, 0), (1, 1)] {
            fake_cpu(root.path(), cpu, package, 0);
        }
        fs::create_dir_all(root.path().join(CPU_DIR).join("cpufreq")).unwrap();
        let topology = Topology::from_sysfs(root.path()).unwrap();
        assert_eq!(topology, Topology::from_cores(vec![vec![0], vec![1]]));
        assert_eq!(topology.hyperthreading(), 1);
    }

    #[test]
    fn test_empty_sysfs_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(Topology::from_sysfs(root.path()).is_err());
    }

    #[test]
    fn test_flat() {
        let topology = Topology::flat(3);
        assert_eq!(topology.siblings(3), Some(&[2][..]));
        assert_eq!(topology.hyperthreading(), 1);
    }
}
