//! DVFS-based memory-bandwidth throttling: caps a background workload's
//! cores via `cpufreq`'s `scaling_max_freq`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::OsError;

/// Frequency bounds for the machine, read once from core 0's `cpufreq`
/// directory (homogeneous cores assumed, as the reference implementation
/// does).
#[derive(Debug, Clone, Copy)]
pub struct CpuFreqBounds {
    pub min_khz: u64,
    pub max_khz: u64,
}

impl CpuFreqBounds {
    pub fn discover() -> Result<Self, OsError> {
        Self::discover_at(Path::new("/sys/devices/system/cpu"), 0)
    }

    pub fn discover_at(base: &Path, probe_core: u32) -> Result<Self, OsError> {
        let dir = base.join(format!("cpu{}/cpufreq", probe_core));
        let max_khz = read_u64(&dir.join("cpuinfo_max_freq"))?;
        let min_khz = read_u64(&dir.join("cpuinfo_min_freq"))?;
        Ok(CpuFreqBounds { min_khz, max_khz })
    }
}

fn read_u64(path: &PathBuf) -> Result<u64, OsError> {
    let text = fs::read_to_string(path).map_err(|e| OsError::from_io(path.display().to_string(), e))?;
    text.trim()
        .parse()
        .map_err(|_| OsError::Malformed(path.display().to_string(), text))
}

/// Write `scaling_max_freq` for a set of cores, rooted at an arbitrary
/// cpu sysfs directory so tests can target a scratch tree.
pub fn set_max_freq(base: &Path, cores: &BTreeSet<u32>, freq_khz: u64) -> Result<(), OsError> {
    for &core in cores {
        let path = base.join(format!("cpu{}/cpufreq/scaling_max_freq", core));
        fs::write(&path, format!("{}\n", freq_khz))
            .map_err(|e| OsError::from_io(path.display().to_string(), e))?;
    }
    Ok(())
}

pub fn set_max_freq_default(cores: &BTreeSet<u32>, freq_khz: u64) -> Result<(), OsError> {
    set_max_freq(Path::new("/sys/devices/system/cpu"), cores, freq_khz)
}
