//! CPU/memory-node affinity via the `cpuset` cgroup.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::OsError;
use crate::topology::parse_id_list;

fn join_ids(ids: &BTreeSet<u32>) -> String {
    ids.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// One cpuset cgroup directory for a single workload.
#[derive(Debug, Clone)]
pub struct CpuSet {
    mount: PathBuf,
    group_name: String,
}

impl CpuSet {
    pub fn new(mount: PathBuf, group_name: String) -> Self {
        CpuSet { mount, group_name }
    }

    fn group_path(&self) -> PathBuf {
        self.mount.join(&self.group_name)
    }

    pub fn create(&self) -> Result<(), OsError> {
        let path = self.group_path();
        fs::create_dir_all(&path).map_err(|e| OsError::from_io(path.display().to_string(), e))
    }

    pub fn add_task(&self, pid: i32) -> Result<(), OsError> {
        let path = self.group_path().join("tasks");
        fs::write(&path, format!("{}\n", pid))
            .map_err(|e| OsError::from_io(path.display().to_string(), e))
    }

    pub fn assign_cpus(&self, cores: &BTreeSet<u32>) -> Result<(), OsError> {
        let path = self.group_path().join("cpuset.cpus");
        fs::write(&path, format!("{}\n", join_ids(cores)))
            .map_err(|e| OsError::from_io(path.display().to_string(), e))
    }

    pub fn assign_mems(&self, nodes: &BTreeSet<u32>) -> Result<(), OsError> {
        let path = self.group_path().join("cpuset.mems");
        fs::write(&path, format!("{}\n", join_ids(nodes)))
            .map_err(|e| OsError::from_io(path.display().to_string(), e))
    }

    pub fn set_memory_migrate(&self, flag: bool) -> Result<(), OsError> {
        let path = self.group_path().join("cpuset.memory_migrate");
        fs::write(&path, format!("{}\n", flag as u8))
            .map_err(|e| OsError::from_io(path.display().to_string(), e))
    }

    pub fn read_cpus(&self) -> Result<BTreeSet<u32>, OsError> {
        let path = self.group_path().join("cpuset.cpus");
        let text = fs::read_to_string(&path).map_err(|e| OsError::from_io(path.display().to_string(), e))?;
        parse_id_list(&text)
    }

    pub fn read_mems(&self) -> Result<BTreeSet<u32>, OsError> {
        let path = self.group_path().join("cpuset.mems");
        let text = fs::read_to_string(&path).map_err(|e| OsError::from_io(path.display().to_string(), e))?;
        parse_id_list(&text)
    }

    pub fn remove(&self) -> Result<(), OsError> {
        let path = self.group_path();
        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OsError::from_io(path.display().to_string(), e)),
        }
    }
}
