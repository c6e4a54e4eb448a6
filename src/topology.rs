//! NUMA topology discovery from sysfs. Node/core layout is read at startup,
//! never hardcoded, so the controller adapts to whatever server it runs on.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::OsError;

/// Parse a Linux-style CPU/node list (`"0-3,8,10-12"`) into a set of ids.
pub fn parse_id_list(text: &str) -> Result<BTreeSet<u32>, OsError> {
    let text = text.trim();
    let mut out = BTreeSet::new();
    if text.is_empty() {
        return Ok(out);
    }
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| OsError::Malformed("id list".into(), text.to_string()))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| OsError::Malformed("id list".into(), text.to_string()))?;
            for id in lo..=hi {
                out.insert(id);
            }
        } else {
            let id: u32 = part
                .parse()
                .map_err(|_| OsError::Malformed("id list".into(), text.to_string()))?;
            out.insert(id);
        }
    }
    Ok(out)
}

/// Socket/node → cpu-set and the set of nodes that carry memory, as
/// reported by the kernel.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    pub cpu_topo: BTreeMap<u32, BTreeSet<u32>>,
    pub mem_nodes: BTreeSet<u32>,
}

impl NumaTopology {
    /// Read `/sys/devices/system/node/{online,has_memory}` and each node's
    /// `cpulist` to build the full topology.
    pub fn discover() -> Result<Self, OsError> {
        Self::discover_at(Path::new("/sys/devices/system/node"))
    }

    /// Same as [`discover`](Self::discover) but rooted at an arbitrary
    /// directory, so tests can point it at a scratch tree shaped like
    /// sysfs.
    pub fn discover_at(base: &Path) -> Result<Self, OsError> {
        let online = read_line(&base.join("online"))?;
        let node_list = parse_id_list(&online)?;

        let mut cpu_topo = BTreeMap::new();
        for &node in &node_list {
            let cpulist_path = base.join(format!("node{}/cpulist", node));
            let line = read_line(&cpulist_path)?;
            cpu_topo.insert(node, parse_id_list(&line)?);
        }

        let has_memory = read_line(&base.join("has_memory"))?;
        let mem_nodes = parse_id_list(&has_memory)?;

        if cpu_topo.is_empty() {
            return Err(OsError::MountMissing(base.display().to_string()));
        }

        Ok(NumaTopology {
            cpu_topo,
            mem_nodes,
        })
    }

    pub fn num_sockets(&self) -> usize {
        self.cpu_topo.len()
    }

    pub fn socket_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpu_topo.keys().copied()
    }

    pub fn cores_of(&self, socket: u32) -> Option<&BTreeSet<u32>> {
        self.cpu_topo.get(&socket)
    }

    pub fn core_to_socket(&self, core: u32) -> Option<u32> {
        self.cpu_topo
            .iter()
            .find(|(_, cores)| cores.contains(&core))
            .map(|(socket, _)| *socket)
    }

    /// Validate that every member of `cores` belongs to the same socket and
    /// return it.
    pub fn socket_of_cores(&self, cores: &BTreeSet<u32>) -> Result<u32, OsError> {
        let mut socket = None;
        for &core in cores {
            let s = self
                .core_to_socket(core)
                .ok_or_else(|| OsError::Malformed("core".into(), core.to_string()))?;
            match socket {
                None => socket = Some(s),
                Some(prev) if prev != s => {
                    return Err(OsError::Malformed(
                        "cores span multiple sockets".into(),
                        format!("{:?}", cores),
                    ))
                }
                _ => {}
            }
        }
        socket.ok_or_else(|| OsError::Malformed("cores".into(), "empty set".into()))
    }
}

fn read_line(path: &PathBuf) -> Result<String, OsError> {
    let text = fs::read_to_string(path).map_err(|e| OsError::from_io(path.display().to_string(), e))?;
    Ok(text.lines().next().unwrap_or("").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_hyphen_and_comma_ranges() {
        let set = parse_id_list("0-3,8,10-12").unwrap();
        let expected: BTreeSet<u32> = [0, 1, 2, 3, 8, 10, 11, 12].into_iter().collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn parses_single_id() {
        assert_eq!(parse_id_list("5").unwrap(), [5].into_iter().collect());
    }

    #[test]
    fn empty_list_is_empty_set() {
        assert!(parse_id_list("").unwrap().is_empty());
    }

    #[test]
    fn discovers_two_socket_layout_from_scratch_tree() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::write(base.join("online"), "0-1\n").unwrap();
        fs::write(base.join("has_memory"), "0-1\n").unwrap();
        fs::create_dir_all(base.join("node0")).unwrap();
        fs::create_dir_all(base.join("node1")).unwrap();
        fs::write(base.join("node0/cpulist"), "0-7\n").unwrap();
        fs::write(base.join("node1/cpulist"), "8-15\n").unwrap();

        let topo = NumaTopology::discover_at(base).unwrap();
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.core_to_socket(10), Some(1));
        assert_eq!(topo.core_to_socket(3), Some(0));
    }

    #[test]
    fn socket_of_cores_rejects_cross_socket_set() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::write(base.join("online"), "0-1\n").unwrap();
        fs::write(base.join("has_memory"), "0-1\n").unwrap();
        fs::create_dir_all(base.join("node0")).unwrap();
        fs::create_dir_all(base.join("node1")).unwrap();
        fs::write(base.join("node0/cpulist"), "0-7\n").unwrap();
        fs::write(base.join("node1/cpulist"), "8-15\n").unwrap();
        let topo = NumaTopology::discover_at(base).unwrap();

        let cross: BTreeSet<u32> = [3, 9].into_iter().collect();
        assert!(topo.socket_of_cores(&cross).is_err());
    }
}
