//! LLC partitioning via the kernel's `resctrl` (Intel CAT) filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::OsError;

/// Capacity bitmask parameters read once from `resctrl`'s info directory.
#[derive(Debug, Clone, Copy)]
pub struct ResctrlInfo {
    pub max_bits: u32,
    pub min_bits: u32,
}

impl ResctrlInfo {
    pub fn discover() -> Result<Self, OsError> {
        Self::discover_at(Path::new("/sys/fs/resctrl"))
    }

    pub fn discover_at(mount: &Path) -> Result<Self, OsError> {
        let cbm_path = mount.join("info/L3/cbm_mask");
        let cbm_mask = fs::read_to_string(&cbm_path)
            .map_err(|e| OsError::from_io(cbm_path.display().to_string(), e))?;
        let max_bits = len_of_mask(cbm_mask.trim())?;

        let min_path = mount.join("info/L3/min_cbm_bits");
        let min_text = fs::read_to_string(&min_path)
            .map_err(|e| OsError::from_io(min_path.display().to_string(), e))?;
        let min_bits: u32 = min_text
            .trim()
            .parse()
            .map_err(|_| OsError::Malformed(min_path.display().to_string(), min_text))?;

        Ok(ResctrlInfo { max_bits, min_bits })
    }
}

fn len_of_mask(mask: &str) -> Result<u32, OsError> {
    let mut num = u64::from_str_radix(mask, 16)
        .map_err(|_| OsError::Malformed("cbm_mask".into(), mask.to_string()))?;
    let mut count = 0;
    while num != 0 {
        count += 1;
        num >>= 1;
    }
    Ok(count)
}

/// Build a contiguous bitmask of `end - start` ones, left-shifted so the
/// slice sits at `[start, end)` counting from the low-order bit, within a
/// mask `max_bits` wide.
pub fn gen_mask(start: u32, end: u32, max_bits: u32) -> String {
    let end = end.min(max_bits);
    if end <= start {
        return "0".to_string();
    }
    let width = end - start;
    let value = ((1u64 << width) - 1) << (max_bits - end);
    format!("{:x}", value)
}

/// One `resctrl` control group: a directory under the mount point holding
/// a task list and a schemata file.
#[derive(Debug, Clone)]
pub struct ResctrlGroup {
    mount: PathBuf,
    group_name: String,
}

impl ResctrlGroup {
    pub fn new(mount: PathBuf, group_name: String) -> Self {
        ResctrlGroup { mount, group_name }
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

    /// Write `schemata` with one `L3:` line mapping socket index to mask,
    /// in ascending socket order, e.g. `"L3:0=fff;1=fff\n"`.
    pub fn assign_llc(&self, masks: &[(u32, String)]) -> Result<(), OsError> {
        let body = masks
            .iter()
            .map(|(socket, mask)| format!("{}={}", socket, mask))
            .collect::<Vec<_>>()
            .join(";");
        let path = self.group_path().join("schemata");
        fs::write(&path, format!("L3:{}\n", body))
            .map_err(|e| OsError::from_io(path.display().to_string(), e))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_mask_places_slice_at_low_bits() {
        assert_eq!(gen_mask(0, 4, 20), "f");
    }

    #[test]
    fn gen_mask_places_slice_at_high_bits() {
        // 20-bit mask, bits [16,20) set -> 0xf0000
        assert_eq!(gen_mask(16, 20, 20), "f0000");
    }

    #[test]
    fn gen_mask_empty_slice_is_zero() {
        assert_eq!(gen_mask(5, 5, 20), "0");
    }

    #[test]
    fn discover_reads_cbm_and_min_bits() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::create_dir_all(base.join("info/L3")).unwrap();
        fs::write(base.join("info/L3/cbm_mask"), "fffff\n").unwrap();
        fs::write(base.join("info/L3/min_cbm_bits"), "2\n").unwrap();

        let info = ResctrlInfo::discover_at(base).unwrap();
        assert_eq!(info.max_bits, 20);
        assert_eq!(info.min_bits, 2);
    }

    #[test]
    fn group_lifecycle_against_scratch_tree() {
        let dir = tempfile::tempdir().unwrap();
        let group = ResctrlGroup::new(dir.path().to_path_buf(), "wl_42".into());
        group.create().unwrap();
        group.add_task(42).unwrap();
        group
            .assign_llc(&[(0, "ffff0".into()), (1, "fffff".into())])
            .unwrap();
        let schemata =
            fs::read_to_string(dir.path().join("wl_42/schemata")).unwrap();
        assert_eq!(schemata, "L3:0=ffff0;1=fffff\n");
        group.remove().unwrap();
        assert!(!dir.path().join("wl_42").exists());
    }

    #[test]
    fn remove_missing_group_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let group = ResctrlGroup::new(dir.path().to_path_buf(), "never_created".into());
        assert!(group.remove().is_ok());
    }
}
