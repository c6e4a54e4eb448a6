//! A single monitored process: identity, socket placement, core/memory
//! binding, OS-handle wrappers, and the metric history behind it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::OsError;
use crate::metrics::{MetricDiff, MetricSample, MetricStore};
use crate::os::{cpuset::CpuSet, process, resctrl::ResctrlGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Foreground,
    Background,
}

/// Mutable knob state: everything that changes as the controller swaps
/// workloads or extends/shrinks their core ranges. Guarded by its own
/// mutex so `Workload` can be shared (`Arc`) between a Policy and the
/// registry the controller keeps, while remaining touched only by the
/// controller thread in practice.
#[derive(Debug, Clone)]
struct WorkloadState {
    orig_bound_cores: BTreeSet<u32>,
    orig_bound_mems: BTreeSet<u32>,
    solorun_avg: Option<MetricSample>,
    cached_thread_count: u32,
}

pub struct Workload {
    pub identifier: String,
    pub name: String,
    pub kind: WorkloadKind,
    pub pid: i32,
    pub perf_pid: i32,
    pub perf_interval_ms: u64,
    socket: AtomicU32,

    state: Mutex<WorkloadState>,
    metrics: Mutex<MetricStore>,

    cpuset: CpuSet,
    resctrl: ResctrlGroup,
}

impl Workload {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: String,
        name: String,
        kind: WorkloadKind,
        pid: i32,
        perf_pid: i32,
        perf_interval_ms: u64,
        socket: u32,
        orig_bound_cores: BTreeSet<u32>,
        orig_bound_mems: BTreeSet<u32>,
        metric_buf_size: usize,
        cpuset_mount: PathBuf,
        resctrl_mount: PathBuf,
    ) -> Self {
        let group_name = format!("{}_{}", name, pid);
        Workload {
            identifier,
            name,
            kind,
            pid,
            perf_pid,
            perf_interval_ms,
            socket: AtomicU32::new(socket),
            state: Mutex::new(WorkloadState {
                orig_bound_cores,
                orig_bound_mems,
                solorun_avg: None,
                cached_thread_count: process::thread_count(pid),
            }),
            metrics: Mutex::new(MetricStore::new(metric_buf_size)),
            cpuset: CpuSet::new(cpuset_mount, group_name.clone()),
            resctrl: ResctrlGroup::new(resctrl_mount, group_name),
        }
    }

    pub fn socket(&self) -> u32 {
        self.socket.load(Ordering::SeqCst)
    }

    /// Repoints this workload at a new socket. Only the swapper calls this,
    /// after exchanging a background's `orig_bound_cores` across a group
    /// boundary — the isolators key LLC/cpuset placement off this field.
    pub fn set_socket(&self, socket: u32) {
        self.socket.store(socket, Ordering::SeqCst);
    }

    pub fn group_name(&self) -> String {
        format!("{}_{}", self.name, self.pid)
    }

    pub fn cpuset(&self) -> &CpuSet {
        &self.cpuset
    }

    pub fn resctrl(&self) -> &ResctrlGroup {
        &self.resctrl
    }

    pub fn is_running(&self) -> bool {
        process::is_running(self.pid)
    }

    pub fn number_of_threads(&self) -> u32 {
        process::thread_count(self.pid)
    }

    /// Signal both the workload's own process and its perf agent.
    pub fn pause(&self) -> Result<(), OsError> {
        process::stop(self.pid)?;
        process::stop(self.perf_pid)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), OsError> {
        process::cont(self.pid)?;
        process::cont(self.perf_pid)?;
        Ok(())
    }

    pub fn push_metric(&self, sample: MetricSample) {
        self.metrics.lock().unwrap().push(sample);
    }

    pub fn has_metrics(&self) -> bool {
        !self.metrics.lock().unwrap().is_empty()
    }

    pub fn latest_metric(&self) -> Option<MetricSample> {
        self.metrics.lock().unwrap().latest().copied()
    }

    pub fn clear_metrics(&self) {
        self.metrics.lock().unwrap().clear();
    }

    pub fn metrics_mean(&self) -> Option<MetricSample> {
        self.metrics.lock().unwrap().mean()
    }

    pub fn solorun_avg(&self) -> Option<MetricSample> {
        self.state.lock().unwrap().solorun_avg
    }

    pub fn set_solorun_avg(&self, sample: Option<MetricSample>) {
        self.state.lock().unwrap().solorun_avg = sample;
    }

    /// `None` until a solorun baseline has been captured for this
    /// workload; `Some` diff against the latest live sample once it has.
    pub fn calc_metric_diff(&self) -> Option<MetricDiff> {
        let solo = self.solorun_avg()?;
        let curr = self.latest_metric()?;
        Some(MetricDiff::compute(&curr, &solo))
    }

    pub fn orig_bound_cores(&self) -> BTreeSet<u32> {
        self.state.lock().unwrap().orig_bound_cores.clone()
    }

    pub fn set_orig_bound_cores(&self, cores: BTreeSet<u32>) {
        self.state.lock().unwrap().orig_bound_cores = cores;
    }

    pub fn orig_bound_mems(&self) -> BTreeSet<u32> {
        self.state.lock().unwrap().orig_bound_mems.clone()
    }

    pub fn set_orig_bound_mems(&self, mems: BTreeSet<u32>) {
        self.state.lock().unwrap().orig_bound_mems = mems;
    }

    pub fn bound_cores(&self) -> Result<BTreeSet<u32>, OsError> {
        self.cpuset.read_cpus()
    }

    pub fn set_bound_cores(&self, cores: &BTreeSet<u32>) -> Result<(), OsError> {
        self.cpuset.assign_cpus(cores)
    }

    pub fn set_bound_mems(&self, nodes: &BTreeSet<u32>) -> Result<(), OsError> {
        self.cpuset.assign_mems(nodes)
    }

    pub fn cached_thread_count(&self) -> u32 {
        self.state.lock().unwrap().cached_thread_count
    }

    pub fn refresh_cached_thread_count(&self) {
        let count = self.number_of_threads();
        self.state.lock().unwrap().cached_thread_count = count;
    }
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pid: {})", self.name, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_workload(dir: &std::path::Path, name: &str, pid: i32) -> Workload {
        Workload::new(
            format!("{}_a", name),
            name.to_string(),
            WorkloadKind::Background,
            pid,
            pid + 1000,
            1000,
            0,
            BTreeSet::new(),
            BTreeSet::new(),
            10,
            dir.join("cpuset"),
            dir.join("resctrl"),
        )
    }

    #[test]
    fn group_name_combines_name_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let wl = make_workload(dir.path(), "sysbench", 777);
        assert_eq!(wl.group_name(), "sysbench_777");
    }

    #[test]
    fn metric_diff_is_none_without_solorun_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let wl = make_workload(dir.path(), "sysbench", 777);
        wl.push_metric(MetricSample::default());
        assert!(wl.calc_metric_diff().is_none());
    }

    #[test]
    fn metric_diff_present_once_baseline_and_sample_exist() {
        let dir = tempfile::tempdir().unwrap();
        let wl = make_workload(dir.path(), "sysbench", 777);
        wl.set_solorun_avg(Some(MetricSample {
            instructions: 100,
            cycles: 100,
            interval_ms: 1000,
            ..Default::default()
        }));
        wl.push_metric(MetricSample {
            instructions: 50,
            cycles: 100,
            interval_ms: 1000,
            ..Default::default()
        });
        assert!(wl.calc_metric_diff().is_some());
    }

    #[test]
    fn pausing_dead_pid_is_transient_process_gone() {
        let dir = tempfile::tempdir().unwrap();
        let wl = make_workload(dir.path(), "sysbench", i32::MAX - 5);
        let err = wl.pause().unwrap_err();
        assert!(err.is_transient());
    }
}
