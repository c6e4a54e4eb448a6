//! Top-level scheduling: the `Controller` tick loop (reap/admit/isolate/
//! swap) and the polling-thread logic that turns broker events into
//! `Workload`s and metric-ring appends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::broker::{parse_creation, parse_metric_sample, BrokerEvent, MetricBroker};
use crate::config::Config;
use crate::error::{AppError, OsError};
use crate::isolator::IsolatorContext;
use crate::os::cpufreq::CpuFreqBounds;
use crate::os::cpuset::CpuSet;
use crate::os::resctrl::ResctrlInfo;
use crate::pending_queue::PendingQueue;
use crate::policy::{Policy, PolicyKind};
use crate::swapper::Swapper;
use crate::topology::NumaTopology;
use crate::workload::Workload;

/// Shared table of live workloads keyed by their per-workload broker
/// channel name (`"<name>(<pid>)"`), so an incoming metric payload can be
/// routed to the `Workload` the polling thread already created for it.
pub struct WorkloadRegistry {
    inner: Mutex<HashMap<String, Arc<Workload>>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        WorkloadRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, channel: String, workload: Arc<Workload>) {
        self.inner.lock().unwrap().insert(channel, workload);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<Workload>> {
        self.inner.lock().unwrap().get(channel).cloned()
    }
}

impl Default for WorkloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build, register, and stage a newly announced workload. Any failure to
/// read its pre-existing cpuset assignment (the placer is expected to have
/// created the workload's cgroup and bound it to cores before announcing
/// it) discards the message rather than crashing the polling thread.
fn handle_creation(
    msg: &str,
    topology: &NumaTopology,
    cpuset_mount: &Path,
    resctrl_mount: &Path,
    metric_buf_size: usize,
    pending: &PendingQueue,
    registry: &WorkloadRegistry,
) {
    let creation = match parse_creation(msg) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("discarding malformed creation message: {}", e);
            return;
        }
    };

    let Some((name, _)) = creation.identifier.split_once('_') else {
        log::debug!("discarding creation message with unparseable identifier {:?}", creation.identifier);
        return;
    };
    let group_name = format!("{}_{}", name, creation.pid);

    let probe = CpuSet::new(cpuset_mount.to_path_buf(), group_name.clone());
    let orig_cores = match probe.read_cpus() {
        Ok(cores) => cores,
        Err(e) => {
            log::warn!("discarding workload {}: could not read its cpuset cores: {}", group_name, e);
            return;
        }
    };
    let orig_mems = match probe.read_mems() {
        Ok(mems) => mems,
        Err(e) => {
            log::warn!("discarding workload {}: could not read its cpuset mems: {}", group_name, e);
            return;
        }
    };
    let socket = match topology.socket_of_cores(&orig_cores) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("discarding workload {}: could not place it on a socket: {}", group_name, e);
            return;
        }
    };

    let workload = Arc::new(Workload::new(
        creation.identifier.clone(),
        name.to_string(),
        creation.kind,
        creation.pid,
        creation.perf_pid,
        creation.interval_ms,
        socket,
        orig_cores,
        orig_mems,
        metric_buf_size,
        cpuset_mount.to_path_buf(),
        resctrl_mount.to_path_buf(),
    ));

    log::info!("{} ({:?}) admitted on socket {}", workload.group_name(), workload.kind, socket);

    let channel = format!("{}({})", name, creation.pid);
    registry.insert(channel, workload.clone());
    pending.add(workload);
}

fn handle_metric(channel: &str, payload: &str, registry: &WorkloadRegistry) {
    let Some(workload) = registry.get(channel) else {
        log::debug!("metric for unknown workload channel {:?}", channel);
        return;
    };
    match parse_metric_sample(payload, workload.perf_interval_ms) {
        Ok(sample) => workload.push_metric(sample),
        Err(e) => log::debug!("discarding malformed metric payload on {:?}: {}", channel, e),
    }
}

/// Drains broker events until the transport closes. Runs on its own thread;
/// its only suspension point is the broker's blocking receive.
pub fn polling_loop<B: MetricBroker>(
    broker: &B,
    pending: &PendingQueue,
    registry: &WorkloadRegistry,
    topology: &NumaTopology,
    cpuset_mount: &Path,
    resctrl_mount: &Path,
    metric_buf_size: usize,
) {
    while let Some(event) = broker.recv() {
        match event {
            BrokerEvent::Creation(msg) => {
                handle_creation(&msg, topology, cpuset_mount, resctrl_mount, metric_buf_size, pending, registry)
            }
            BrokerEvent::Metric { channel, payload } => handle_metric(&channel, &payload, registry),
        }
    }
    log::info!("broker transport closed, polling thread exiting");
}

/// Owns the active set of isolation groups and drives the reap/admit/
/// isolate/swap tick described in the design, plus the swapper.
pub struct Controller {
    topology: NumaTopology,
    resctrl_info: ResctrlInfo,
    cpufreq_bounds: CpuFreqBounds,
    config: Config,
    policy_kind: PolicyKind,
    violation_detection: bool,

    pending: Arc<PendingQueue>,
    active: Vec<Policy>,
    swapper: Swapper,
    tick_count: u64,
}

impl Controller {
    pub fn new(
        topology: NumaTopology,
        resctrl_info: ResctrlInfo,
        cpufreq_bounds: CpuFreqBounds,
        config: Config,
        policy_kind: PolicyKind,
        violation_detection: bool,
        pending: Arc<PendingQueue>,
    ) -> Self {
        Controller {
            topology,
            resctrl_info,
            cpufreq_bounds,
            config,
            policy_kind,
            violation_detection,
            pending,
            active: Vec::new(),
            swapper: Swapper::new(),
            tick_count: 0,
        }
    }

    fn ctx(&self) -> IsolatorContext<'_> {
        IsolatorContext {
            topology: &self.topology,
            resctrl_info: &self.resctrl_info,
            cpufreq_bounds: &self.cpufreq_bounds,
            config: &self.config,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Retire any group whose fg or every bg has exited: resume any
    /// still-paused bgs left over from an interrupted solorun, then restore
    /// OS state.
    fn reap(&mut self) -> Result<(), AppError> {
        let ctx = self.ctx();
        let mut i = 0;
        while i < self.active.len() {
            if !self.active[i].ended() {
                i += 1;
                continue;
            }
            let policy = self.active.remove(i);
            if policy.in_solorun() {
                for bg in &policy.bgs {
                    let _ = bg.resume();
                }
            }
            match policy.reset(&ctx) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drain every ready group out of the pending queue into the active set.
    fn admit(&mut self) {
        let ctx = self.ctx();
        while let Some(group) = self.pending.pop() {
            log::info!("admitting group fg={} on socket {}", group.fg.group_name(), group.socket);
            let policy = Policy::new(self.policy_kind, self.violation_detection, &ctx, group.fg, group.bgs);
            self.active.push(policy);
        }
    }

    /// Advance every active group by exactly one decision: profiling
    /// deadline check, periodic re-baselining check, or isolator
    /// strengthen/weaken/stop.
    fn isolate(&mut self) -> Result<(), AppError> {
        let ctx = self.ctx();
        let period = self.config.profile_check_period_ticks();
        let deadline_ticks = self.config.solorun_deadline_ticks();
        let tick_count = self.tick_count;

        for policy in &mut self.active {
            if policy.in_solorun() {
                if tick_count >= policy.solorun_deadline_tick() {
                    match policy.stop_solorun_profiling(&ctx) {
                        Ok(()) => {}
                        Err(AppError::Host(e)) if e.is_transient() => {}
                        Err(e) => return Err(e),
                    }
                }
                policy.advance_iteration();
                continue;
            }

            if policy.iteration() % period == 0 && policy.profile_needed(&ctx) {
                match policy.start_solorun_profiling(&ctx, tick_count + deadline_ticks) {
                    Ok(()) => {}
                    Err(AppError::Host(e)) if e.is_transient() => {}
                    Err(e) => return Err(e),
                }
                policy.advance_iteration();
                continue;
            }

            match policy.run_isolation_tick(&ctx) {
                Ok(()) => {}
                Err(AppError::Host(e)) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
            policy.advance_iteration();
        }
        Ok(())
    }

    fn maybe_swap(&mut self) -> Result<(), AppError> {
        if self.config.swap_off {
            return Ok(());
        }
        let safe_count = self.active.iter().filter(|p| p.safe_to_swap()).count();
        if safe_count < 2 {
            return Ok(());
        }
        self.swapper
            .maybe_swap(&mut self.active, &self.config, &self.topology)
    }

    /// One reap/admit/isolate/swap pass with no sleep — the unit of work
    /// `run`'s loop repeats every `scheduling_interval`.
    pub fn run_once(&mut self) -> Result<(), AppError> {
        self.reap()?;
        self.admit();
        self.isolate()?;
        self.maybe_swap()?;
        self.tick_count += 1;
        Ok(())
    }

    /// Runs ticks until `shutdown` is set, sleeping `scheduling_interval`
    /// between reap/admit and isolate/swap, then best-effort resets every
    /// surviving group's OS state before returning.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), AppError> {
        while !shutdown.load(Ordering::Relaxed) {
            self.reap()?;
            self.admit();
            thread::sleep(self.config.scheduling_interval());
            self.isolate()?;
            self.maybe_swap()?;
            self.tick_count += 1;
        }
        let ctx = self.ctx();
        for policy in &self.active {
            let _ = policy.reset(&ctx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadKind;
    use std::collections::BTreeSet;
    use std::fs;

    fn scratch_topology(dir: &Path) -> NumaTopology {
        fs::write(dir.join("online"), "0\n").unwrap();
        fs::write(dir.join("has_memory"), "0\n").unwrap();
        fs::create_dir_all(dir.join("node0")).unwrap();
        fs::write(dir.join("node0/cpulist"), "0-7\n").unwrap();
        NumaTopology::discover_at(dir).unwrap()
    }

    fn make_controller(dir: &Path) -> Controller {
        let topo = scratch_topology(&dir.join("numa"));
        let resctrl_info = ResctrlInfo { max_bits: 20, min_bits: 2 };
        let bounds = CpuFreqBounds { min_khz: 800_000, max_khz: 3_000_000 };
        Controller::new(
            topo,
            resctrl_info,
            bounds,
            Config::default(),
            PolicyKind::Conservative,
            false,
            Arc::new(PendingQueue::new()),
        )
    }

    fn stage_group(dir: &Path, pending: &PendingQueue) {
        let fg = Arc::new(Workload::new(
            "sysbench_1".into(),
            "sysbench".into(),
            WorkloadKind::Foreground,
            1,
            1001,
            1000,
            0,
            [0u32, 1, 2, 3].into_iter().collect(),
            BTreeSet::new(),
            10,
            dir.join("cpuset"),
            dir.join("resctrl"),
        ));
        let bg = Arc::new(Workload::new(
            "batch_2".into(),
            "batch".into(),
            WorkloadKind::Background,
            2,
            1002,
            1000,
            0,
            [4u32, 5, 6, 7].into_iter().collect(),
            BTreeSet::new(),
            10,
            dir.join("cpuset"),
            dir.join("resctrl"),
        ));
        fg.push_metric(Default::default());
        bg.push_metric(Default::default());
        pending.add(fg);
        pending.add(bg);
    }

    #[test]
    fn admit_moves_ready_groups_into_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = make_controller(dir.path());
        stage_group(dir.path(), &controller.pending);
        controller.admit();
        assert_eq!(controller.active_count(), 1);
    }

    #[test]
    fn run_once_is_a_no_op_with_nothing_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = make_controller(dir.path());
        controller.run_once().unwrap();
        assert_eq!(controller.active_count(), 0);
        assert_eq!(controller.tick_count, 1);
    }

    #[test]
    fn handle_creation_discards_message_with_missing_cpuset() {
        let dir = tempfile::tempdir().unwrap();
        let topo = scratch_topology(&dir.path().join("numa"));
        let pending = PendingQueue::new();
        let registry = WorkloadRegistry::new();
        handle_creation(
            "sysbench_1,fg,1,1001,1000",
            &topo,
            &dir.path().join("cpuset"),
            &dir.path().join("resctrl"),
            10,
            &pending,
            &registry,
        );
        assert_eq!(pending.ready_len(), 0);
        assert!(registry.get("sysbench(1)").is_none());
    }

    #[test]
    fn handle_creation_admits_workload_with_valid_cpuset() {
        let dir = tempfile::tempdir().unwrap();
        let topo = scratch_topology(&dir.path().join("numa"));
        let cpuset_mount = dir.path().join("cpuset");
        let cs = CpuSet::new(cpuset_mount.clone(), "sysbench_1".into());
        cs.create().unwrap();
        cs.assign_cpus(&[0u32, 1].into_iter().collect()).unwrap();
        cs.assign_mems(&[0u32].into_iter().collect()).unwrap();

        let pending = PendingQueue::new();
        let registry = WorkloadRegistry::new();
        handle_creation(
            "sysbench_1,fg,1,1001,1000",
            &topo,
            &cpuset_mount,
            &dir.path().join("resctrl"),
            10,
            &pending,
            &registry,
        );
        assert!(registry.get("sysbench(1)").is_some());
    }

    #[test]
    fn handle_metric_routes_by_channel_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkloadRegistry::new();
        let wl = Arc::new(Workload::new(
            "sysbench_1".into(),
            "sysbench".into(),
            WorkloadKind::Foreground,
            1,
            1001,
            1000,
            0,
            BTreeSet::new(),
            BTreeSet::new(),
            10,
            dir.path().join("cpuset"),
            dir.path().join("resctrl"),
        ));
        registry.insert("sysbench(1)".into(), wl.clone());
        let json = r#"{"l2miss":1,"l3miss":1,"instructions":1,"cycles":1,"stall_cycles":1,"wall_cycles":1,"intra_coh":1,"inter_coh":1,"llc_size":1,"local_mem":1,"remote_mem":1}"#;
        handle_metric("sysbench(1)", json, &registry);
        assert!(wl.has_metrics());
    }
}
