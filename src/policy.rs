//! A group's isolation policy: owns the isolator set for one (fg, bgs) pair
//! on a socket, fingerprints contention, and drives the three-state
//! enforce/measure/adjust search. The solorun profiler is embedded here
//! rather than split into its own owning type, matching the reference
//! implementation's `IsolationPolicy` carrying its own profiling state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{AppError, GroupError, OsError};
use crate::isolator::{Isolator, IsolatorContext, IsolatorKind, IsolatorOps, NextStep, ResourceType};
use crate::workload::Workload;

/// Selection strategy for which isolator runs next, given a contention
/// fingerprint. `Conservative` round-robins across isolator kinds within a
/// cycle; `Aggressive` always takes the fingerprinted kind and additionally
/// prefers `CoreAffinity` whenever the foreground is thread-starved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Conservative,
    Aggressive,
}

/// Relative-magnitude sanity bound on a `MetricDiff` axis: beyond this the
/// verified diff is treated as nonsensical (a counter wrapped, a process
/// briefly vanished mid-sample) rather than a real measurement, feeding
/// `profile_needed`'s re-baselining check.
const DIFF_SANITY_BOUND: f64 = 10.0;

/// One isolation group: a foreground, its backgrounds (same socket), the
/// isolator set the group owns, and the solorun/violation-tracking state
/// the policy layer needs between ticks.
pub struct Policy {
    pub socket: u32,
    pub kind: PolicyKind,
    pub violation_detection: bool,
    pub fg: Arc<Workload>,
    pub bgs: Vec<Arc<Workload>>,

    isolators: BTreeMap<IsolatorKind, Isolator>,
    cur_isolator: Option<IsolatorKind>,
    used: BTreeSet<IsolatorKind>,

    violation_count: u32,
    verify_fail_count: u32,
    cached_fg_threads: u32,

    iteration: u64,
    in_solorun: bool,
    solorun_deadline_tick: u64,
}

impl Policy {
    pub fn new(
        kind: PolicyKind,
        violation_detection: bool,
        ctx: &IsolatorContext,
        fg: Arc<Workload>,
        bgs: Vec<Arc<Workload>>,
    ) -> Self {
        let representative_bg = bgs.first().expect("a policy always has at least one background");
        let mut isolators = BTreeMap::new();
        for isolator_kind in IsolatorKind::ALL {
            isolators.insert(isolator_kind, Isolator::new(isolator_kind, ctx, &fg, representative_bg));
        }
        let cached_fg_threads = fg.number_of_threads();
        Policy {
            socket: fg.socket(),
            kind,
            violation_detection,
            fg,
            bgs,
            isolators,
            cur_isolator: None,
            used: BTreeSet::new(),
            violation_count: 0,
            verify_fail_count: 0,
            cached_fg_threads,
            iteration: 0,
            in_solorun: false,
            solorun_deadline_tick: 0,
        }
    }

    /// A group has ended once its foreground exits or every background has.
    pub fn ended(&self) -> bool {
        !self.fg.is_running() || self.bgs.iter().all(|bg| !bg.is_running())
    }

    pub fn in_solorun(&self) -> bool {
        self.in_solorun
    }

    pub fn solorun_deadline_tick(&self) -> u64 {
        self.solorun_deadline_tick
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn advance_iteration(&mut self) {
        self.iteration += 1;
    }

    /// A group is safe for the swapper to consider only once it is not
    /// mid-profile and has at least one live foreground sample.
    pub fn safe_to_swap(&self) -> bool {
        !self.in_solorun && self.fg.has_metrics()
    }

    pub fn cur_isolator_kind(&self) -> Option<IsolatorKind> {
        self.cur_isolator
    }

    /// Which resource axis is currently bottlenecking the foreground.
    /// Ground: `base_policy.py::contentious_resource` — the CPU-bound
    /// short-circuit (both cache and memory intensity below threshold)
    /// fires before the signed LLC/MEMBW comparison.
    pub fn contentious_resource(&self, ctx: &IsolatorContext) -> ResourceType {
        if let Some(cur) = self.fg.latest_metric() {
            if cur.l3_intensity().abs() < ctx.config.cpu_threshold
                && cur.mem_intensity().abs() < ctx.config.cpu_threshold
            {
                return ResourceType::Cpu;
            }
        }

        let diff = self.fg.calc_metric_diff().unwrap_or_default();
        if diff.local_mem_rate > 0.0 && diff.l3_hit_ratio > 0.0 {
            if diff.l3_hit_ratio > diff.local_mem_rate {
                ResourceType::Llc
            } else {
                ResourceType::MemBw
            }
        } else if diff.local_mem_rate < 0.0 && diff.l3_hit_ratio > 0.0 {
            ResourceType::MemBw
        } else if diff.l3_hit_ratio < 0.0 && diff.local_mem_rate > 0.0 {
            ResourceType::Llc
        } else if diff.l3_hit_ratio > diff.local_mem_rate {
            ResourceType::MemBw
        } else {
            ResourceType::Llc
        }
    }

    /// `true` when the policy should call `choose_next_isolator` this tick:
    /// unconditionally while idle, or (with the violation-detection wrapper
    /// enabled) once the running isolator's resource no longer matches the
    /// live fingerprint for `VIOLATION_THRESHOLD` consecutive checks.
    pub fn new_isolator_needed(&mut self, ctx: &IsolatorContext) -> bool {
        let Some(running) = self.cur_isolator else {
            return true;
        };
        if !self.violation_detection {
            return false;
        }
        let resource = self.contentious_resource(ctx);
        if IsolatorKind::for_resource(resource) == running {
            self.violation_count = 0;
            return false;
        }
        self.violation_count += 1;
        if self.violation_count >= ctx.config.violation_threshold {
            self.violation_count = 0;
            true
        } else {
            false
        }
    }

    pub fn choose_next_isolator(&mut self, ctx: &IsolatorContext) {
        match self.kind {
            PolicyKind::Conservative => self.choose_conservative(ctx),
            PolicyKind::Aggressive => self.choose_aggressive(ctx),
        }
    }

    /// Round-robin across isolator kinds: pick the fingerprinted kind only
    /// if it has not run yet this cycle. Once every kind has run, clear the
    /// flags and let the next call restart the cycle.
    /// Ground: `diff_policy.py::choose_next_isolator`, generalized per
    /// spec from its fixed cache/memory/core priority chain to the
    /// fingerprint-driven selection spec.md names.
    fn choose_conservative(&mut self, ctx: &IsolatorContext) {
        if self.used.len() >= IsolatorKind::ALL.len() {
            self.used.clear();
        }
        let kind = IsolatorKind::for_resource(self.contentious_resource(ctx));
        if !self.used.contains(&kind) {
            self.used.insert(kind);
            self.set_cur_isolator(kind);
        }
    }

    /// Always pick the fingerprinted kind; prefer `CoreAffinity` outright
    /// when the foreground has more runnable threads than bound cores and
    /// affinity has room left to grow.
    /// Ground: `greedy_diff_policy.py::choose_next_isolator`'s
    /// thread-starvation short-circuit.
    fn choose_aggressive(&mut self, ctx: &IsolatorContext) {
        let bound_cores = self.fg.bound_cores().map(|c| c.len()).unwrap_or_else(|_| self.fg.orig_bound_cores().len());
        if self.fg.number_of_threads() as usize > bound_cores {
            let affinity_maxed = self
                .isolators
                .get(&IsolatorKind::Affinity)
                .map(|iso| iso.is_max_level(ctx, &self.fg, &self.bgs))
                .unwrap_or(true);
            if !affinity_maxed {
                self.set_cur_isolator(IsolatorKind::Affinity);
                return;
            }
        }
        let kind = IsolatorKind::for_resource(self.contentious_resource(ctx));
        self.set_cur_isolator(kind);
    }

    fn set_cur_isolator(&mut self, kind: IsolatorKind) {
        if let Some(old) = self.cur_isolator {
            if old != kind {
                if let Some(iso) = self.isolators.get_mut(&old) {
                    iso.yield_isolation();
                }
            }
        }
        self.cur_isolator = Some(kind);
    }

    /// Yield the running isolator and fall back to Idle.
    pub fn set_idle_isolator(&mut self) {
        if let Some(kind) = self.cur_isolator.take() {
            if let Some(iso) = self.isolators.get_mut(&kind) {
                iso.yield_isolation();
            }
        }
    }

    /// Restore every isolator's OS state. Called when a group is retired or
    /// the controller is shutting down.
    pub fn reset(&self, ctx: &IsolatorContext) -> Result<(), OsError> {
        for iso in self.isolators.values() {
            iso.reset(ctx, &self.fg, &self.bgs)?;
        }
        Ok(())
    }

    /// Run one tick of the enforce/measure/adjust search: select an
    /// isolator if needed, ask it for the next step, and apply that step.
    pub fn run_isolation_tick(&mut self, ctx: &IsolatorContext) -> Result<(), AppError> {
        if self.new_isolator_needed(ctx) {
            self.choose_next_isolator(ctx);
        }
        let Some(kind) = self.cur_isolator else {
            return Ok(());
        };
        let resource = self.contentious_resource(ctx);
        let step = {
            let iso = self.isolators.get_mut(&kind).expect("isolator map covers every kind");
            iso.set_contentious_resource(resource);
            iso.decide_next_step(ctx, &self.fg, &self.bgs)
        };
        match step {
            NextStep::Strengthen => {
                let iso = self.isolators.get_mut(&kind).unwrap();
                iso.strengthen(ctx);
                iso.enforce(ctx, &self.fg, &self.bgs)?;
            }
            NextStep::Weaken => {
                let iso = self.isolators.get_mut(&kind).unwrap();
                iso.weaken(ctx);
                iso.enforce(ctx, &self.fg, &self.bgs)?;
            }
            NextStep::Stop => self.set_idle_isolator(),
            NextStep::Idle => {}
        }
        Ok(())
    }

    /// `true` when the foreground needs a fresh solorun baseline: no
    /// baseline cached yet, its thread count changed since the last
    /// baseline, or the live diff has failed sanity for
    /// `verify_threshold` consecutive checks.
    pub fn profile_needed(&mut self, ctx: &IsolatorContext) -> bool {
        if self.fg.solorun_avg().is_none() {
            return true;
        }

        let cur_threads = self.fg.number_of_threads();
        if cur_threads != 0 && cur_threads != self.cached_fg_threads {
            self.cached_fg_threads = cur_threads;
            return true;
        }

        let sane = match self.fg.calc_metric_diff() {
            Some(diff) => {
                diff.is_finite()
                    && diff.l3_hit_ratio.abs() <= DIFF_SANITY_BOUND
                    && diff.local_mem_rate.abs() <= DIFF_SANITY_BOUND
                    && diff.remote_mem_rate.abs() <= DIFF_SANITY_BOUND
                    && diff.instructions_rate.abs() <= DIFF_SANITY_BOUND
            }
            None => true,
        };

        if sane {
            self.verify_fail_count = 0;
            false
        } else {
            self.verify_fail_count += 1;
            if self.verify_fail_count >= ctx.config.verify_threshold {
                self.verify_fail_count = 0;
                true
            } else {
                false
            }
        }
    }

    /// Begin a solorun window: pause every background, clear the
    /// foreground's metric ring, snapshot and reset every isolator's OS
    /// state, and mark the group as profiling through `deadline_tick`.
    /// Ground: `base.py::start_solorun_profiling`, minus its redundant
    /// foreground pause/resume (the foreground keeps running throughout —
    /// only the backgrounds are suspended — so there is nothing to undo).
    pub fn start_solorun_profiling(&mut self, ctx: &IsolatorContext, deadline_tick: u64) -> Result<(), AppError> {
        if self.in_solorun {
            return Err(GroupError::AlreadyProfiling.into());
        }
        self.in_solorun = true;
        for bg in &self.bgs {
            match bg.pause() {
                Ok(()) | Err(_) => {}
            }
        }
        self.fg.clear_metrics();
        for iso in self.isolators.values_mut() {
            iso.store_cur_config();
            match iso.reset(ctx, &self.fg, &self.bgs) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.solorun_deadline_tick = deadline_tick;
        Ok(())
    }

    /// End a solorun window: average the collected foreground samples into
    /// the new baseline, restore every isolator's prior regime, and resume
    /// the backgrounds.
    pub fn stop_solorun_profiling(&mut self, ctx: &IsolatorContext) -> Result<(), AppError> {
        if !self.in_solorun {
            return Err(GroupError::NotProfiling.into());
        }
        let mean = self.fg.metrics_mean().ok_or(GroupError::NoSamplesForProfile)?;
        self.fg.set_solorun_avg(Some(mean));
        self.fg.clear_metrics();

        for iso in self.isolators.values_mut() {
            iso.load_cur_config();
            match iso.enforce(ctx, &self.fg, &self.bgs) {
                Ok(()) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e.into()),
            }
        }
        for bg in &self.bgs {
            let _ = bg.resume();
        }
        self.in_solorun = false;
        Ok(())
    }
}
