//! The isolator family: bounded-step knobs that trade LLC ways, memory
//! bandwidth, or CPU cores between a foreground and its backgrounds.
//!
//! Rather than a class hierarchy, each concrete isolator is a struct and
//! [`Isolator`] is a tagged variant over them — the set of isolator kinds
//! is closed and known at compile time, so there is no need for dynamic
//! dispatch here.

mod affinity;
mod corecount;
mod llc;
mod membw;

pub use affinity::AffinityIsolator;
pub use corecount::CoreCountIsolator;
pub use llc::LlcIsolator;
pub use membw::MemBwIsolator;

use std::sync::Arc;

use crate::config::Config;
use crate::error::OsError;
use crate::os::cpufreq::CpuFreqBounds;
use crate::os::resctrl::ResctrlInfo;
use crate::topology::NumaTopology;
use crate::workload::Workload;

/// Outcome of a single `decide_next_step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Strengthen,
    Weaken,
    Stop,
    Idle,
}

/// Which axis of contention an isolator (or the policy layer) is reacting
/// to. `CoreCount` reads whichever of these the policy currently flags as
/// contentious.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Cpu,
    Llc,
    MemBw,
}

/// The closed set of isolator variants a `Policy` can run. `Idle` is not a
/// map entry — it is the "no isolator selected" sentinel in `Policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IsolatorKind {
    Llc,
    MemBw,
    Affinity,
    CoreCount,
}

impl IsolatorKind {
    pub const ALL: [IsolatorKind; 4] = [
        IsolatorKind::Llc,
        IsolatorKind::MemBw,
        IsolatorKind::Affinity,
        IsolatorKind::CoreCount,
    ];

    pub fn for_resource(resource: ResourceType) -> IsolatorKind {
        match resource {
            ResourceType::Llc => IsolatorKind::Llc,
            ResourceType::MemBw => IsolatorKind::MemBw,
            ResourceType::Cpu => IsolatorKind::CoreCount,
        }
    }
}

/// Immutable, shared inputs every isolator needs but none of them own:
/// socket layout, resctrl bitmask parameters, cpufreq bounds, and the
/// tunable thresholds.
pub struct IsolatorContext<'a> {
    pub topology: &'a NumaTopology,
    pub resctrl_info: &'a ResctrlInfo,
    pub cpufreq_bounds: &'a CpuFreqBounds,
    pub config: &'a Config,
}

/// Common contract every concrete isolator implements. `bgs` is the full
/// background set of the owning group — most isolators act on just the
/// first one, `enforce`/`reset` sweep all of them and skip any that have
/// already exited.
pub trait IsolatorOps {
    fn strengthen(&mut self, ctx: &IsolatorContext);
    fn weaken(&mut self, ctx: &IsolatorContext);
    fn is_max_level(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> bool;
    fn is_min_level(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> bool;
    fn enforce(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> Result<(), OsError>;
    fn reset(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> Result<(), OsError>;
    fn store_cur_config(&mut self);
    fn load_cur_config(&mut self);
    fn decide_next_step(
        &mut self,
        ctx: &IsolatorContext,
        fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> NextStep;
    /// Clears the first-decision flag so the next selection starts fresh.
    fn yield_isolation(&mut self);
    /// Tells the isolator which axis is currently fingerprinted as
    /// contentious. Every isolator but `CoreCount` reads a fixed metric
    /// component and ignores this; `CoreCount` is resource-typed and uses
    /// it to pick between `Δinstructions-rate` and `Δlocal-mem-rate`.
    fn set_contentious_resource(&mut self, _resource: ResourceType) {}
}

/// Shared two-mode decision rule every diff-driven isolator (all but
/// `CoreCount`, which has its own dual-sided variant) uses.
pub(crate) fn decide_from_diff(
    first_decision: &mut bool,
    prev_diff: &mut Option<f64>,
    cur_diff: f64,
    is_max: bool,
    is_min: bool,
    force_threshold: f64,
    dod_threshold: f64,
) -> NextStep {
    let step = if *first_decision {
        *first_decision = false;
        if cur_diff < 0.0 {
            if is_max {
                NextStep::Stop
            } else {
                NextStep::Strengthen
            }
        } else if cur_diff <= force_threshold {
            NextStep::Stop
        } else if is_min {
            NextStep::Stop
        } else {
            NextStep::Weaken
        }
    } else {
        let prev = prev_diff.unwrap_or(cur_diff);
        let dod = cur_diff - prev;
        if dod.abs() <= dod_threshold || cur_diff.abs() <= dod_threshold {
            NextStep::Stop
        } else if cur_diff > 0.0 {
            if is_min {
                NextStep::Stop
            } else {
                NextStep::Weaken
            }
        } else if is_max {
            NextStep::Stop
        } else {
            NextStep::Strengthen
        }
    };
    *prev_diff = Some(cur_diff);
    step
}

/// Skip dead background workloads rather than failing the whole call —
/// the common "benign mid-write exit" failure semantics every isolator's
/// `enforce`/`reset` shares.
pub(crate) fn for_each_live_bg<'a>(
    bgs: &'a [Arc<Workload>],
    mut f: impl FnMut(&'a Workload) -> Result<(), OsError>,
) -> Result<(), OsError> {
    for bg in bgs {
        if !bg.is_running() {
            continue;
        }
        match f(bg) {
            Ok(()) => {}
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Tagged variant over the four concrete isolators, dispatching
/// [`IsolatorOps`] to whichever is active.
#[derive(Debug)]
pub enum Isolator {
    Llc(LlcIsolator),
    MemBw(MemBwIsolator),
    Affinity(AffinityIsolator),
    CoreCount(CoreCountIsolator),
}

impl Isolator {
    pub fn new(kind: IsolatorKind, ctx: &IsolatorContext, fg: &Workload, bg: &Workload) -> Isolator {
        match kind {
            IsolatorKind::Llc => Isolator::Llc(LlcIsolator::new(fg)),
            IsolatorKind::MemBw => Isolator::MemBw(MemBwIsolator::new(ctx)),
            IsolatorKind::Affinity => Isolator::Affinity(AffinityIsolator::new(fg)),
            IsolatorKind::CoreCount => Isolator::CoreCount(CoreCountIsolator::new(fg, bg)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            Isolator::Llc(i) => i.$method($($arg),*),
            Isolator::MemBw(i) => i.$method($($arg),*),
            Isolator::Affinity(i) => i.$method($($arg),*),
            Isolator::CoreCount(i) => i.$method($($arg),*),
        }
    };
}

impl IsolatorOps for Isolator {
    fn strengthen(&mut self, ctx: &IsolatorContext) {
        dispatch!(self, strengthen, ctx)
    }

    fn weaken(&mut self, ctx: &IsolatorContext) {
        dispatch!(self, weaken, ctx)
    }

    fn is_max_level(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> bool {
        dispatch!(self, is_max_level, ctx, fg, bgs)
    }

    fn is_min_level(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> bool {
        dispatch!(self, is_min_level, ctx, fg, bgs)
    }

    fn enforce(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> Result<(), OsError> {
        dispatch!(self, enforce, ctx, fg, bgs)
    }

    fn reset(&self, ctx: &IsolatorContext, fg: &Workload, bgs: &[Arc<Workload>]) -> Result<(), OsError> {
        dispatch!(self, reset, ctx, fg, bgs)
    }

    fn store_cur_config(&mut self) {
        dispatch!(self, store_cur_config)
    }

    fn load_cur_config(&mut self) {
        dispatch!(self, load_cur_config)
    }

    fn decide_next_step(
        &mut self,
        ctx: &IsolatorContext,
        fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> NextStep {
        dispatch!(self, decide_next_step, ctx, fg, bgs)
    }

    fn yield_isolation(&mut self) {
        dispatch!(self, yield_isolation)
    }

    fn set_contentious_resource(&mut self, resource: ResourceType) {
        dispatch!(self, set_contentious_resource, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_decision_below_zero_strengthens() {
        let mut first = true;
        let mut prev = None;
        let step = decide_from_diff(&mut first, &mut prev, -0.2, false, false, 0.05, 0.005);
        assert_eq!(step, NextStep::Strengthen);
        assert!(!first);
    }

    #[test]
    fn first_decision_within_force_threshold_stops() {
        let mut first = true;
        let mut prev = None;
        let step = decide_from_diff(&mut first, &mut prev, 0.03, false, false, 0.05, 0.005);
        assert_eq!(step, NextStep::Stop);
    }

    #[test]
    fn first_decision_above_threshold_weakens_unless_min() {
        let mut first = true;
        let mut prev = None;
        let step = decide_from_diff(&mut first, &mut prev, 0.2, false, false, 0.05, 0.005);
        assert_eq!(step, NextStep::Weaken);

        let mut first = true;
        let mut prev = None;
        let step = decide_from_diff(&mut first, &mut prev, 0.2, false, true, 0.05, 0.005);
        assert_eq!(step, NextStep::Stop);
    }

    #[test]
    fn monitoring_mode_stops_on_small_diff_of_diff() {
        let mut first = false;
        let mut prev = Some(0.2);
        let step = decide_from_diff(&mut first, &mut prev, 0.201, false, false, 0.05, 0.005);
        assert_eq!(step, NextStep::Stop);
    }

    #[test]
    fn monitoring_mode_weakens_on_positive_diff() {
        let mut first = false;
        let mut prev = Some(0.1);
        let step = decide_from_diff(&mut first, &mut prev, 0.3, false, false, 0.05, 0.005);
        assert_eq!(step, NextStep::Weaken);
    }

    #[test]
    fn monitoring_mode_strengthens_on_negative_diff() {
        let mut first = false;
        let mut prev = Some(-0.1);
        let step = decide_from_diff(&mut first, &mut prev, -0.3, false, false, 0.05, 0.005);
        assert_eq!(step, NextStep::Strengthen);
    }
}
