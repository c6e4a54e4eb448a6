//! Memory-bandwidth throttling via DVFS: caps `scaling_max_freq` on a
//! background's cores. Contended metric is `Δlocal-mem-rate`;
//! strengthening lowers the background's ceiling.

use std::sync::Arc;

use crate::error::OsError;
use crate::os::cpufreq;
use crate::workload::Workload;

use super::{decide_from_diff, for_each_live_bg, IsolatorContext, IsolatorOps, NextStep};

#[derive(Debug)]
pub struct MemBwIsolator {
    cur_step_khz: u64,
    stored_step_khz: Option<u64>,
    first_decision: bool,
    prev_diff: Option<f64>,
}

impl MemBwIsolator {
    pub fn new(ctx: &IsolatorContext) -> Self {
        MemBwIsolator {
            cur_step_khz: ctx.cpufreq_bounds.max_khz,
            stored_step_khz: None,
            first_decision: true,
            prev_diff: None,
        }
    }
}

impl IsolatorOps for MemBwIsolator {
    fn strengthen(&mut self, ctx: &IsolatorContext) {
        self.cur_step_khz = self
            .cur_step_khz
            .saturating_sub(ctx.config.cpufreq_step_khz)
            .max(ctx.cpufreq_bounds.min_khz);
    }

    fn weaken(&mut self, ctx: &IsolatorContext) {
        self.cur_step_khz =
            (self.cur_step_khz + ctx.config.cpufreq_step_khz).min(ctx.cpufreq_bounds.max_khz);
    }

    fn is_max_level(&self, ctx: &IsolatorContext, _fg: &Workload, _bgs: &[Arc<Workload>]) -> bool {
        self.cur_step_khz.saturating_sub(ctx.config.cpufreq_step_khz) < ctx.cpufreq_bounds.min_khz
    }

    fn is_min_level(&self, ctx: &IsolatorContext, _fg: &Workload, _bgs: &[Arc<Workload>]) -> bool {
        self.cur_step_khz + ctx.config.cpufreq_step_khz > ctx.cpufreq_bounds.max_khz
    }

    fn enforce(
        &self,
        _ctx: &IsolatorContext,
        _fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> Result<(), OsError> {
        for_each_live_bg(bgs, |bg| {
            let cores = bg.bound_cores()?;
            cpufreq::set_max_freq_default(&cores, self.cur_step_khz)
        })
    }

    fn reset(
        &self,
        ctx: &IsolatorContext,
        _fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> Result<(), OsError> {
        for_each_live_bg(bgs, |bg| {
            let cores = bg.orig_bound_cores();
            cpufreq::set_max_freq_default(&cores, ctx.cpufreq_bounds.max_khz)
        })
    }

    fn store_cur_config(&mut self) {
        self.stored_step_khz = Some(self.cur_step_khz);
    }

    fn load_cur_config(&mut self) {
        if let Some(step) = self.stored_step_khz.take() {
            self.cur_step_khz = step;
        }
    }

    fn decide_next_step(
        &mut self,
        ctx: &IsolatorContext,
        fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> NextStep {
        let Some(diff) = fg.calc_metric_diff() else {
            return NextStep::Idle;
        };
        decide_from_diff(
            &mut self.first_decision,
            &mut self.prev_diff,
            diff.local_mem_rate,
            self.is_max_level(ctx, fg, bgs),
            self.is_min_level(ctx, fg, bgs),
            ctx.config.force_threshold,
            ctx.config.dod_threshold,
        )
    }

    fn yield_isolation(&mut self) {
        self.first_decision = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::os::cpufreq::CpuFreqBounds;
    use crate::os::resctrl::ResctrlInfo;
    use crate::topology::NumaTopology;
    use std::collections::BTreeMap;

    fn ctx_owned() -> (NumaTopology, ResctrlInfo, CpuFreqBounds, Config) {
        let mut cpu_topo = BTreeMap::new();
        cpu_topo.insert(0, [0, 1, 2, 3].into_iter().collect());
        let topo = NumaTopology {
            cpu_topo,
            mem_nodes: [0].into_iter().collect(),
        };
        let resctrl_info = ResctrlInfo {
            max_bits: 20,
            min_bits: 2,
        };
        let bounds = CpuFreqBounds {
            min_khz: 800_000,
            max_khz: 1_000_000,
        };
        (topo, resctrl_info, bounds, Config::default())
    }

    #[test]
    fn strengthen_lowers_freq_and_caps_at_min() {
        let (topo, resctrl_info, bounds, mut config) = ctx_owned();
        config.cpufreq_step_khz = 100_000;
        let ctx = IsolatorContext {
            topology: &topo,
            resctrl_info: &resctrl_info,
            cpufreq_bounds: &bounds,
            config: &config,
        };
        let mut iso = MemBwIsolator::new(&ctx);
        assert_eq!(iso.cur_step_khz, 1_000_000);
        for _ in 0..5 {
            iso.strengthen(&ctx);
        }
        assert_eq!(iso.cur_step_khz, 800_000);
    }

    #[test]
    fn is_max_level_true_one_step_above_min() {
        let (topo, resctrl_info, bounds, mut config) = ctx_owned();
        config.cpufreq_step_khz = 100_000;
        let ctx = IsolatorContext {
            topology: &topo,
            resctrl_info: &resctrl_info,
            cpufreq_bounds: &bounds,
            config: &config,
        };
        let iso = MemBwIsolator {
            cur_step_khz: 850_000,
            stored_step_khz: None,
            first_decision: true,
            prev_diff: None,
        };
        assert!(iso.is_max_level(&ctx, &dummy_fg(), &[]));
    }

    fn dummy_fg() -> Workload {
        let dir = tempfile::tempdir().unwrap();
        Workload::new(
            "fg_a".into(),
            "fg".into(),
            crate::workload::WorkloadKind::Foreground,
            1,
            2,
            1000,
            0,
            Default::default(),
            Default::default(),
            10,
            dir.path().join("cpuset"),
            dir.path().join("resctrl"),
        )
    }
}
