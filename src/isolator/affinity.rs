//! Core-affinity isolator: extends the foreground's contiguous core range
//! inward toward the background, one core at a time. Contended metric is
//! `Δinstructions-rate`.

use std::sync::Arc;

use crate::error::OsError;
use crate::workload::Workload;

use super::{decide_from_diff, IsolatorContext, IsolatorOps, NextStep};

#[derive(Debug)]
pub struct AffinityIsolator {
    /// Last core currently bound to the foreground. Starts at the
    /// foreground's own original last core and grows toward (but never
    /// reaching) the background's first core.
    cur_step: u32,
    stored_step: Option<u32>,
    first_decision: bool,
    prev_diff: Option<f64>,
}

impl AffinityIsolator {
    pub fn new(fg: &Workload) -> Self {
        let last = fg.orig_bound_cores().iter().copied().max().unwrap_or(0);
        AffinityIsolator {
            cur_step: last,
            stored_step: None,
            first_decision: true,
            prev_diff: None,
        }
    }

    fn fg_range(&self, fg: &Workload) -> std::collections::BTreeSet<u32> {
        let first = fg.orig_bound_cores().iter().copied().min().unwrap_or(0);
        (first..=self.cur_step).collect()
    }
}

impl IsolatorOps for AffinityIsolator {
    fn strengthen(&mut self, _ctx: &IsolatorContext) {
        self.cur_step += 1;
    }

    fn weaken(&mut self, _ctx: &IsolatorContext) {
        self.cur_step = self.cur_step.saturating_sub(1);
    }

    fn is_max_level(&self, _ctx: &IsolatorContext, _fg: &Workload, bgs: &[Arc<Workload>]) -> bool {
        let Some(bg) = bgs.first() else { return true };
        let bg_first = bg.orig_bound_cores().iter().copied().min().unwrap_or(0);
        self.cur_step + 1 >= bg_first
    }

    fn is_min_level(&self, _ctx: &IsolatorContext, fg: &Workload, _bgs: &[Arc<Workload>]) -> bool {
        let orig_last = fg.orig_bound_cores().iter().copied().max().unwrap_or(0);
        self.cur_step <= orig_last
    }

    fn enforce(
        &self,
        _ctx: &IsolatorContext,
        fg: &Workload,
        _bgs: &[Arc<Workload>],
    ) -> Result<(), OsError> {
        if fg.is_running() {
            fg.set_bound_cores(&self.fg_range(fg))?;
        }
        Ok(())
    }

    fn reset(
        &self,
        _ctx: &IsolatorContext,
        fg: &Workload,
        _bgs: &[Arc<Workload>],
    ) -> Result<(), OsError> {
        if fg.is_running() {
            fg.set_bound_cores(&fg.orig_bound_cores())?;
        }
        Ok(())
    }

    fn store_cur_config(&mut self) {
        self.stored_step = Some(self.cur_step);
    }

    fn load_cur_config(&mut self) {
        if let Some(step) = self.stored_step.take() {
            self.cur_step = step;
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
            diff.instructions_rate,
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
    use std::collections::BTreeSet;

    #[test]
    fn fg_range_always_starts_at_original_first_core() {
        let dir = tempfile::tempdir().unwrap();
        let fg = Workload::new(
            "fg_a".into(),
            "fg".into(),
            crate::workload::WorkloadKind::Foreground,
            1,
            2,
            1000,
            0,
            [0u32, 1, 2].into_iter().collect(),
            BTreeSet::new(),
            10,
            dir.path().join("cpuset"),
            dir.path().join("resctrl"),
        );
        let iso = AffinityIsolator {
            cur_step: 4,
            stored_step: None,
            first_decision: true,
            prev_diff: None,
        };
        assert_eq!(iso.fg_range(&fg), [0, 1, 2, 3, 4].into_iter().collect());
    }

    #[test]
    fn is_min_level_true_at_original_range() {
        let dir = tempfile::tempdir().unwrap();
        let fg = Workload::new(
            "fg_a".into(),
            "fg".into(),
            crate::workload::WorkloadKind::Foreground,
            1,
            2,
            1000,
            0,
            [0u32, 1, 2].into_iter().collect(),
            BTreeSet::new(),
            10,
            dir.path().join("cpuset"),
            dir.path().join("resctrl"),
        );
        let iso = AffinityIsolator::new(&fg);
        assert_eq!(iso.cur_step, 2);
    }
}
