//! LLC way partitioning via `resctrl` bitmasks. Contended metric is
//! `Δl3-hit-ratio`; strengthening grows the foreground's contiguous slice
//! of cache ways by one bit.

use std::sync::Arc;

use crate::os::resctrl::gen_mask;
use crate::workload::Workload;

use super::{decide_from_diff, for_each_live_bg, IsolatorContext, IsolatorOps, NextStep};

#[derive(Debug)]
pub struct LlcIsolator {
    /// `None` means CAT is off (full mask both sides). `Some(bits)` is the
    /// number of low-order ways given to the foreground.
    cur_step: Option<u32>,
    stored_step: Option<Option<u32>>,
    first_decision: bool,
    prev_diff: Option<f64>,
}

impl LlcIsolator {
    pub fn new(_fg: &Workload) -> Self {
        LlcIsolator {
            cur_step: None,
            stored_step: None,
            first_decision: true,
            prev_diff: None,
        }
    }

    fn full_masks(&self, ctx: &IsolatorContext) -> Vec<(u32, String)> {
        let full = gen_mask(0, ctx.resctrl_info.max_bits, ctx.resctrl_info.max_bits);
        ctx.topology.socket_ids().map(|s| (s, full.clone())).collect()
    }
}

impl IsolatorOps for LlcIsolator {
    fn strengthen(&mut self, ctx: &IsolatorContext) {
        self.cur_step = Some(match self.cur_step {
            None => ctx.resctrl_info.max_bits / 2,
            Some(step) => (step + 1).min(ctx.resctrl_info.max_bits.saturating_sub(1)),
        });
    }

    fn weaken(&mut self, ctx: &IsolatorContext) {
        self.cur_step = match self.cur_step {
            None => None,
            Some(step) => {
                if step <= ctx.resctrl_info.min_bits + 1 {
                    None
                } else {
                    Some(step - 1)
                }
            }
        };
    }

    fn is_max_level(&self, ctx: &IsolatorContext, _fg: &Workload, _bgs: &[Arc<Workload>]) -> bool {
        matches!(self.cur_step, Some(step) if step + 1 >= ctx.resctrl_info.max_bits)
    }

    fn is_min_level(&self, _ctx: &IsolatorContext, _fg: &Workload, _bgs: &[Arc<Workload>]) -> bool {
        self.cur_step.is_none()
    }

    fn enforce(
        &self,
        ctx: &IsolatorContext,
        fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> Result<(), crate::error::OsError> {
        let Some(step) = self.cur_step else {
            return self.reset(ctx, fg, bgs);
        };

        if fg.is_running() {
            let mut masks = self.full_masks(ctx);
            for (socket, mask) in masks.iter_mut() {
                if *socket == fg.socket() {
                    *mask = gen_mask(0, step, ctx.resctrl_info.max_bits);
                }
            }
            fg.resctrl().assign_llc(&masks)?;
        }

        for_each_live_bg(bgs, |bg| {
            let mut masks = self.full_masks(ctx);
            for (socket, mask) in masks.iter_mut() {
                if *socket == bg.socket() {
                    *mask = gen_mask(step, ctx.resctrl_info.max_bits, ctx.resctrl_info.max_bits);
                }
            }
            bg.resctrl().assign_llc(&masks)
        })
    }

    fn reset(
        &self,
        ctx: &IsolatorContext,
        fg: &Workload,
        bgs: &[Arc<Workload>],
    ) -> Result<(), crate::error::OsError> {
        if fg.is_running() {
            fg.resctrl().assign_llc(&self.full_masks(ctx))?;
        }
        for_each_live_bg(bgs, |bg| bg.resctrl().assign_llc(&self.full_masks(ctx)))
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
            diff.l3_hit_ratio,
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
