//! Cross-group swapper: periodically looks for two isolation groups whose
//! backgrounds would both do better swapped than they currently do, and
//! relocates them when the same pair keeps looking beneficial.

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::AppError;
use crate::metrics::MetricDiff;
use crate::policy::Policy;
use crate::topology::NumaTopology;

/// Per-axis counterfactual improvement from swapping two groups' first
/// background. Ground: `swapper.py::_select_cont_groups.calc_benefit`.
fn axis_benefit(
    a_fg: f64,
    a_bg: f64,
    b_fg: f64,
    b_bg: f64,
    a_bg_cores: usize,
    b_bg_cores: usize,
) -> f64 {
    let to_a = rescale(b_bg, b_bg_cores, a_bg_cores);
    let to_b = rescale(a_bg, a_bg_cores, b_bg_cores);
    let current = (a_fg + a_bg).abs() + (b_fg + b_bg).abs();
    let future = (a_fg + to_a).abs() + (b_fg + to_b).abs();
    current - future
}

/// Approximates "this background's counters would scale with however many
/// cores it ends up with" when moved into the other group's slot.
fn rescale(diff: f64, source_cores: usize, dest_cores: usize) -> f64 {
    if source_cores == 0 || dest_cores == 0 {
        diff
    } else {
        diff * (dest_cores as f64 / source_cores as f64)
    }
}

fn total_benefit(a_fg: &MetricDiff, a_bg: &MetricDiff, b_fg: &MetricDiff, b_bg: &MetricDiff, a_bg_cores: usize, b_bg_cores: usize) -> f64 {
    axis_benefit(a_fg.instructions_rate, a_bg.instructions_rate, b_fg.instructions_rate, b_bg.instructions_rate, a_bg_cores, b_bg_cores)
        + axis_benefit(a_fg.l3_hit_ratio, a_bg.l3_hit_ratio, b_fg.l3_hit_ratio, b_bg.l3_hit_ratio, a_bg_cores, b_bg_cores)
        + axis_benefit(a_fg.local_mem_rate, a_bg.local_mem_rate, b_fg.local_mem_rate, b_bg.local_mem_rate, a_bg_cores, b_bg_cores)
}

/// Identifies a candidate pair by the stable identifiers of their
/// foregrounds (order-independent), since `Policy` itself carries no
/// identity beyond that.
type PairKey = (String, String);

fn pair_key(a: &Policy, b: &Policy) -> PairKey {
    let ia = a.fg.identifier.clone();
    let ib = b.fg.identifier.clone();
    if ia <= ib {
        (ia, ib)
    } else {
        (ib, ia)
    }
}

pub struct Swapper {
    last_swap: Option<Instant>,
    prev_pair: Option<PairKey>,
    violation_count: u32,
}

impl Swapper {
    pub fn new() -> Self {
        Swapper {
            last_swap: None,
            prev_pair: None,
            violation_count: 0,
        }
    }

    fn within_swap_interval(&self, interval: Duration) -> bool {
        match self.last_swap {
            Some(last) => last.elapsed() <= interval,
            None => false,
        }
    }

    /// Scan every ordered pair of swap-safe groups, returning the first one
    /// whose total benefit crosses `swap_benefit_threshold`. Ground:
    /// `swapper.py::_select_cont_groups` — first-found, not best-found.
    fn select_candidate(&self, policies: &[Policy], config: &Config) -> Option<(usize, usize)> {
        let safe: Vec<usize> = policies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.safe_to_swap())
            .map(|(i, _)| i)
            .collect();

        for &i in &safe {
            for &j in &safe {
                if i == j {
                    continue;
                }
                let a = &policies[i];
                let b = &policies[j];
                let Some(a_bg) = a.bgs.first() else { continue };
                let Some(b_bg) = b.bgs.first() else { continue };
                let (Some(a_fg_diff), Some(a_bg_diff)) = (a.fg.calc_metric_diff(), a_bg.calc_metric_diff()) else {
                    continue;
                };
                let (Some(b_fg_diff), Some(b_bg_diff)) = (b.fg.calc_metric_diff(), b_bg.calc_metric_diff()) else {
                    continue;
                };
                let a_bg_cores = a_bg.bound_cores().map(|c| c.len()).unwrap_or_else(|_| a_bg.orig_bound_cores().len());
                let b_bg_cores = b_bg.bound_cores().map(|c| c.len()).unwrap_or_else(|_| b_bg.orig_bound_cores().len());
                let benefit = total_benefit(&a_fg_diff, &a_bg_diff, &b_fg_diff, &b_bg_diff, a_bg_cores, b_bg_cores);
                if benefit > config.swap_benefit_threshold {
                    return Some((i, j));
                }
            }
        }
        None
    }

    /// Runs one swapper invocation: gated by `swap_interval`, proposes (or
    /// confirms) a candidate pair, and executes the swap once the same pair
    /// has been proposed `swap_violation_count` times in a row.
    pub fn maybe_swap(
        &mut self,
        policies: &mut [Policy],
        config: &Config,
        topology: &NumaTopology,
    ) -> Result<(), AppError> {
        if self.within_swap_interval(config.swap_interval()) {
            return Ok(());
        }

        let Some((i, j)) = self.select_candidate(policies, config) else {
            self.prev_pair = None;
            self.violation_count = 0;
            return Ok(());
        };

        let key = pair_key(&policies[i], &policies[j]);
        if self.prev_pair.as_ref() == Some(&key) {
            self.violation_count += 1;
        } else {
            self.prev_pair = Some(key);
            self.violation_count = 1;
        }

        if self.violation_count >= config.swap_violation_count {
            self.do_swap(policies, i, j, topology)?;
            self.violation_count = 0;
            self.prev_pair = None;
            self.last_swap = Some(Instant::now());
        }
        Ok(())
    }

    /// Exchange the first background between two groups. Every OS-facing
    /// step is best-effort: a workload that has already exited does not
    /// abort the swap, and both backgrounds are always resumed at the end.
    /// Ground: `swapper.py::do_swap`.
    fn do_swap(
        &self,
        policies: &mut [Policy],
        i: usize,
        j: usize,
        topology: &NumaTopology,
    ) -> Result<(), AppError> {
        let bg1 = policies[i].bgs[0].clone();
        let bg2 = policies[j].bgs[0].clone();

        let _ = bg1.cpuset().set_memory_migrate(true);
        let _ = bg2.cpuset().set_memory_migrate(true);

        let _ = bg1.pause();
        let _ = bg2.pause();

        let bg1_mems = bg1.orig_bound_mems();
        let bg2_mems = bg2.orig_bound_mems();
        bg1.set_orig_bound_mems(bg2_mems);
        bg2.set_orig_bound_mems(bg1_mems);

        let bg1_cores = bg1.orig_bound_cores();
        let bg2_cores = bg2.orig_bound_cores();
        bg1.set_orig_bound_cores(bg2_cores.clone());
        bg2.set_orig_bound_cores(bg1_cores.clone());

        // Backgrounds carry their new group's socket, not their old one —
        // the isolators (LLC in particular) key mask placement off this.
        if let Ok(socket) = topology.socket_of_cores(&bg2_cores) {
            bg1.set_socket(socket);
        }
        if let Ok(socket) = topology.socket_of_cores(&bg1_cores) {
            bg2.set_socket(socket);
        }

        policies[i].bgs[0] = bg2.clone();
        policies[j].bgs[0] = bg1.clone();

        let _ = bg1.resume();
        let _ = bg2.resume();

        Ok(())
    }
}

impl Default for Swapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_is_identity_when_core_counts_match() {
        assert!((rescale(0.4, 4, 4) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn rescale_scales_by_destination_over_source() {
        assert!((rescale(0.4, 2, 4) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn rescale_falls_back_to_identity_on_zero_cores() {
        assert_eq!(rescale(0.4, 0, 4), 0.4);
    }

    #[test]
    fn no_candidates_clears_pending_pair() {
        let mut swapper = Swapper::new();
        swapper.prev_pair = Some(("a".into(), "b".into()));
        swapper.violation_count = 2;
        let mut policies: Vec<Policy> = Vec::new();
        let config = Config::default();
        let topo = NumaTopology {
            cpu_topo: std::collections::BTreeMap::new(),
            mem_nodes: std::collections::BTreeSet::new(),
        };
        swapper.maybe_swap(&mut policies, &config, &topo).unwrap();
        assert!(swapper.prev_pair.is_none());
        assert_eq!(swapper.violation_count, 0);
    }

    #[test]
    fn within_swap_interval_blocks_reentry() {
        let mut swapper = Swapper::new();
        swapper.last_swap = Some(Instant::now());
        assert!(swapper.within_swap_interval(Duration::from_secs(2)));
    }
}
