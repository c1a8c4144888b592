//! Acceptance bookkeeping and trace summaries of a run.

use std::collections::VecDeque;

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

use crate::moves::MoveKind;

/// Number of recent outcomes kept per move kind.
pub const RECENT_WINDOW: usize = 100;

/// Proposal and acceptance tally of one move kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MoveStats {
    pub proposed: u64,
    pub accepted: u64,
    recent: VecDeque<bool>,
}

impl MoveStats {
    pub fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
        self.recent.push_back(accepted);
        if self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
    }

    /// Acceptance rate over the whole run; zero before the first proposal.
    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Acceptance rate over the last [`RECENT_WINDOW`] proposals.
    pub fn recent_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().filter(|&&a| a).count() as f64 / self.recent.len() as f64
    }
}

/// Per-kind acceptance counters of the move set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcceptanceCounters {
    birth: MoveStats,
    death: MoveStats,
    resample: MoveStats,
    swap: MoveStats,
    reselect: MoveStats,
}

impl AcceptanceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: MoveKind) -> &MoveStats {
        match kind {
            MoveKind::Birth => &self.birth,
            MoveKind::Death => &self.death,
            MoveKind::Resample => &self.resample,
            MoveKind::Swap => &self.swap,
            MoveKind::Reselect => &self.reselect,
        }
    }

    fn get_mut(&mut self, kind: MoveKind) -> &mut MoveStats {
        match kind {
            MoveKind::Birth => &mut self.birth,
            MoveKind::Death => &mut self.death,
            MoveKind::Resample => &mut self.resample,
            MoveKind::Swap => &mut self.swap,
            MoveKind::Reselect => &mut self.reselect,
        }
    }

    pub fn record(&mut self, kind: MoveKind, accepted: bool) {
        self.get_mut(kind).record(accepted);
    }

    pub fn iter(&self) -> impl Iterator<Item = (MoveKind, &MoveStats)> + '_ {
        MoveKind::ALL.into_iter().map(move |k| (k, self.get(k)))
    }

    pub fn total_proposed(&self) -> u64 {
        self.iter().map(|(_, s)| s.proposed).sum()
    }
}

/// Summary of a scalar trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceStats {
    pub mean: f64,
    pub variance: f64,
    pub max: f64,
    /// Effective sample size from the initial positive autocorrelation sequence.
    pub ess: f64,
}

/// Summaries of the per-scan log-probability and event count traces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceSummary {
    pub log_probability: TraceStats,
    pub event_count: TraceStats,
}

impl TraceSummary {
    pub fn from_traces(log_probability: &[f64], event_count: &[usize]) -> Option<Self> {
        let counts: Vec<f64> = event_count.iter().map(|&n| n as f64).collect();
        Some(Self {
            log_probability: trace_stats(log_probability)?,
            event_count: trace_stats(&counts)?,
        })
    }
}

/// Mean, variance, maximum and effective sample size of a trace. `None` if empty.
pub fn trace_stats(trace: &[f64]) -> Option<TraceStats> {
    if trace.is_empty() {
        return None;
    }
    let x = ArrayView1::from(trace);
    let mean = x.mean()?;
    let variance = if x.len() > 1 { x.var(1.0) } else { 0.0 };
    let max = x.max().ok().copied().unwrap_or(f64::NAN);
    Some(TraceStats {
        mean,
        variance,
        max,
        ess: effective_sample_size(trace),
    })
}

/// Autocorrelation of `trace` at `lag`, normalised by the lag-zero autocovariance.
pub fn autocorrelation(trace: &[f64], lag: usize) -> f64 {
    let n = trace.len();
    if lag >= n {
        return 0.0;
    }
    let x = ArrayView1::from(trace);
    let Some(mean) = x.mean() else {
        return 0.0;
    };
    let centred = x.mapv(|v| v - mean);
    let c0 = centred.dot(&centred);
    if c0 == 0.0 {
        return if lag == 0 { 1.0 } else { 0.0 };
    }
    let ck = centred.slice(s![..n - lag]).dot(&centred.slice(s![lag..]));
    ck / c0
}

/// `n / (1 + 2 Σ ρ_k)`, summing autocorrelations until the first non-positive pair sum.
pub fn effective_sample_size(trace: &[f64]) -> f64 {
    let n = trace.len();
    if n < 2 {
        return n as f64;
    }
    let mut tau = 1.0;
    let mut lag = 1;
    while lag + 1 < n {
        let pair = autocorrelation(trace, lag) + autocorrelation(trace, lag + 1);
        if pair <= 0.0 {
            break;
        }
        tau += 2.0 * pair;
        lag += 2;
    }
    (n as f64 / tau).min(n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn counters_track_rates_per_kind() {
        let mut counters = AcceptanceCounters::new();
        counters.record(MoveKind::Birth, true);
        counters.record(MoveKind::Birth, false);
        counters.record(MoveKind::Swap, false);
        assert_eq!(counters.get(MoveKind::Birth).proposed, 2);
        assert_abs_diff_eq!(counters.get(MoveKind::Birth).rate(), 0.5);
        assert_eq!(counters.get(MoveKind::Swap).rate(), 0.0);
        assert_eq!(counters.get(MoveKind::Death).rate(), 0.0);
        assert_eq!(counters.total_proposed(), 3);
    }

    #[test]
    fn recent_window_forgets_old_outcomes() {
        let mut stats = MoveStats::default();
        for _ in 0..RECENT_WINDOW {
            stats.record(false);
        }
        for _ in 0..RECENT_WINDOW {
            stats.record(true);
        }
        assert_abs_diff_eq!(stats.recent_rate(), 1.0);
        assert_abs_diff_eq!(stats.rate(), 0.5);
    }

    #[test]
    fn trace_stats_of_a_short_trace() {
        let stats = trace_stats(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_abs_diff_eq!(stats.mean, 2.5);
        assert_abs_diff_eq!(stats.variance, 5.0 / 3.0, epsilon = 1e-12);
        assert_eq!(stats.max, 4.0);
        assert!(trace_stats(&[]).is_none());
    }

    #[test]
    fn independent_draws_have_high_ess() {
        let mut rng = SmallRng::seed_from_u64(3);
        let trace: Vec<f64> = (0..2000).map(|_| rng.gen::<f64>()).collect();
        let ess = effective_sample_size(&trace);
        assert!(ess > 1000.0, "ess {ess}");
    }

    #[test]
    fn sticky_chain_has_low_ess() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut x = 0.0;
        let trace: Vec<f64> = (0..2000)
            .map(|_| {
                x = 0.98 * x + rng.gen::<f64>() - 0.5;
                x
            })
            .collect();
        let ess = effective_sample_size(&trace);
        assert!(ess < 200.0, "ess {ess}");
    }
}
