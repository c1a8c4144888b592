/*!
# Sampler Driver

Runs scans of the move set over an [`InferenceContext`]. One scan is

1. one birth-or-death attempt,
2. one swap attempt per side for every eligible pair of events,
3. one resample attempt per event,
4. one reselect attempt per event,

all against the live world, so later moves see the results of earlier ones. After
every scan the world's log-probability is recomputed, which also re-validates the
association. Each scan leaves a [`ScanSummary`] of the moves it accepted, and every
`report_stride` scans a [`ScanRecord`] is kept and logged.

# Examples

```rust
use blip_mcmc::config::Config;
use blip_mcmc::sampler::run_synthetic;

let config = Config {
    iterations: 5,
    report_stride: 5,
    ..Config::default()
};
let (world, run) = run_synthetic(&config).unwrap();
assert_eq!(run.log_probabilities.len(), 5);
assert_eq!(run.records.len(), 1);
assert_eq!(run.scan_summaries.len(), 5);
assert!(!world.observations.is_empty());
```
*/

use std::fmt;

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::InferenceContext;
use crate::error::{Error, Result};
use crate::evaluation::{association_scores, event_scores, Scores};
use crate::moves::swap::swappable;
use crate::moves::{
    birth_death, reselect_blips, resample_event, swap_event_pair, MoveKind, MoveOutcome, SwapSide,
};
use crate::stats::{AcceptanceCounters, TraceSummary};
use crate::world::{sample_world, Model, SyntheticWorld, WorldState};

/// How long to run and what to keep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    pub iterations: usize,
    pub report_stride: usize,
    pub keep_snapshots: bool,
    pub progress: bool,
    pub match_tolerance: f64,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            iterations: config.iterations,
            report_stride: config.report_stride,
            keep_snapshots: config.keep_snapshots,
            progress: config.progress,
            match_tolerance: config.match_tolerance,
        }
    }
}

/// Statistics taken at a reporting stride.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub scan: usize,
    pub log_probability: f64,
    pub n_events: usize,
    /// Present when the run knows the truth.
    pub event_scores: Option<Scores>,
    pub association_scores: Option<Scores>,
    pub counters: AcceptanceCounters,
}

/// Moves accepted during one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub births: usize,
    pub deaths: usize,
    pub swaps: usize,
    pub resamples: usize,
    pub reselects: usize,
}

impl ScanSummary {
    fn note(&mut self, outcome: MoveOutcome) {
        if !outcome.accepted {
            return;
        }
        let count = match outcome.kind {
            MoveKind::Birth => &mut self.births,
            MoveKind::Death => &mut self.deaths,
            MoveKind::Swap => &mut self.swaps,
            MoveKind::Resample => &mut self.resamples,
            MoveKind::Reselect => &mut self.reselects,
        };
        *count += 1;
    }

    pub fn total(&self) -> usize {
        self.births + self.deaths + self.swaps + self.resamples + self.reselects
    }
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            (MoveKind::Birth, self.births),
            (MoveKind::Death, self.deaths),
            (MoveKind::Swap, self.swaps),
            (MoveKind::Resample, self.resamples),
            (MoveKind::Reselect, self.reselects),
        ]
        .into_iter()
        .filter(|&(_, n)| n > 0)
        .map(|(kind, n)| format!("{n} {kind}"))
        .collect();
        if parts.is_empty() {
            f.write_str("no moves accepted")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Everything a run leaves behind.
#[derive(Debug, Clone)]
pub struct InferenceRun {
    pub final_state: WorldState,
    pub records: Vec<ScanRecord>,
    pub scan_summaries: Vec<ScanSummary>,
    /// World after every scan, when snapshots are enabled.
    pub snapshots: Vec<WorldState>,
    pub log_probabilities: Vec<f64>,
    pub event_counts: Vec<usize>,
    pub counters: AcceptanceCounters,
    pub summary: Option<TraceSummary>,
}

/// Applies one full scan of the move set.
pub fn scan(ctx: &mut InferenceContext) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    summary.note(birth_death(ctx)?);

    let ids = ctx.state.event_ids();
    for (i, &a) in ids.iter().enumerate() {
        for &b in &ids[i + 1..] {
            for side in SwapSide::BOTH {
                let eligible = match (ctx.state.event(a), ctx.state.event(b)) {
                    (Some(ea), Some(eb)) => swappable(&ctx.model, ea, eb),
                    _ => false,
                };
                if eligible {
                    summary.note(swap_event_pair(ctx, a, b, side)?);
                }
            }
        }
    }

    for &id in &ids {
        summary.note(resample_event(ctx, id)?);
    }
    for &id in &ids {
        summary.note(reselect_blips(ctx, id)?);
    }
    Ok(summary)
}

fn record_scan(
    ctx: &InferenceContext,
    scan: usize,
    log_probability: f64,
    truth: Option<&WorldState>,
    tolerance: f64,
) -> Result<ScanRecord> {
    let (event_scores, association_scores) = match truth {
        Some(truth) => (
            Some(event_scores(
                &ctx.model,
                &ctx.observations,
                truth,
                &ctx.state,
                tolerance,
            )?),
            Some(association_scores(
                truth.association(),
                ctx.state.association(),
            )),
        ),
        None => (None, None),
    };
    Ok(ScanRecord {
        scan,
        log_probability,
        n_events: ctx.state.n_events(),
        event_scores,
        association_scores,
        counters: ctx.counters.clone(),
    })
}

/// Runs `settings.iterations` scans from the context's current world.
///
/// With `truth` given, stride records carry event and association scores.
pub fn run(
    ctx: &mut InferenceContext,
    settings: &RunSettings,
    truth: Option<&WorldState>,
) -> Result<InferenceRun> {
    let pb = if settings.progress {
        let pb = ProgressBar::new(settings.iterations as u64);
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .map_err(|e| Error::Config(format!("progress bar template: {e}")))?
            .progress_chars("##-");
        pb.set_style(style);
        pb.set_prefix("Scans");
        Some(pb)
    } else {
        None
    };

    let mut records = Vec::new();
    let mut scan_summaries = Vec::with_capacity(settings.iterations);
    let mut snapshots = Vec::new();
    let mut log_probabilities = Vec::with_capacity(settings.iterations);
    let mut event_counts = Vec::with_capacity(settings.iterations);

    for iteration in 0..settings.iterations {
        let summary = scan(ctx)?;
        let (log_probability, _) = ctx.log_probability()?;
        debug!(scan = iteration + 1, %summary, "scan done");
        scan_summaries.push(summary);
        log_probabilities.push(log_probability);
        event_counts.push(ctx.state.n_events());
        if settings.keep_snapshots {
            snapshots.push(ctx.state.clone());
        }

        let scan_number = iteration + 1;
        if settings.report_stride > 0 && scan_number % settings.report_stride == 0 {
            let record = record_scan(
                ctx,
                scan_number,
                log_probability,
                truth,
                settings.match_tolerance,
            )?;
            info!(
                scan = scan_number,
                log_probability,
                n_events = record.n_events,
                event_f1 = record.event_scores.map(|s| s.f1),
                association_f1 = record.association_scores.map(|s| s.f1),
                "scan report"
            );
            records.push(record);
        }
        if let Some(pb) = &pb {
            pb.set_position(scan_number as u64);
            pb.set_message(format!(
                "events={} logp={:.1}",
                ctx.state.n_events(),
                log_probability
            ));
        }
    }
    if let Some(pb) = &pb {
        pb.finish_with_message("Done!");
    }

    let summary = TraceSummary::from_traces(&log_probabilities, &event_counts);
    Ok(InferenceRun {
        final_state: ctx.state.clone(),
        records,
        scan_summaries,
        snapshots,
        log_probabilities,
        event_counts,
        counters: ctx.counters.clone(),
        summary,
    })
}

/// Generates a world from `config`, then infers it from an empty start.
pub fn run_synthetic(config: &Config) -> Result<(SyntheticWorld, InferenceRun)> {
    config.validate()?;
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let world = sample_world(&Model::generative(config), &mut rng)?;
    info!(
        events = world.truth.n_events(),
        blips = world.observations.len(),
        "generated synthetic world"
    );
    let mut ctx =
        InferenceContext::from_config(config, world.observations.clone(), Some(&world.truth))?;
    info!(
        candidates = ctx.potential_events.len(),
        "potential events ready"
    );
    let run = run(&mut ctx, &RunSettings::from(config), Some(&world.truth))?;
    Ok((world, run))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_follow_the_stride() {
        let config = Config {
            iterations: 12,
            report_stride: 4,
            keep_snapshots: true,
            ..Config::default()
        };
        let (_, run) = run_synthetic(&config).unwrap();
        let scans: Vec<usize> = run.records.iter().map(|r| r.scan).collect();
        assert_eq!(scans, vec![4, 8, 12]);
        assert_eq!(run.snapshots.len(), 12);
        assert_eq!(run.event_counts.len(), 12);
        assert!(run.records.iter().all(|r| r.event_scores.is_some()));
        assert_eq!(run.final_state, run.snapshots[11]);
    }

    #[test]
    fn snapshots_can_be_disabled() {
        let config = Config {
            iterations: 3,
            report_stride: 1,
            keep_snapshots: false,
            ..Config::default()
        };
        let (_, run) = run_synthetic(&config).unwrap();
        assert!(run.snapshots.is_empty());
        assert_eq!(run.records.len(), 3);
        assert!(run.summary.is_some());
    }

    #[test]
    fn scan_summaries_add_up_to_the_counters() {
        let config = Config {
            iterations: 10,
            keep_snapshots: false,
            ..Config::default()
        };
        let (_, run) = run_synthetic(&config).unwrap();
        assert_eq!(run.scan_summaries.len(), 10);
        let accepted: u64 = run.counters.iter().map(|(_, s)| s.accepted).sum();
        let noted: usize = run.scan_summaries.iter().map(ScanSummary::total).sum();
        assert_eq!(noted as u64, accepted);
        let births: usize = run.scan_summaries.iter().map(|s| s.births).sum();
        assert_eq!(births as u64, run.counters.get(MoveKind::Birth).accepted);
    }

    #[test]
    fn scan_summary_lists_accepted_moves() {
        let summary = ScanSummary {
            births: 1,
            swaps: 2,
            reselects: 1,
            ..ScanSummary::default()
        };
        assert_eq!(summary.to_string(), "1 birth, 2 swap, 1 reselect");
        assert_eq!(summary.total(), 4);
        assert_eq!(ScanSummary::default().to_string(), "no moves accepted");
    }

    #[test]
    fn same_seed_same_chain() {
        let config = Config {
            iterations: 8,
            ..Config::default()
        };
        let (_, a) = run_synthetic(&config).unwrap();
        let (_, b) = run_synthetic(&config).unwrap();
        assert_eq!(a.log_probabilities, b.log_probabilities);
        assert_eq!(a.final_state, b.final_state);
    }
}
