/*!
# Potential-Event Proposer

Builds a ranked list of candidate events from the blips alone.

1. Keep only the "big" blips of every detector (magnitude above a threshold).
2. Triangulate every travel-time consistent pair of big blips on nearby detectors and
   drop candidates whose mean is implausible.
3. Score each survivor by picking its best-matching blip on every detector; drop
   weak candidates.
4. Re-triangulate from those best matches, re-check the ranges and score the refined
   mean by the world log-likelihood ratio of adding it; drop below a stricter bar.
5. Sort by score, best first. The sort is stable, so ties keep discovery order.

Near-duplicates found from different detector pairs are kept; birth proposals mix
over all candidates anyway. [`ProposerStats`] records how many candidates survive
each stage.
*/

use std::fmt;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::Config;
use crate::density::{birth_log_delta, free_counts};
use crate::error::{Error, Result};
use crate::triangulation::{triangulate, triangulate_column, PotentialEvent, Triangulation};
use crate::world::{BlipId, Event, Model, Observations, WorldState};

/// Thresholds and search limits of the proposer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposerSettings {
    pub magnitude_threshold: f64,
    pub first_llr_threshold: f64,
    pub second_llr_threshold: f64,
    pub range_slack_stds: f64,
    pub detector_pair_span: usize,
}

impl From<&Config> for ProposerSettings {
    fn from(config: &Config) -> Self {
        Self {
            magnitude_threshold: config.magnitude_threshold,
            first_llr_threshold: config.first_llr_threshold,
            second_llr_threshold: config.second_llr_threshold,
            range_slack_stds: config.range_slack_stds,
            detector_pair_span: config.detector_pair_span,
        }
    }
}

/// Survivors of each proposer stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProposerStats {
    pub total_blips: usize,
    pub big_blips: usize,
    pub detector_pairs: usize,
    /// Pairs of big blips within travel time of each other.
    pub blip_pairs: usize,
    pub in_range: usize,
    /// Candidates that passed the first likelihood-ratio bar.
    pub are_likely: usize,
    pub accepted: usize,
}

impl fmt::Display for ProposerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} blips ({} big), {} detector pairs, {} blip pairs, {} in range, {} likely, {} accepted",
            self.total_blips,
            self.big_blips,
            self.detector_pairs,
            self.blip_pairs,
            self.in_range,
            self.are_likely,
            self.accepted
        )
    }
}

/// Whether the triangulated mean lies within the prior's support, give or take
/// `slack` standard deviations.
pub fn in_plausible_range(model: &Model, tri: &Triangulation, slack: f64) -> bool {
    if !tri.is_feasible(model) {
        return false;
    }
    let (x_lo, x_hi) = tri.location_bounds(model);
    let (mean, sd) = (&tri.mean, &tri.std_dev);
    mean.time >= model.time_range.0 - slack * sd.time
        && mean.time <= model.time_range.1 + slack * sd.time
        && mean.location >= x_lo - slack * sd.location
        && mean.location <= x_hi + slack * sd.location
        && mean.magnitude >= model.min_magnitude - slack * sd.magnitude
}

/// Best-matching blip on `detector` for `event` among blips passing `available`,
/// with its event-over-noise log-ratio.
pub fn best_match(
    model: &Model,
    observations: &Observations,
    event: &Event,
    detector: usize,
    available: impl Fn(BlipId) -> bool,
) -> Option<(BlipId, f64)> {
    observations.by_detector[detector]
        .iter()
        .filter(|&&b| available(b))
        .map(|&b| (b, model.blip_log_ratio(event, observations.blip(b))))
        .fold(None, |best, (b, r)| match best {
            Some((_, best_r)) if best_r >= r => best,
            _ => Some((b, r)),
        })
}

/// Sum over detectors of the best-match log-ratio; `-inf` if a detector offers nothing.
pub fn best_match_llr(
    model: &Model,
    observations: &Observations,
    event: &Event,
    available: impl Fn(BlipId) -> bool,
) -> f64 {
    let mut total = 0.0;
    for d in 0..model.n_detectors() {
        match best_match(model, observations, event, d, &available) {
            Some((_, r)) => total += r,
            None => return f64::NEG_INFINITY,
        }
    }
    total
}

/// Log-probability gained by adding `event` to an empty world, letting it claim its
/// best-matching blip on every detector.
pub fn world_llr(model: &Model, observations: &Observations, event: &Event) -> f64 {
    let mut blips = Vec::with_capacity(model.n_detectors());
    for d in 0..model.n_detectors() {
        match best_match(model, observations, event, d, |_| true) {
            Some((b, _)) => blips.push(b),
            None => return f64::NEG_INFINITY,
        }
    }
    let empty = WorldState::empty(observations.len());
    let free = free_counts(observations, &empty);
    birth_log_delta(model, observations, 0, &free, event, &blips)
}

/// A first-pass candidate: a pair of big blips on detectors `left < right`.
#[derive(Debug, Clone, Copy)]
struct PairCandidate {
    left: usize,
    right: usize,
    triangulation: Triangulation,
}

fn big_blips(observations: &Observations, threshold: f64) -> Vec<Vec<BlipId>> {
    observations
        .by_detector
        .iter()
        .map(|stream| {
            stream
                .iter()
                .copied()
                .filter(|&b| observations.blip(b).magnitude >= threshold)
                .collect()
        })
        .collect()
}

fn pair_candidates(
    model: &Model,
    observations: &Observations,
    settings: &ProposerSettings,
    stats: &mut ProposerStats,
) -> Result<Vec<PairCandidate>> {
    let big = big_blips(observations, settings.magnitude_threshold);
    stats.total_blips = observations.len();
    stats.big_blips = big.iter().map(Vec::len).sum();
    let n = model.n_detectors();
    let time_slack = 2.0 * settings.range_slack_stds * model.time_std;
    let mut out = Vec::new();
    for left in 0..n {
        for right in (left + 1)..n.min(left + settings.detector_pair_span + 1) {
            stats.detector_pairs += 1;
            let window = model.detectors[right] - model.detectors[left] + time_slack;
            for &a in &big[left] {
                let ta = observations.blip(a).time;
                for &b in &big[right] {
                    let tb = observations.blip(b).time;
                    if tb < ta - window {
                        continue;
                    }
                    if tb > ta + window {
                        break;
                    }
                    stats.blip_pairs += 1;
                    let triangulation = triangulate(model, observations, &[a], &[b])?;
                    if in_plausible_range(model, &triangulation, settings.range_slack_stds) {
                        out.push(PairCandidate {
                            left,
                            right,
                            triangulation,
                        });
                    }
                }
            }
        }
    }
    Ok(out)
}

/// How far a pair candidate got through refinement.
enum Refined {
    Unlikely,
    Dropped,
    Accepted(PotentialEvent),
}

fn refine(
    model: &Model,
    observations: &Observations,
    settings: &ProposerSettings,
    candidate: &PairCandidate,
) -> Result<Refined> {
    let mean = candidate.triangulation.mean;
    let mut best = Vec::with_capacity(model.n_detectors());
    let mut first_llr = 0.0;
    for d in 0..model.n_detectors() {
        match best_match(model, observations, &mean, d, |_| true) {
            Some((b, r)) => {
                best.push(b);
                first_llr += r;
            }
            None => return Ok(Refined::Unlikely),
        }
    }
    if first_llr < settings.first_llr_threshold {
        return Ok(Refined::Unlikely);
    }

    let left = &best[..=candidate.left];
    let right = &best[candidate.right..];
    let triangulation = triangulate(model, observations, left, right)?;
    if !in_plausible_range(model, &triangulation, settings.range_slack_stds) {
        return Ok(Refined::Dropped);
    }
    let score = world_llr(model, observations, &triangulation.clamped_mean(model));
    if score < settings.second_llr_threshold {
        return Ok(Refined::Dropped);
    }
    Ok(Refined::Accepted(PotentialEvent {
        triangulation,
        score,
    }))
}

fn rank(mut events: Vec<PotentialEvent>) -> Vec<PotentialEvent> {
    events.sort_by(|a, b| b.score.total_cmp(&a.score));
    events
}

/// Triangulates, verifies and ranks candidate events from the blips alone.
pub fn compute_potential_events(
    model: &Model,
    observations: &Observations,
    settings: &ProposerSettings,
) -> Result<(Vec<PotentialEvent>, ProposerStats)> {
    let mut stats = ProposerStats::default();
    let pairs = pair_candidates(model, observations, settings, &mut stats)?;
    stats.in_range = pairs.len();
    let refined: Vec<Refined> = pairs
        .par_iter()
        .map(|candidate| refine(model, observations, settings, candidate))
        .collect::<Result<_>>()?;

    let mut events = Vec::new();
    for outcome in refined {
        match outcome {
            Refined::Unlikely => {}
            Refined::Dropped => stats.are_likely += 1,
            Refined::Accepted(event) => {
                stats.are_likely += 1;
                events.push(event);
            }
        }
    }
    stats.accepted = events.len();
    info!(%stats, "computed potential events");
    if events.is_empty() {
        warn!("potential-event proposer found no candidates");
    }
    Ok((rank(events), stats))
}

/// Candidates built directly from a known world: each true event triangulated from
/// its own blips. Only meant for debugging the move set.
pub fn potential_events_from_truth(
    model: &Model,
    observations: &Observations,
    truth: &WorldState,
) -> Result<Vec<PotentialEvent>> {
    let mut events = Vec::with_capacity(truth.n_events());
    for (id, event) in truth.events() {
        let blips = truth.blips_of(id).ok_or_else(|| {
            Error::InconsistentAssociation(format!("true event {id} has no blip list"))
        })?;
        let triangulation =
            triangulate_column(model, observations, blips, model.column(event.location))?;
        let score = world_llr(model, observations, &triangulation.clamped_mean(model));
        events.push(PotentialEvent {
            triangulation,
            score,
        });
    }
    Ok(rank(events))
}
