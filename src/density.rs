//! Joint log-probability of a world and the association consistency check.
//!
//! The target density is the product of
//! - the event count prior `Poisson(n; event_intensity)`,
//! - the prior of every event's parameters,
//! - for every detector, `Poisson(k; noise_intensity)` of its number of noise blips,
//! - the density of every blip, under its event if associated, otherwise as noise.
//!
//! Handing one blip from the noise pool to an event therefore changes the count term
//! by `ln k - ln noise_intensity`, where `k` is the pool size before the move.

use std::collections::BTreeMap;

use crate::distributions::poisson_log_pmf;
use crate::error::{Error, Result};
use crate::world::{BlipId, Event, EventId, Model, Observations, WorldState};

/// Additive pieces of a world log-probability.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LogProbComponents {
    pub event_count: f64,
    pub event_prior: f64,
    pub noise_count: f64,
    pub event_blips: f64,
    pub noise_blips: f64,
}

impl LogProbComponents {
    pub fn total(&self) -> f64 {
        self.event_count + self.event_prior + self.noise_count + self.event_blips + self.noise_blips
    }
}

/// Log-density of observing `k` noise blips on one detector.
pub fn noise_count_log_density(model: &Model, k: usize) -> f64 {
    poisson_log_pmf(k, model.noise_intensity)
}

/// Number of unassociated blips on every detector.
pub fn free_counts(observations: &Observations, state: &WorldState) -> Vec<usize> {
    observations
        .by_detector
        .iter()
        .map(|stream| {
            stream
                .iter()
                .filter(|&&b| state.association().is_free(b))
                .count()
        })
        .collect()
}

/// Checks that every event owns exactly one blip per detector and no blip is shared.
pub fn validate_association(
    model: &Model,
    observations: &Observations,
    state: &WorldState,
) -> Result<()> {
    let n_detectors = model.n_detectors();
    let mut coverage: BTreeMap<EventId, Vec<Option<BlipId>>> = state
        .events()
        .map(|(id, _)| (id, vec![None; n_detectors]))
        .collect();

    for (blip, owner) in state.association().iter_owned() {
        let detector = observations.blip(blip).detector;
        let slots = coverage.get_mut(&owner).ok_or_else(|| {
            Error::InconsistentAssociation(format!("blip {blip} belongs to unknown {owner}"))
        })?;
        if let Some(previous) = slots[detector] {
            return Err(Error::InconsistentAssociation(format!(
                "{owner} owns blips {previous} and {blip} on detector {detector}"
            )));
        }
        slots[detector] = Some(blip);
    }

    for (id, slots) in &coverage {
        if let Some(d) = slots.iter().position(Option::is_none) {
            return Err(Error::InconsistentAssociation(format!(
                "{id} has no blip on detector {d}"
            )));
        }
        let claimed = state.blips_of(*id).ok_or_else(|| {
            Error::InconsistentAssociation(format!("{id} has no blip list"))
        })?;
        let covered: Vec<BlipId> = slots.iter().flatten().copied().collect();
        if claimed != covered.as_slice() {
            return Err(Error::InconsistentAssociation(format!(
                "{id} claims {claimed:?} but owns {covered:?}"
            )));
        }
    }
    Ok(())
}

/// Joint log-probability of `state` given the blips, with its components.
///
/// Fails if the association is not well formed.
pub fn world_log_probability(
    model: &Model,
    observations: &Observations,
    state: &WorldState,
) -> Result<(f64, LogProbComponents)> {
    validate_association(model, observations, state)?;

    let mut components = LogProbComponents {
        event_count: poisson_log_pmf(state.n_events(), model.event_intensity),
        ..LogProbComponents::default()
    };
    for (_, event) in state.events() {
        components.event_prior += model.event_prior_log_density(event);
    }
    for count in free_counts(observations, state) {
        components.noise_count += noise_count_log_density(model, count);
    }
    for (id, blip) in observations.blips.iter().enumerate() {
        match state.association().owner(id) {
            Some(owner) => {
                let event = state.event(owner).ok_or_else(|| {
                    Error::InconsistentAssociation(format!("blip {id} belongs to unknown {owner}"))
                })?;
                components.event_blips += model.event_blip_log_density(event, blip);
            }
            None => components.noise_blips += model.noise_blip_log_density(blip),
        }
    }
    Ok((components.total(), components))
}

/// Change in world log-probability from adding `event` with `blips` to a world that
/// has `n_events` events and `free` noise blips per detector.
///
/// The blips must currently be noise; `free` counts them as such.
pub fn birth_log_delta(
    model: &Model,
    observations: &Observations,
    n_events: usize,
    free: &[usize],
    event: &Event,
    blips: &[BlipId],
) -> f64 {
    let count = poisson_log_pmf(n_events + 1, model.event_intensity)
        - poisson_log_pmf(n_events, model.event_intensity);
    let noise: f64 = free
        .iter()
        .map(|&k| {
            noise_count_log_density(model, k.saturating_sub(1))
                - noise_count_log_density(model, k)
        })
        .sum();
    count + noise + event_log_contribution(model, observations, event, blips)
}

/// Prior of `event` plus the log-ratio of its blips against noise.
///
/// This is the part of the world log-probability that changes when only the event's
/// parameters or its blip set change.
pub fn event_log_contribution(
    model: &Model,
    observations: &Observations,
    event: &Event,
    blips: &[BlipId],
) -> f64 {
    let prior = model.event_prior_log_density(event);
    if prior == f64::NEG_INFINITY {
        return prior;
    }
    prior
        + blips
            .iter()
            .map(|&b| model.blip_log_ratio(event, observations.blip(b)))
            .sum::<f64>()
}

/// Change in world log-probability when the events of `before` are replaced by those
/// of `after`, each listed with the blips it claims.
///
/// Both sides must claim the same number of blips on every detector, so the noise
/// counts stay put. A blip claimed on both sides contributes only its event
/// densities; its noise density is never added and subtracted. If both the old and
/// the new world are impossible the change is `-inf`.
pub fn claims_log_change(
    model: &Model,
    observations: &Observations,
    before: &[(&Event, &[BlipId])],
    after: &[(&Event, &[BlipId])],
) -> f64 {
    fn claimed(side: &[(&Event, &[BlipId])], blip: BlipId) -> bool {
        side.iter().any(|(_, blips)| blips.contains(&blip))
    }

    let mut gained = 0.0;
    for (event, blips) in after {
        gained += model.event_prior_log_density(event);
        for &b in blips.iter() {
            let blip = observations.blip(b);
            gained += model.event_blip_log_density(event, blip);
            if !claimed(before, b) {
                gained -= model.noise_blip_log_density(blip);
            }
        }
    }
    let mut lost = 0.0;
    for (event, blips) in before {
        lost += model.event_prior_log_density(event);
        for &b in blips.iter() {
            let blip = observations.blip(b);
            lost += model.event_blip_log_density(event, blip);
            if !claimed(after, b) {
                lost -= model.noise_blip_log_density(blip);
            }
        }
    }
    let change = gained - lost;
    if change.is_nan() {
        f64::NEG_INFINITY
    } else {
        change
    }
}
