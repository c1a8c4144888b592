/*!
Trans-dimensional birth and death of events.

A birth picks a source (one of the potential events, or the prior), draws the event's
parameters from it and then one free blip per detector. A death removes an existing
event, chosen uniformly or by how little the world loses without it.

Both directions are scored by the same function: the death of event `e` from state
`s` is the exact reverse of the birth of `e` from `s` without `e`, so its log ratio
is the negated birth log ratio evaluated in that reduced world. The reduced world is
never materialised; [`FreeView`] treats the doomed event's blips as noise.

The event parameter density of a birth is the full mixture over sources, since any
potential event could have produced the drawn parameters.
*/

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::debug;

use super::{metropolis_accept, record, FreeView, MoveKind, MoveOutcome};
use crate::context::{InferenceContext, Scene};
use crate::density::birth_log_delta;
use crate::distributions::{log_sum_exp, Categorical, DiscreteDistribution};
use crate::error::{Error, Result};
use crate::potential::best_match_llr;
use crate::world::{BlipId, Event, EventId, WorldState};

/// The world a birth starts from, possibly the current one minus an event.
struct Origin<'a> {
    state: &'a WorldState,
    view: FreeView<'a>,
    excluded: Option<EventId>,
    n_events: usize,
    free: Vec<usize>,
}

impl<'a> Origin<'a> {
    fn current(scene: &Scene<'_>, state: &'a WorldState) -> Self {
        let view = FreeView::current(state);
        Self {
            state,
            view,
            excluded: None,
            n_events: state.n_events(),
            free: view.free_counts(scene.observations),
        }
    }

    fn without(
        scene: &Scene<'_>,
        state: &'a WorldState,
        id: EventId,
        released: &'a [BlipId],
    ) -> Self {
        let view = FreeView::releasing(state, released);
        Self {
            state,
            view,
            excluded: Some(id),
            n_events: state.n_events().saturating_sub(1),
            free: view.free_counts(scene.observations),
        }
    }

    fn events(&self) -> impl Iterator<Item = (EventId, &'a Event)> + '_ {
        let excluded = self.excluded;
        self.state.events().filter(move |(id, _)| Some(*id) != excluded)
    }
}

/// Candidate blips of one detector with their selection distribution.
struct BlipChoice {
    candidates: Vec<BlipId>,
    distribution: Categorical,
}

/// Selection weights of the birth sources: every potential event, then the prior.
fn source_distribution(scene: &Scene<'_>, origin: &Origin<'_>) -> Option<Categorical> {
    let model = scene.model;
    let mut weights: Vec<f64> = scene
        .potential_events
        .iter()
        .map(|p| {
            let tri = &p.triangulation;
            if !tri.is_feasible(model) {
                return f64::NEG_INFINITY;
            }
            best_match_llr(model, scene.observations, &tri.clamped_mean(model), |b| {
                origin.view.is_free(b)
            })
        })
        .collect();
    weights.push(scene.settings.prior_birth_log_weight);
    Categorical::from_log_weights(&weights)
}

fn event_proposal_log_density(scene: &Scene<'_>, sources: &Categorical, event: &Event) -> f64 {
    let model = scene.model;
    let prior_index = scene.potential_events.len();
    let mut terms: Vec<f64> = scene
        .potential_events
        .iter()
        .enumerate()
        .filter_map(|(k, p)| {
            let lp = sources.log_prob(k);
            (lp > f64::NEG_INFINITY).then(|| lp + p.triangulation.log_density(model, event))
        })
        .collect();
    terms.push(sources.log_prob(prior_index) + model.event_prior_log_density(event));
    log_sum_exp(&terms)
}

/// Per-detector categorical over free blips, weighted by event-over-noise ratio.
/// `None` when some detector has no free blip.
fn blip_choices(scene: &Scene<'_>, origin: &Origin<'_>, event: &Event) -> Option<Vec<BlipChoice>> {
    scene
        .observations
        .by_detector
        .iter()
        .map(|stream| {
            let candidates: Vec<BlipId> = stream
                .iter()
                .copied()
                .filter(|&b| origin.view.is_free(b))
                .collect();
            let weights: Vec<f64> = candidates
                .iter()
                .map(|&b| {
                    scene
                        .model
                        .blip_log_ratio(event, scene.observations.blip(b))
                })
                .collect();
            let distribution = Categorical::from_log_weights(&weights)?;
            Some(BlipChoice {
                candidates,
                distribution,
            })
        })
        .collect()
}

fn blip_selection_log_prob(choices: &[BlipChoice], blips: &[BlipId]) -> f64 {
    if choices.len() != blips.len() {
        return f64::NEG_INFINITY;
    }
    choices
        .iter()
        .zip(blips)
        .map(|(choice, b)| match choice.candidates.iter().position(|c| c == b) {
            Some(i) => choice.distribution.log_prob(i),
            None => f64::NEG_INFINITY,
        })
        .sum()
}

fn claimed_blips(state: &WorldState, id: EventId) -> Result<&[BlipId]> {
    state
        .blips_of(id)
        .ok_or_else(|| Error::InconsistentAssociation(format!("{id} has no blip list")))
}

/// Log-probability of picking the newborn for death from the world after the birth.
fn death_selection_log_prob(
    scene: &Scene<'_>,
    origin: &Origin<'_>,
    newborn_delta: f64,
) -> Result<f64> {
    let n = origin.n_events;
    if !scene.settings.biased_death {
        return Ok(-((n + 1) as f64).ln());
    }
    // Removing any other event from the grown world leaves `n` events and the
    // origin's free counts, since every event holds one blip per detector.
    let mut weights = Vec::with_capacity(n + 1);
    for (id, e) in origin.events() {
        let blips = claimed_blips(origin.state, id)?;
        weights.push(-birth_log_delta(
            scene.model,
            scene.observations,
            n,
            &origin.free,
            e,
            blips,
        ));
    }
    weights.push(-newborn_delta);
    Ok(-newborn_delta - log_sum_exp(&weights))
}

fn birth_ratio_with(
    scene: &Scene<'_>,
    origin: &Origin<'_>,
    sources: &Categorical,
    choices: Option<&[BlipChoice]>,
    event: &Event,
    blips: &[BlipId],
) -> Result<f64> {
    let n = origin.n_events;
    let delta = birth_log_delta(
        scene.model,
        scene.observations,
        n,
        &origin.free,
        event,
        blips,
    );
    // An infinite gain means the origin leaves some blip to a noise process that
    // cannot have produced it: the origin is impossible and any exit is accepted.
    if delta.is_infinite() {
        return Ok(delta);
    }
    let log_q_blips = match choices {
        Some(choices) => blip_selection_log_prob(choices, blips),
        None => f64::NEG_INFINITY,
    };
    let forward = scene.settings.birth_probability(n).ln() - ((n + 1) as f64).ln()
        + event_proposal_log_density(scene, sources, event)
        + log_q_blips;
    if forward == f64::NEG_INFINITY {
        return Ok(f64::INFINITY);
    }
    let reverse = scene.settings.death_probability(n + 1).ln()
        + death_selection_log_prob(scene, origin, delta)?;
    Ok(delta + reverse - forward)
}

fn birth_ratio(
    scene: &Scene<'_>,
    origin: &Origin<'_>,
    event: &Event,
    blips: &[BlipId],
) -> Result<f64> {
    let Some(sources) = source_distribution(scene, origin) else {
        return Ok(f64::INFINITY);
    };
    let choices = blip_choices(scene, origin, event);
    birth_ratio_with(scene, origin, &sources, choices.as_deref(), event, blips)
}

fn death_ratio(scene: &Scene<'_>, state: &WorldState, id: EventId) -> Result<f64> {
    let missing = || Error::InconsistentAssociation(format!("{id} is not in the world"));
    let event = state.event(id).ok_or_else(missing)?;
    let blips = state.blips_of(id).ok_or_else(missing)?;
    let origin = Origin::without(scene, state, id, blips);
    Ok(-birth_ratio(scene, &origin, event, blips)?)
}

/// Log acceptance ratio of adding `event` with `blips` to the current world.
pub fn birth_log_acceptance(
    ctx: &InferenceContext,
    event: &Event,
    blips: &[BlipId],
) -> Result<f64> {
    let scene = ctx.scene();
    let origin = Origin::current(&scene, &ctx.state);
    birth_ratio(&scene, &origin, event, blips)
}

/// Log acceptance ratio of deleting event `id` from the current world.
pub fn death_log_acceptance(ctx: &InferenceContext, id: EventId) -> Result<f64> {
    death_ratio(&ctx.scene(), &ctx.state, id)
}

fn propose_birth(
    scene: Scene<'_>,
    state: &mut WorldState,
    rng: &mut SmallRng,
) -> Result<MoveOutcome> {
    let model = scene.model;
    let (event, blips, log_ratio) = {
        let origin = Origin::current(&scene, state);
        let Some(sources) = source_distribution(&scene, &origin) else {
            return Ok(MoveOutcome::rejected_early(MoveKind::Birth));
        };
        let event = match scene.potential_events.get(sources.sample(rng)) {
            Some(p) => p.triangulation.sample(model, rng)?,
            None => model.sample_event(rng),
        };
        let Some(choices) = blip_choices(&scene, &origin, &event) else {
            return Ok(MoveOutcome::rejected_early(MoveKind::Birth));
        };
        let blips: Vec<BlipId> = choices
            .iter()
            .map(|c| c.candidates[c.distribution.sample(rng)])
            .collect();
        let log_ratio = birth_ratio_with(
            &scene,
            &origin,
            &sources,
            Some(choices.as_slice()),
            &event,
            &blips,
        )?;
        (event, blips, log_ratio)
    };

    let accepted = metropolis_accept(rng, MoveKind::Birth, log_ratio)?;
    if accepted {
        let id = state.insert_event(event, blips)?;
        debug!(
            %id,
            time = event.time,
            location = event.location,
            magnitude = event.magnitude,
            log_ratio,
            "birth accepted"
        );
    }
    Ok(MoveOutcome::evaluated(MoveKind::Birth, accepted, log_ratio))
}

fn propose_death(
    scene: Scene<'_>,
    state: &mut WorldState,
    rng: &mut SmallRng,
) -> Result<MoveOutcome> {
    let ids = state.event_ids();
    if ids.is_empty() {
        return Ok(MoveOutcome::rejected_early(MoveKind::Death));
    }
    let index = if scene.settings.biased_death {
        let free_without: Vec<usize> = FreeView::current(state)
            .free_counts(scene.observations)
            .into_iter()
            .map(|k| k + 1)
            .collect();
        let mut weights = Vec::with_capacity(ids.len());
        for &id in &ids {
            let event = state.event(id).ok_or_else(|| {
                Error::InconsistentAssociation(format!("{id} is not in the world"))
            })?;
            weights.push(-birth_log_delta(
                scene.model,
                scene.observations,
                ids.len() - 1,
                &free_without,
                event,
                claimed_blips(state, id)?,
            ));
        }
        match Categorical::from_log_weights(&weights) {
            Some(selection) => selection.sample(rng),
            None => return Ok(MoveOutcome::rejected_early(MoveKind::Death)),
        }
    } else {
        rng.gen_range(0..ids.len())
    };
    let id = ids[index];

    let log_ratio = death_ratio(&scene, state, id)?;
    let accepted = metropolis_accept(rng, MoveKind::Death, log_ratio)?;
    if accepted {
        state
            .remove_event(id)
            .ok_or_else(|| Error::InconsistentAssociation(format!("{id} vanished")))?;
        debug!(%id, log_ratio, "death accepted");
    }
    Ok(MoveOutcome::evaluated(MoveKind::Death, accepted, log_ratio))
}

/// One birth-or-death attempt. Deaths are only attempted when events exist.
pub fn birth_death(ctx: &mut InferenceContext) -> Result<MoveOutcome> {
    let outcome = {
        let (scene, state, rng) = ctx.split();
        let u: f64 = rng.gen();
        if u < scene.settings.death_probability(state.n_events()) {
            propose_death(scene, state, rng)?
        } else {
            propose_birth(scene, state, rng)?
        }
    };
    Ok(record(ctx, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::MoveSettings;
    use crate::density::world_log_probability;
    use crate::triangulation::triangulate_column;
    use crate::world::{Blip, Model, Observations};
    use approx::assert_abs_diff_eq;

    fn clean_context(biased_death: bool) -> (InferenceContext, Event, Vec<BlipId>) {
        let config = Config {
            biased_death,
            ..Config::default()
        };
        let model = Model::inference(&config);
        let event = Event::new(400.0, 60.0, 4.0);
        let mut blips: Vec<Blip> = (0..model.n_detectors())
            .map(|d| Blip {
                time: model.predicted_time(&event, d) + 0.3,
                magnitude: model.predicted_magnitude(&event, d) - 0.05,
                detector: d,
            })
            .collect();
        blips.push(Blip {
            time: 700.0,
            magnitude: 0.4,
            detector: 2,
        });
        let obs = Observations::new(blips, model.n_detectors());
        let tri = triangulate_column(&model, &obs, &[0, 1, 2, 3, 4], 3).unwrap();
        let potential = vec![crate::triangulation::PotentialEvent {
            triangulation: tri,
            score: 10.0,
        }];
        let ctx = InferenceContext::new(model, obs, potential, MoveSettings::from(&config), 5);
        (ctx, event, vec![0, 1, 2, 3, 4])
    }

    #[test]
    fn death_reverses_birth_exactly() {
        for biased in [false, true] {
            let (mut ctx, event, blips) = clean_context(biased);
            let birth = birth_log_acceptance(&ctx, &event, &blips).unwrap();
            assert!(birth.is_finite());
            let id = ctx.state.insert_event(event, blips).unwrap();
            let death = death_log_acceptance(&ctx, id).unwrap();
            assert_abs_diff_eq!(birth, -death, epsilon = 1e-9);
        }
    }

    #[test]
    fn birth_of_a_clean_event_is_favoured() {
        let (ctx, event, blips) = clean_context(false);
        assert!(birth_log_acceptance(&ctx, &event, &blips).unwrap() > 0.0);
    }

    #[test]
    fn accepted_births_keep_the_world_consistent() {
        let (mut ctx, _, _) = clean_context(false);
        for _ in 0..50 {
            birth_death(&mut ctx).unwrap();
            world_log_probability(&ctx.model, &ctx.observations, &ctx.state).unwrap();
        }
        let birth = ctx.counters.get(MoveKind::Birth);
        let death = ctx.counters.get(MoveKind::Death);
        assert_eq!(birth.proposed + death.proposed, 50);
        assert!(birth.accepted > 0);
    }

    #[test]
    fn death_is_never_attempted_on_an_empty_world() {
        let (mut ctx, _, _) = clean_context(false);
        ctx.settings.death_probability = 0.99;
        let outcome = birth_death(&mut ctx).unwrap();
        assert_eq!(outcome.kind, MoveKind::Birth);
    }

    #[test]
    fn a_blip_noise_cannot_explain_is_claimed_by_the_first_birth() {
        let config = Config::default();
        let model = Model::inference(&config);
        let event = Event::new(400.0, 100.0, 3.0);
        let mut blips: Vec<Blip> = (0..model.n_detectors())
            .map(|d| Blip {
                time: model.predicted_time(&event, d),
                magnitude: model.predicted_magnitude(&event, d),
                detector: d,
            })
            .collect();
        // The far detector sees the event below the noise magnitude floor.
        blips[0].magnitude = -0.03;
        blips.push(Blip {
            time: 250.0,
            magnitude: 0.7,
            detector: 0,
        });
        let obs = Observations::new(blips, model.n_detectors());
        assert_eq!(model.noise_blip_log_density(obs.blip(0)), f64::NEG_INFINITY);
        let mut ctx =
            InferenceContext::new(model, obs, Vec::new(), MoveSettings::from(&config), 3);
        let (empty, _) = ctx.log_probability().unwrap();
        assert_eq!(empty, f64::NEG_INFINITY);

        let outcome = birth_death(&mut ctx).unwrap();
        assert!(outcome.accepted, "{outcome:?}");
        assert_eq!(outcome.log_ratio, Some(f64::INFINITY));
        let id = ctx.state.event_ids()[0];
        assert_eq!(ctx.state.blips_of(id).unwrap()[0], 0);
        let (after, _) = ctx.log_probability().unwrap();
        assert!(after.is_finite());
        assert_eq!(death_log_acceptance(&ctx, id).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn biased_death_of_an_unknown_event_is_an_error() {
        let (ctx, _, _) = clean_context(true);
        let err = death_log_acceptance(&ctx, EventId(7)).unwrap_err();
        assert!(matches!(err, Error::InconsistentAssociation(_)), "{err}");
    }
}
