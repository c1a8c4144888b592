/*!
Redraws which blips an event claims.

On every detector the candidates are the free blips plus the event's own blip. They
are weighted by the posterior predictive of a blip on that detector under the
triangulation of the current blips: centred on the triangulated mean pushed out to
the detector, with the triangulation's own spread added to the observation noise.
Time and magnitude are treated as independent and truncation is ignored. The event
is then redrawn from the triangulation of the new blip set within its column.

The reverse move weights the same candidate set under the triangulation of the new
blips, so its probability is computed exactly.
*/

use rand::rngs::SmallRng;
use tracing::debug;

use super::{metropolis_accept, record, MoveKind, MoveOutcome};
use crate::context::{InferenceContext, Scene};
use crate::density::claims_log_change;
use crate::distributions::{normal_log_pdf, Categorical, DiscreteDistribution};
use crate::error::{Error, Result};
use crate::triangulation::{triangulate_column, Triangulation};
use crate::world::{BlipId, Event, EventId, WorldState};

fn current(state: &WorldState, id: EventId) -> Result<(Event, &[BlipId])> {
    let missing = || Error::InconsistentAssociation(format!("{id} is not in the world"));
    let event = *state.event(id).ok_or_else(missing)?;
    let blips = state.blips_of(id).ok_or_else(missing)?;
    Ok((event, blips))
}

/// Candidates of every detector: blips that are free or owned by `id`.
fn candidates(scene: &Scene<'_>, state: &WorldState, id: EventId) -> Vec<Vec<BlipId>> {
    let association = state.association();
    scene
        .observations
        .by_detector
        .iter()
        .map(|stream| {
            stream
                .iter()
                .copied()
                .filter(|&b| association.owner(b).map_or(true, |owner| owner == id))
                .collect()
        })
        .collect()
}

fn predictive_log_weight(scene: &Scene<'_>, tri: &Triangulation, blip: BlipId) -> f64 {
    let model = scene.model;
    let blip = scene.observations.blip(blip);
    let (mean, spread) = (tri.mean, tri.std_dev);
    let gap = (mean.location - model.detectors[blip.detector]).abs();
    let k = model.decay_rate;

    let var_time = model.time_std.powi(2) + spread.time.powi(2) + spread.location.powi(2);
    let var_mag = model.magnitude_std.powi(2)
        + spread.magnitude.powi(2)
        + (k * spread.location).powi(2);
    normal_log_pdf(blip.time, mean.time + gap, var_time.sqrt())
        + normal_log_pdf(blip.magnitude, mean.magnitude - k * gap, var_mag.sqrt())
}

fn selection(
    scene: &Scene<'_>,
    tri: &Triangulation,
    candidates: &[Vec<BlipId>],
) -> Option<Vec<Categorical>> {
    candidates
        .iter()
        .map(|cands| {
            let weights: Vec<f64> = cands
                .iter()
                .map(|&b| predictive_log_weight(scene, tri, b))
                .collect();
            Categorical::from_log_weights(&weights)
        })
        .collect()
}

fn selection_log_prob(
    distributions: &[Categorical],
    candidates: &[Vec<BlipId>],
    blips: &[BlipId],
) -> f64 {
    distributions
        .iter()
        .zip(candidates)
        .zip(blips)
        .map(|((dist, cands), b)| match cands.iter().position(|c| c == b) {
            Some(i) => dist.log_prob(i),
            None => f64::NEG_INFINITY,
        })
        .sum()
}

/// Log acceptance ratio of giving event `id` the blips `new_blips` and moving it to
/// `proposed`.
///
/// `None` when `proposed` leaves the event's column, the new blips have no feasible
/// triangulation, or a selection has no mass.
pub(crate) fn reselect_log_ratio(
    scene: &Scene<'_>,
    state: &WorldState,
    id: EventId,
    new_blips: &[BlipId],
    proposed: &Event,
) -> Result<Option<f64>> {
    let (model, observations) = (scene.model, scene.observations);
    let (event, blips) = current(state, id)?;
    let column = model.column(event.location);
    if model.column(proposed.location) != column {
        return Ok(None);
    }
    let old_tri = triangulate_column(model, observations, blips, column)?;
    let new_tri = triangulate_column(model, observations, new_blips, column)?;
    if !new_tri.is_feasible(model) {
        return Ok(None);
    }

    let candidates = candidates(scene, state, id);
    let (Some(forward_selection), Some(reverse_selection)) = (
        selection(scene, &old_tri, &candidates),
        selection(scene, &new_tri, &candidates),
    ) else {
        return Ok(None);
    };
    let forward = selection_log_prob(&forward_selection, &candidates, new_blips)
        + new_tri.log_density(model, proposed);
    let reverse = selection_log_prob(&reverse_selection, &candidates, blips)
        + old_tri.log_density(model, &event);
    let target = claims_log_change(
        model,
        observations,
        &[(&event, blips)],
        &[(proposed, new_blips)],
    );
    Ok(Some(target + reverse - forward))
}

fn propose(
    scene: Scene<'_>,
    state: &mut WorldState,
    rng: &mut SmallRng,
    id: EventId,
) -> Result<MoveOutcome> {
    let model = scene.model;
    let (event, blips) = current(state, id)?;
    let column = model.column(event.location);
    let old_tri = triangulate_column(model, scene.observations, blips, column)?;

    let candidates = candidates(&scene, state, id);
    let Some(forward_selection) = selection(&scene, &old_tri, &candidates) else {
        return Ok(MoveOutcome::rejected_early(MoveKind::Reselect));
    };
    let new_blips: Vec<BlipId> = forward_selection
        .iter()
        .zip(&candidates)
        .map(|(dist, cands)| cands[dist.sample(rng)])
        .collect();
    if new_blips == blips {
        return Ok(MoveOutcome::rejected_early(MoveKind::Reselect));
    }

    let new_tri = triangulate_column(model, scene.observations, &new_blips, column)?;
    if !new_tri.is_feasible(model) {
        return Ok(MoveOutcome::rejected_early(MoveKind::Reselect));
    }
    let proposed = new_tri.sample(model, rng)?;
    let Some(log_ratio) = reselect_log_ratio(&scene, state, id, &new_blips, &proposed)? else {
        return Ok(MoveOutcome::rejected_early(MoveKind::Reselect));
    };

    let accepted = metropolis_accept(rng, MoveKind::Reselect, log_ratio)?;
    if accepted {
        state.reassign(id, proposed, new_blips)?;
        debug!(%id, log_ratio, "reselect accepted");
    }
    Ok(MoveOutcome::evaluated(MoveKind::Reselect, accepted, log_ratio))
}

/// One attempt to redraw the blips of event `id`.
///
/// Drawing the blips the event already holds is reported as a rejection and leaves
/// the world untouched.
pub fn reselect_blips(ctx: &mut InferenceContext, id: EventId) -> Result<MoveOutcome> {
    let outcome = {
        let (scene, state, rng) = ctx.split();
        propose(scene, state, rng, id)?
    };
    Ok(record(ctx, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::MoveSettings;
    use crate::world::{Blip, Model, Observations};
    use approx::assert_abs_diff_eq;

    fn world_with_decoy(owned: Vec<BlipId>) -> (InferenceContext, EventId) {
        let config = Config::default();
        let model = Model::inference(&config);
        let event = Event::new(400.0, 60.0, 4.0);
        let mut blips: Vec<Blip> = (0..model.n_detectors())
            .map(|d| Blip {
                time: model.predicted_time(&event, d),
                magnitude: model.predicted_magnitude(&event, d),
                detector: d,
            })
            .collect();
        // A decoy on detector 1, close in time but off in magnitude.
        blips.push(Blip {
            time: model.predicted_time(&event, 1) + 4.0,
            magnitude: model.predicted_magnitude(&event, 1) - 0.6,
            detector: 1,
        });
        let obs = Observations::new(blips, model.n_detectors());
        let mut state = WorldState::empty(obs.len());
        let id = state.insert_event(event, owned).unwrap();
        let ctx = InferenceContext::new(model, obs, Vec::new(), MoveSettings::from(&config), 8)
            .with_state(state);
        (ctx, id)
    }

    #[test]
    fn redrawing_the_same_blips_is_a_no_op() {
        // With no decoy to choose, every draw reproduces the current blips.
        let config = Config::default();
        let model = Model::inference(&config);
        let event = Event::new(400.0, 60.0, 4.0);
        let blips: Vec<Blip> = (0..model.n_detectors())
            .map(|d| Blip {
                time: model.predicted_time(&event, d),
                magnitude: model.predicted_magnitude(&event, d),
                detector: d,
            })
            .collect();
        let obs = Observations::new(blips, model.n_detectors());
        let mut state = WorldState::empty(obs.len());
        let id = state.insert_event(event, vec![0, 1, 2, 3, 4]).unwrap();
        let mut ctx = InferenceContext::new(model, obs, Vec::new(), MoveSettings::from(&config), 8)
            .with_state(state);
        let snapshot = ctx.state.clone();
        for _ in 0..10 {
            let outcome = reselect_blips(&mut ctx, id).unwrap();
            assert!(!outcome.accepted);
            assert_eq!(outcome.log_ratio, None);
            assert_eq!(ctx.state, snapshot);
        }
        assert_eq!(ctx.counters.get(MoveKind::Reselect).proposed, 10);
        assert_eq!(ctx.counters.get(MoveKind::Reselect).accepted, 0);
    }

    #[test]
    fn decoy_is_released_for_the_true_blip() {
        let (mut ctx, id) = world_with_decoy(vec![0, 5, 2, 3, 4]);
        for _ in 0..50 {
            reselect_blips(&mut ctx, id).unwrap();
            ctx.log_probability().unwrap();
        }
        assert_eq!(ctx.state.blips_of(id), Some(&[0, 1, 2, 3, 4][..]));
    }

    #[test]
    fn reselecting_back_reverses_the_ratio() {
        let (mut ctx, id) = world_with_decoy(vec![0, 5, 2, 3, 4]);
        let old_event = *ctx.state.event(id).unwrap();
        let old_blips = ctx.state.blips_of(id).unwrap().to_vec();
        let new_blips = vec![0, 1, 2, 3, 4];
        let proposed = Event::new(400.5, 60.3, 4.02);

        let forward = reselect_log_ratio(&ctx.scene(), &ctx.state, id, &new_blips, &proposed)
            .unwrap()
            .unwrap();
        ctx.state.reassign(id, proposed, new_blips).unwrap();
        let reverse = reselect_log_ratio(&ctx.scene(), &ctx.state, id, &old_blips, &old_event)
            .unwrap()
            .unwrap();
        assert!(forward.is_finite());
        assert_abs_diff_eq!(forward, -reverse, epsilon = 1e-6);
    }

    #[test]
    fn leaving_the_column_is_not_evaluated() {
        let (ctx, id) = world_with_decoy(vec![0, 5, 2, 3, 4]);
        let elsewhere = Event::new(400.0, 20.0, 4.0);
        let ratio =
            reselect_log_ratio(&ctx.scene(), &ctx.state, id, &[0, 1, 2, 3, 4], &elsewhere).unwrap();
        assert_eq!(ratio, None);
    }
}
