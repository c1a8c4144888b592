//! Redraws an event's parameters from the triangulation of its own blips.
//!
//! The triangulation is only an approximation to the event's conditional posterior,
//! so the draw is an independence proposal corrected by the usual ratio.

use rand::rngs::SmallRng;

use super::{metropolis_accept, record, MoveKind, MoveOutcome};
use crate::context::{InferenceContext, Scene};
use crate::density::claims_log_change;
use crate::error::{Error, Result};
use crate::triangulation::{triangulate_column, Triangulation};
use crate::world::{BlipId, Event, EventId, WorldState};

fn current(state: &WorldState, id: EventId) -> Result<(Event, &[BlipId])> {
    let missing = || Error::InconsistentAssociation(format!("{id} is not in the world"));
    let event = *state.event(id).ok_or_else(missing)?;
    let blips = state.blips_of(id).ok_or_else(missing)?;
    Ok((event, blips))
}

/// Triangulation of the event's own blips within its column, if it has support.
fn own_triangulation(
    scene: &Scene<'_>,
    event: &Event,
    blips: &[BlipId],
) -> Result<Option<Triangulation>> {
    let model = scene.model;
    let tri = triangulate_column(model, scene.observations, blips, model.column(event.location))?;
    Ok(tri.is_feasible(model).then_some(tri))
}

/// Log acceptance ratio of moving event `id` to `proposed`, keeping its blips.
///
/// `None` when `proposed` leaves the event's column, which the proposal never does.
pub(crate) fn resample_log_ratio(
    scene: &Scene<'_>,
    state: &WorldState,
    id: EventId,
    proposed: &Event,
) -> Result<Option<f64>> {
    let model = scene.model;
    let (event, blips) = current(state, id)?;
    if model.column(proposed.location) != model.column(event.location) {
        return Ok(None);
    }
    let Some(tri) = own_triangulation(scene, &event, blips)? else {
        return Ok(None);
    };
    let target = claims_log_change(
        model,
        scene.observations,
        &[(&event, blips)],
        &[(proposed, blips)],
    );
    Ok(Some(
        target + tri.log_density(model, &event) - tri.log_density(model, proposed),
    ))
}

fn propose(
    scene: Scene<'_>,
    state: &mut WorldState,
    rng: &mut SmallRng,
    id: EventId,
) -> Result<MoveOutcome> {
    let (event, blips) = current(state, id)?;
    let Some(tri) = own_triangulation(&scene, &event, blips)? else {
        return Ok(MoveOutcome::rejected_early(MoveKind::Resample));
    };
    let proposed = tri.sample(scene.model, rng)?;
    let Some(log_ratio) = resample_log_ratio(&scene, state, id, &proposed)? else {
        return Ok(MoveOutcome::rejected_early(MoveKind::Resample));
    };
    let accepted = metropolis_accept(rng, MoveKind::Resample, log_ratio)?;
    if accepted {
        state.replace_event(id, proposed)?;
    }
    Ok(MoveOutcome::evaluated(MoveKind::Resample, accepted, log_ratio))
}

/// One resample attempt for event `id`.
pub fn resample_event(ctx: &mut InferenceContext, id: EventId) -> Result<MoveOutcome> {
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
    use crate::density::world_log_probability;
    use crate::world::{Blip, Model, Observations};
    use approx::assert_abs_diff_eq;

    #[test]
    fn resample_pulls_a_displaced_event_home() {
        let config = Config::default();
        let model = Model::inference(&config);
        let truth = Event::new(400.0, 60.0, 4.0);
        let blips: Vec<Blip> = (0..model.n_detectors())
            .map(|d| Blip {
                time: model.predicted_time(&truth, d),
                magnitude: model.predicted_magnitude(&truth, d),
                detector: d,
            })
            .collect();
        let obs = Observations::new(blips, model.n_detectors());
        let mut state = WorldState::empty(obs.len());
        let id = state
            .insert_event(Event::new(403.0, 58.0, 4.2), vec![0, 1, 2, 3, 4])
            .unwrap();
        let mut ctx =
            InferenceContext::new(model, obs, Vec::new(), MoveSettings::from(&config), 11)
                .with_state(state);

        let (before, _) = ctx.log_probability().unwrap();
        for _ in 0..20 {
            resample_event(&mut ctx, id).unwrap();
            world_log_probability(&ctx.model, &ctx.observations, &ctx.state).unwrap();
        }
        let (after, _) = ctx.log_probability().unwrap();
        assert!(after > before);
        let event = ctx.state.event(id).unwrap();
        assert!((event.location - 60.0).abs() < 4.0, "{event:?}");
        assert_eq!(ctx.counters.get(MoveKind::Resample).proposed, 20);
    }

    #[test]
    fn unknown_event_is_an_error() {
        let config = Config::default();
        let model = Model::inference(&config);
        let obs = Observations::new(Vec::new(), model.n_detectors());
        let mut ctx = InferenceContext::new(model, obs, Vec::new(), MoveSettings::from(&config), 1);
        assert!(resample_event(&mut ctx, EventId(3)).is_err());
    }

    #[test]
    fn moving_back_reverses_the_ratio() {
        let config = Config::default();
        let model = Model::inference(&config);
        let truth = Event::new(400.0, 60.0, 4.0);
        let blips: Vec<Blip> = (0..model.n_detectors())
            .map(|d| Blip {
                time: model.predicted_time(&truth, d) + 0.5 * d as f64 - 1.0,
                magnitude: model.predicted_magnitude(&truth, d) + 0.02,
                detector: d,
            })
            .collect();
        let obs = Observations::new(blips, model.n_detectors());
        let mut state = WorldState::empty(obs.len());
        let old = Event::new(401.0, 59.0, 4.1);
        let id = state.insert_event(old, vec![0, 1, 2, 3, 4]).unwrap();
        let mut ctx =
            InferenceContext::new(model, obs, Vec::new(), MoveSettings::from(&config), 2)
                .with_state(state);

        let proposed = Event::new(399.0, 61.5, 3.95);
        let forward = resample_log_ratio(&ctx.scene(), &ctx.state, id, &proposed)
            .unwrap()
            .unwrap();
        ctx.state.replace_event(id, proposed).unwrap();
        let reverse = resample_log_ratio(&ctx.scene(), &ctx.state, id, &old)
            .unwrap()
            .unwrap();
        assert!(forward.is_finite());
        assert_abs_diff_eq!(forward, -reverse, epsilon = 1e-9);

        // Leaving the column is not a resample.
        let elsewhere = Event::new(399.0, 20.0, 3.95);
        assert_eq!(
            resample_log_ratio(&ctx.scene(), &ctx.state, id, &elsewhere).unwrap(),
            None
        );
    }
}
