//! Exchanges one side's blips between two events sharing a column.
//!
//! Two events in the same column see the same detectors on their left and on their
//! right, so handing all left (or all right) blips of one to the other keeps both
//! blip sets triangulable. Both events are then redrawn from their new
//! triangulations and the pair is accepted or rejected as one.

use std::ops::Range;

use rand::rngs::SmallRng;
use tracing::debug;

use super::{metropolis_accept, record, MoveKind, MoveOutcome};
use crate::context::{InferenceContext, Scene};
use crate::density::claims_log_change;
use crate::error::{Error, Result};
use crate::triangulation::{triangulate_column, Triangulation};
use crate::world::{BlipId, Event, EventId, Model, WorldState};

/// Arrival-time std-devs two events may be apart beyond their separation in space.
pub const SWAP_TIME_SLACK_STDS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapSide {
    Left,
    Right,
}

impl SwapSide {
    pub const BOTH: [SwapSide; 2] = [SwapSide::Left, SwapSide::Right];

    /// Detectors whose blips change hands for an event pair in `column`.
    pub fn detectors(&self, column: usize, n_detectors: usize) -> Range<usize> {
        match self {
            SwapSide::Left => 0..column,
            SwapSide::Right => column..n_detectors,
        }
    }
}

/// Whether two events may exchange blips: same column, and no further apart in time
/// than in space plus [`SWAP_TIME_SLACK_STDS`] arrival-time std-devs.
pub fn swappable(model: &Model, a: &Event, b: &Event) -> bool {
    model.column(a.location) == model.column(b.location)
        && (a.time - b.time).abs()
            <= (a.location - b.location).abs() + SWAP_TIME_SLACK_STDS * model.time_std
}

fn exchanged(own: &[BlipId], other: &[BlipId], detectors: Range<usize>) -> Vec<BlipId> {
    let mut out = own.to_vec();
    for d in detectors {
        out[d] = other[d];
    }
    out
}

/// The blip sets of both events after the exchange, with their triangulations.
struct Exchange {
    blips: [Vec<BlipId>; 2],
    triangulations: [Triangulation; 2],
}

fn exchange(
    scene: &Scene<'_>,
    column: usize,
    blips: [&[BlipId]; 2],
    side: SwapSide,
) -> Result<Option<Exchange>> {
    let model = scene.model;
    let detectors = side.detectors(column, model.n_detectors());
    let new_a = exchanged(blips[0], blips[1], detectors.clone());
    let new_b = exchanged(blips[1], blips[0], detectors);
    let tri_a = triangulate_column(model, scene.observations, &new_a, column)?;
    let tri_b = triangulate_column(model, scene.observations, &new_b, column)?;
    if !tri_a.is_feasible(model) || !tri_b.is_feasible(model) {
        return Ok(None);
    }
    Ok(Some(Exchange {
        blips: [new_a, new_b],
        triangulations: [tri_a, tri_b],
    }))
}

fn pair<'s>(
    state: &'s WorldState,
    (a, b): (EventId, EventId),
) -> Result<([Event; 2], [&'s [BlipId]; 2])> {
    let missing = |id: EventId| Error::InconsistentAssociation(format!("{id} is not in the world"));
    let event_a = *state.event(a).ok_or_else(|| missing(a))?;
    let event_b = *state.event(b).ok_or_else(|| missing(b))?;
    let blips_a = state.blips_of(a).ok_or_else(|| missing(a))?;
    let blips_b = state.blips_of(b).ok_or_else(|| missing(b))?;
    Ok(([event_a, event_b], [blips_a, blips_b]))
}

/// Log acceptance ratio of handing the `side` blips of `a` to `b` and back, with the
/// pair moving to `proposed`.
///
/// `None` when the pair is not swappable before or after the move.
pub(crate) fn swap_log_ratio(
    scene: &Scene<'_>,
    state: &WorldState,
    ids: (EventId, EventId),
    side: SwapSide,
    proposed: [Event; 2],
) -> Result<Option<f64>> {
    let model = scene.model;
    let ([event_a, event_b], blips) = pair(state, ids)?;
    if ids.0 == ids.1 || !swappable(model, &event_a, &event_b) {
        return Ok(None);
    }
    let column = model.column(event_a.location);
    // The reverse swap must be eligible from the proposed pair.
    if model.column(proposed[0].location) != column
        || !swappable(model, &proposed[0], &proposed[1])
    {
        return Ok(None);
    }
    let Some(Exchange {
        blips: new_blips,
        triangulations: new_tris,
    }) = exchange(scene, column, blips, side)?
    else {
        return Ok(None);
    };
    // Exchanging the same side again restores the old blip sets.
    let old_a = triangulate_column(model, scene.observations, blips[0], column)?;
    let old_b = triangulate_column(model, scene.observations, blips[1], column)?;

    let target = claims_log_change(
        model,
        scene.observations,
        &[(&event_a, blips[0]), (&event_b, blips[1])],
        &[
            (&proposed[0], new_blips[0].as_slice()),
            (&proposed[1], new_blips[1].as_slice()),
        ],
    );
    let reverse = old_a.log_density(model, &event_a) + old_b.log_density(model, &event_b);
    let forward = new_tris[0].log_density(model, &proposed[0])
        + new_tris[1].log_density(model, &proposed[1]);
    Ok(Some(target + reverse - forward))
}

fn propose(
    scene: Scene<'_>,
    state: &mut WorldState,
    rng: &mut SmallRng,
    (a, b): (EventId, EventId),
    side: SwapSide,
) -> Result<MoveOutcome> {
    let model = scene.model;
    let ([event_a, event_b], blips) = pair(state, (a, b))?;
    if a == b || !swappable(model, &event_a, &event_b) {
        return Ok(MoveOutcome::rejected_early(MoveKind::Swap));
    }
    let column = model.column(event_a.location);
    let Some(Exchange { triangulations, .. }) = exchange(&scene, column, blips, side)? else {
        return Ok(MoveOutcome::rejected_early(MoveKind::Swap));
    };
    let proposed = [
        triangulations[0].sample(model, rng)?,
        triangulations[1].sample(model, rng)?,
    ];
    let Some(log_ratio) = swap_log_ratio(&scene, state, (a, b), side, proposed)? else {
        return Ok(MoveOutcome::rejected_early(MoveKind::Swap));
    };

    let accepted = metropolis_accept(rng, MoveKind::Swap, log_ratio)?;
    if accepted {
        let detectors = side.detectors(column, model.n_detectors());
        state.swap_blips((a, proposed[0]), (b, proposed[1]), detectors)?;
        debug!(%a, %b, ?side, log_ratio, "swap accepted");
    }
    Ok(MoveOutcome::evaluated(MoveKind::Swap, accepted, log_ratio))
}

/// One attempt to exchange the `side` blips of events `a` and `b`.
pub fn swap_event_pair(
    ctx: &mut InferenceContext,
    a: EventId,
    b: EventId,
    side: SwapSide,
) -> Result<MoveOutcome> {
    let outcome = {
        let (scene, state, rng) = ctx.split();
        propose(scene, state, rng, (a, b), side)?
    };
    Ok(record(ctx, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::MoveSettings;
    use crate::density::world_log_probability;
    use crate::world::{Blip, Observations};
    use approx::assert_abs_diff_eq;

    /// Two events in column 3 whose left blips were handed to the wrong owner.
    fn crossed_world() -> (InferenceContext, EventId, EventId, Event, Event) {
        let config = Config::default();
        let model = Model::inference(&config);
        let first = Event::new(400.0, 55.0, 4.0);
        let second = Event::new(420.0, 70.0, 3.5);
        let mut blips = Vec::new();
        for event in [&first, &second] {
            for d in 0..model.n_detectors() {
                blips.push(Blip {
                    time: model.predicted_time(event, d),
                    magnitude: model.predicted_magnitude(event, d),
                    detector: d,
                });
            }
        }
        let obs = Observations::new(blips, model.n_detectors());
        let mut state = WorldState::empty(obs.len());
        let a = state.insert_event(first, vec![5, 6, 7, 3, 4]).unwrap();
        let b = state.insert_event(second, vec![0, 1, 2, 8, 9]).unwrap();
        let ctx = InferenceContext::new(
            model,
            obs,
            Vec::new(),
            MoveSettings::from(&config),
            21,
        )
        .with_state(state);
        (ctx, a, b, first, second)
    }

    #[test]
    fn side_ranges_split_at_the_column() {
        assert_eq!(SwapSide::Left.detectors(3, 5), 0..3);
        assert_eq!(SwapSide::Right.detectors(3, 5), 3..5);
    }

    #[test]
    fn swapping_back_the_left_side_is_accepted() {
        let (mut ctx, a, b, _, _) = crossed_world();
        let (before, _) = ctx.log_probability().unwrap();
        let outcome = swap_event_pair(&mut ctx, a, b, SwapSide::Left).unwrap();
        assert!(outcome.accepted, "{outcome:?}");
        assert_eq!(ctx.state.blips_of(a), Some(&[0, 1, 2, 3, 4][..]));
        assert_eq!(ctx.state.blips_of(b), Some(&[5, 6, 7, 8, 9][..]));
        let (after, _) = ctx.log_probability().unwrap();
        assert!(after > before);
    }

    #[test]
    fn distant_events_are_not_swapped() {
        let (mut ctx, a, b, first, _) = crossed_world();
        let far = Event::new(first.time + 500.0, first.location, first.magnitude);
        ctx.state.replace_event(a, far).unwrap();
        let snapshot = ctx.state.clone();
        let outcome = swap_event_pair(&mut ctx, a, b, SwapSide::Right).unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.log_ratio, None);
        assert_eq!(ctx.state, snapshot);
        world_log_probability(&ctx.model, &ctx.observations, &ctx.state).unwrap();
    }

    #[test]
    fn closeness_scales_with_separation_and_noise() {
        let model = Model::inference(&Config::default());
        let a = Event::new(400.0, 45.0, 4.0);
        // 30 units apart in space buys 30 time units on top of 10 std-devs (20).
        assert!(swappable(&model, &a, &Event::new(449.0, 75.0, 4.0)));
        assert!(!swappable(&model, &a, &Event::new(451.0, 75.0, 4.0)));
        assert!(swappable(&model, &a, &Event::new(419.0, 45.0, 3.0)));
        assert!(!swappable(&model, &a, &Event::new(421.0, 45.0, 3.0)));
        // Different columns never swap.
        assert!(!swappable(&model, &a, &Event::new(400.0, 35.0, 4.0)));
    }

    #[test]
    fn swapping_back_reverses_the_ratio() {
        let (mut ctx, a, b, first, _) = crossed_world();
        let old = [*ctx.state.event(a).unwrap(), *ctx.state.event(b).unwrap()];
        let proposed = [Event::new(401.0, 56.0, 3.98), Event::new(419.0, 69.0, 3.52)];
        let forward = swap_log_ratio(&ctx.scene(), &ctx.state, (a, b), SwapSide::Left, proposed)
            .unwrap()
            .unwrap();

        let detectors =
            SwapSide::Left.detectors(ctx.model.column(first.location), ctx.model.n_detectors());
        ctx.state
            .swap_blips((a, proposed[0]), (b, proposed[1]), detectors)
            .unwrap();
        let reverse = swap_log_ratio(&ctx.scene(), &ctx.state, (a, b), SwapSide::Left, old)
            .unwrap()
            .unwrap();
        assert!(forward.is_finite());
        assert_abs_diff_eq!(forward, -reverse, epsilon = 1e-6);
    }

    #[test]
    fn proposals_that_break_eligibility_are_not_evaluated() {
        let (ctx, a, b, _, _) = crossed_world();
        let apart = [Event::new(300.0, 56.0, 3.98), Event::new(419.0, 69.0, 3.52)];
        let ratio =
            swap_log_ratio(&ctx.scene(), &ctx.state, (a, b), SwapSide::Right, apart).unwrap();
        assert_eq!(ratio, None);
    }
}
