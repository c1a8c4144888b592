//! Precision, recall and F1 of an inferred world against the truth.
//!
//! Two granularities are scored:
//! - events: a guess matches a true event when both its time and its location lie
//!   within `tolerance` triangulation std-devs of the true event, each true and each
//!   guessed event matching at most once;
//! - association: the relation "these two blips come from the same event". Blips
//!   left as noise belong to no event, so a pair of noise blips is never a guess.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::triangulation::triangulate_column;
use crate::world::{Association, EventId, Model, Observations, WorldState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Scores {
    /// Scores from a match count. An empty guess has full precision, an empty truth
    /// full recall.
    pub fn from_counts(matched: usize, n_guessed: usize, n_true: usize) -> Self {
        let precision = if n_guessed == 0 {
            1.0
        } else {
            matched as f64 / n_guessed as f64
        };
        let recall = if n_true == 0 {
            1.0
        } else {
            matched as f64 / n_true as f64
        };
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        Self {
            precision,
            recall,
            f1,
        }
    }
}

/// Event-level scores with greedy one-to-one matching in true-event order.
pub fn event_scores(
    model: &Model,
    observations: &Observations,
    truth: &WorldState,
    guess: &WorldState,
    tolerance: f64,
) -> Result<Scores> {
    let guesses: Vec<_> = guess.events().map(|(_, e)| *e).collect();
    let mut taken = vec![false; guesses.len()];
    let mut matched = 0;
    for (id, event) in truth.events() {
        let blips = truth.blips_of(id).ok_or_else(|| {
            Error::InconsistentAssociation(format!("true event {id} has no blip list"))
        })?;
        let tri = triangulate_column(model, observations, blips, model.column(event.location))?;
        let (time_tol, location_tol) = (
            tolerance * tri.std_dev.time,
            tolerance * tri.std_dev.location,
        );
        let best = guesses
            .iter()
            .enumerate()
            .filter(|(i, g)| {
                !taken[*i]
                    && (g.time - event.time).abs() <= time_tol
                    && (g.location - event.location).abs() <= location_tol
            })
            .map(|(i, g)| {
                let dt = (g.time - event.time) / tri.std_dev.time;
                let dx = (g.location - event.location) / tri.std_dev.location;
                (i, dt * dt + dx * dx)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((i, _)) = best {
            taken[i] = true;
            matched += 1;
        }
    }
    Ok(Scores::from_counts(matched, guesses.len(), truth.n_events()))
}

fn pairs(k: usize) -> usize {
    k * k.saturating_sub(1) / 2
}

/// Pairwise same-event scores over associated blips.
pub fn association_scores(truth: &Association, guess: &Association) -> Scores {
    let true_pairs: usize = truth.iter_claims().map(|(_, b)| pairs(b.len())).sum();
    let mut guessed_pairs = 0;
    let mut matched = 0;
    for (_, blips) in guess.iter_claims() {
        guessed_pairs += pairs(blips.len());
        let mut by_true_owner: BTreeMap<EventId, usize> = BTreeMap::new();
        for owner in blips.iter().filter_map(|&b| truth.owner(b)) {
            *by_true_owner.entry(owner).or_default() += 1;
        }
        matched += by_true_owner.values().map(|&k| pairs(k)).sum::<usize>();
    }
    Scores::from_counts(matched, guessed_pairs, true_pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::world::{sample_world, Event};
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn empty_sets_score_fully() {
        let s = Scores::from_counts(0, 0, 0);
        assert_eq!((s.precision, s.recall, s.f1), (1.0, 1.0, 1.0));
        let s = Scores::from_counts(0, 3, 2);
        assert_eq!(s.f1, 0.0);
    }

    #[test]
    fn truth_scores_perfectly_against_itself() {
        let config = Config::default();
        let mut rng = SmallRng::seed_from_u64(12);
        let world = sample_world(&Model::generative(&config), &mut rng).unwrap();
        let model = Model::inference(&config);
        let s = event_scores(&model, &world.observations, &world.truth, &world.truth, 3.0).unwrap();
        assert_eq!((s.precision, s.recall, s.f1), (1.0, 1.0, 1.0));
        let a = association_scores(world.truth.association(), world.truth.association());
        assert_eq!((a.precision, a.recall, a.f1), (1.0, 1.0, 1.0));
    }

    #[test]
    fn half_right_association() {
        let mut truth = Association::new(6);
        truth.claim(EventId(0), vec![0, 1, 2]).unwrap();
        let mut guess = Association::new(6);
        // One true pair (0, 1) out of three guessed pairs; blips 3..6 are noise.
        guess.claim(EventId(0), vec![0, 1, 3]).unwrap();
        let s = association_scores(&truth, &guess);
        assert_abs_diff_eq!(s.precision, 1.0 / 3.0);
        assert_abs_diff_eq!(s.recall, 1.0 / 3.0);
    }

    #[test]
    fn far_guess_does_not_match() {
        let config = Config::default();
        let model = Model::inference(&config);
        let event = Event::new(400.0, 60.0, 4.0);
        let blips: Vec<_> = (0..model.n_detectors())
            .map(|d| crate::world::Blip {
                time: model.predicted_time(&event, d),
                magnitude: model.predicted_magnitude(&event, d),
                detector: d,
            })
            .collect();
        let obs = Observations::new(blips, model.n_detectors());
        let mut truth = WorldState::empty(obs.len());
        truth.insert_event(event, vec![0, 1, 2, 3, 4]).unwrap();
        let mut guess = WorldState::empty(obs.len());
        guess
            .insert_event(Event::new(430.0, 60.0, 4.0), vec![0, 1, 2, 3, 4])
            .unwrap();
        let s = event_scores(&model, &obs, &truth, &guess, 3.0).unwrap();
        assert_eq!(s.f1, 0.0);
        let s = association_scores(truth.association(), guess.association());
        assert_eq!(s.f1, 1.0);
    }
}
