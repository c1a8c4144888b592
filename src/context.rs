//! The single mutable state of an inference run.
//!
//! [`InferenceContext`] owns everything the moves read and change: the model the
//! sampler believes in, the blips, the current world, the potential events, the
//! acceptance counters and the random number generator. A fresh context is built
//! per run.

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::config::Config;
use crate::density::{free_counts, world_log_probability, LogProbComponents};
use crate::error::Result;
use crate::potential::{
    compute_potential_events, potential_events_from_truth, ProposerSettings, ProposerStats,
};
use crate::stats::AcceptanceCounters;
use crate::triangulation::PotentialEvent;
use crate::world::{Model, Observations, WorldState};

/// Tuning of the move set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveSettings {
    pub death_probability: f64,
    pub biased_death: bool,
    pub prior_birth_log_weight: f64,
}

impl From<&Config> for MoveSettings {
    fn from(config: &Config) -> Self {
        Self {
            death_probability: config.death_probability,
            biased_death: config.biased_death,
            prior_birth_log_weight: config.prior_birth_log_weight,
        }
    }
}

impl MoveSettings {
    /// Probability of attempting a death from a world with `n_events` events.
    pub fn death_probability(&self, n_events: usize) -> f64 {
        if n_events == 0 {
            0.0
        } else {
            self.death_probability
        }
    }

    pub fn birth_probability(&self, n_events: usize) -> f64 {
        1.0 - self.death_probability(n_events)
    }
}

/// The part of a context that stays fixed while moves run.
#[derive(Debug, Clone, Copy)]
pub struct Scene<'a> {
    pub model: &'a Model,
    pub observations: &'a Observations,
    pub potential_events: &'a [PotentialEvent],
    pub settings: &'a MoveSettings,
}

#[derive(Debug, Clone)]
pub struct InferenceContext {
    pub model: Model,
    pub observations: Observations,
    pub state: WorldState,
    pub potential_events: Vec<PotentialEvent>,
    /// Stage counts of the proposer, when it ran.
    pub proposer_stats: Option<ProposerStats>,
    pub settings: MoveSettings,
    pub counters: AcceptanceCounters,
    pub rng: SmallRng,
}

impl InferenceContext {
    /// A context starting from the empty world.
    pub fn new(
        model: Model,
        observations: Observations,
        potential_events: Vec<PotentialEvent>,
        settings: MoveSettings,
        seed: u64,
    ) -> Self {
        let state = WorldState::empty(observations.len());
        Self {
            model,
            observations,
            state,
            potential_events,
            proposer_stats: None,
            settings,
            counters: AcceptanceCounters::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Validates `config`, then builds the inference model and potential events for
    /// `observations`.
    ///
    /// With `config.cheat` set and `truth` given, potential events come from the
    /// true events instead of the proposer.
    pub fn from_config(
        config: &Config,
        observations: Observations,
        truth: Option<&WorldState>,
    ) -> Result<Self> {
        config.validate()?;
        let model = Model::inference(config);
        let (potential_events, proposer_stats) = match truth {
            Some(truth) if config.cheat => {
                (potential_events_from_truth(&model, &observations, truth)?, None)
            }
            _ => {
                let (events, stats) =
                    compute_potential_events(&model, &observations, &ProposerSettings::from(config))?;
                (events, Some(stats))
            }
        };
        let mut ctx = Self::new(
            model,
            observations,
            potential_events,
            MoveSettings::from(config),
            config.seed,
        );
        ctx.proposer_stats = proposer_stats;
        Ok(ctx)
    }

    /// Replaces the current world, e.g. to start a chain from a known state.
    pub fn with_state(mut self, state: WorldState) -> Self {
        self.state = state;
        self
    }

    pub fn scene(&self) -> Scene<'_> {
        Scene {
            model: &self.model,
            observations: &self.observations,
            potential_events: &self.potential_events,
            settings: &self.settings,
        }
    }

    /// Borrows the fixed scene, the world and the generator at the same time.
    pub fn split(&mut self) -> (Scene<'_>, &mut WorldState, &mut SmallRng) {
        let scene = Scene {
            model: &self.model,
            observations: &self.observations,
            potential_events: &self.potential_events,
            settings: &self.settings,
        };
        (scene, &mut self.state, &mut self.rng)
    }

    /// Validated log-probability of the current world.
    pub fn log_probability(&self) -> Result<(f64, LogProbComponents)> {
        world_log_probability(&self.model, &self.observations, &self.state)
    }

    pub fn free_counts(&self) -> Vec<usize> {
        free_counts(&self.observations, &self.state)
    }
}
