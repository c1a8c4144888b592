/*!
# Move Set

Atomic Metropolis–Hastings transitions of the world state. Every move reads the
current [`InferenceContext`](crate::context::InferenceContext), proposes a change,
computes

```text
log a = log(target ratio) + log(reverse proposal / forward proposal)
```

and either commits the whole change or leaves the state untouched.

- [`birth_death`]: adds or removes an event with its full blip set.
- [`resample`]: redraws an event's parameters from its triangulation.
- [`swap`]: exchanges one side's blips between two events in the same column.
- [`reselect`]: redraws which blips an event claims, then its parameters.
*/

use std::fmt;

use rand::Rng;

use crate::context::InferenceContext;
use crate::error::{Error, Result};
use crate::world::{BlipId, Observations, WorldState};

pub mod birth_death;
pub mod reselect;
pub mod resample;
pub mod swap;

pub use birth_death::{birth_death, birth_log_acceptance, death_log_acceptance};
pub use reselect::reselect_blips;
pub use resample::resample_event;
pub use swap::{swap_event_pair, SwapSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MoveKind {
    Birth,
    Death,
    Resample,
    Swap,
    Reselect,
}

impl MoveKind {
    pub const ALL: [MoveKind; 5] = [
        MoveKind::Birth,
        MoveKind::Death,
        MoveKind::Resample,
        MoveKind::Swap,
        MoveKind::Reselect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MoveKind::Birth => "birth",
            MoveKind::Death => "death",
            MoveKind::Resample => "resample",
            MoveKind::Swap => "swap",
            MoveKind::Reselect => "reselect",
        }
    }
}

impl fmt::Display for MoveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What happened to one proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOutcome {
    pub kind: MoveKind,
    pub accepted: bool,
    /// Log acceptance ratio, absent when the proposal was rejected before evaluation.
    pub log_ratio: Option<f64>,
}

impl MoveOutcome {
    pub(crate) fn evaluated(kind: MoveKind, accepted: bool, log_ratio: f64) -> Self {
        Self {
            kind,
            accepted,
            log_ratio: Some(log_ratio),
        }
    }

    pub(crate) fn rejected_early(kind: MoveKind) -> Self {
        Self {
            kind,
            accepted: false,
            log_ratio: None,
        }
    }
}

pub(crate) fn record(ctx: &mut InferenceContext, outcome: MoveOutcome) -> MoveOutcome {
    ctx.counters.record(outcome.kind, outcome.accepted);
    outcome
}

/// Metropolis–Hastings acceptance test. A non-negative log ratio always accepts.
pub fn metropolis_accept<R: Rng + ?Sized>(
    rng: &mut R,
    kind: MoveKind,
    log_ratio: f64,
) -> Result<bool> {
    let probability = if log_ratio >= 0.0 {
        1.0
    } else {
        log_ratio.exp()
    };
    if !(0.0..=1.0).contains(&probability) {
        return Err(Error::InvalidAcceptance { kind, probability });
    }
    if probability >= 1.0 {
        return Ok(true);
    }
    Ok(rng.gen::<f64>() < probability)
}

/// Which blips count as noise, optionally pretending one event has been removed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeView<'a> {
    state: &'a WorldState,
    released: &'a [BlipId],
}

impl<'a> FreeView<'a> {
    pub(crate) fn current(state: &'a WorldState) -> Self {
        Self {
            state,
            released: &[],
        }
    }

    /// The state as it would be after deleting the event that claims `released`.
    pub(crate) fn releasing(state: &'a WorldState, released: &'a [BlipId]) -> Self {
        Self { state, released }
    }

    pub(crate) fn is_free(&self, blip: BlipId) -> bool {
        self.state.association().is_free(blip) || self.released.contains(&blip)
    }

    pub(crate) fn free_counts(&self, observations: &Observations) -> Vec<usize> {
        observations
            .by_detector
            .iter()
            .map(|stream| stream.iter().filter(|&&b| self.is_free(b)).count())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn non_negative_log_ratio_always_accepts() {
        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..100 {
            assert!(metropolis_accept(&mut rng, MoveKind::Birth, 0.0).unwrap());
            assert!(metropolis_accept(&mut rng, MoveKind::Birth, f64::INFINITY).unwrap());
        }
    }

    #[test]
    fn impossible_proposals_never_accept() {
        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..100 {
            assert!(!metropolis_accept(&mut rng, MoveKind::Death, f64::NEG_INFINITY).unwrap());
        }
    }

    #[test]
    fn nan_ratio_is_fatal() {
        let mut rng = SmallRng::seed_from_u64(0);
        let err = metropolis_accept(&mut rng, MoveKind::Swap, f64::NAN).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidAcceptance {
                kind: MoveKind::Swap,
                ..
            }
        ));
    }

    #[test]
    fn acceptance_rate_matches_probability() {
        let mut rng = SmallRng::seed_from_u64(17);
        let n = 20_000;
        let accepted = (0..n)
            .filter(|_| metropolis_accept(&mut rng, MoveKind::Resample, 0.25f64.ln()).unwrap())
            .count();
        let rate = accepted as f64 / n as f64;
        assert!((rate - 0.25).abs() < 0.02, "acceptance rate {rate}");
    }
}
