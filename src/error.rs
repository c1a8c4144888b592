//! Error type shared by every stage of the sampler.
//!
//! Every variant except the configuration ones marks a defect in the chain's
//! bookkeeping or numerics. They are propagated to the caller and must never be
//! absorbed into a `-inf` log-probability.

use thiserror::Error;

use crate::moves::MoveKind;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a triangulation could not be formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TriangulationError {
    /// No blip was given on the left of the hypothesised location.
    #[error("left blip set is empty")]
    EmptyLeft,
    /// No blip was given on the right of the hypothesised location.
    #[error("right blip set is empty")]
    EmptyRight,
    /// The left boundary detector is not strictly left of the right boundary detector.
    #[error("boundary detectors out of order: left {left} is not before right {right}")]
    InvertedDetectors { left: usize, right: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    /// An event does not own exactly one blip per detector, or a blip is owned twice.
    #[error("inconsistent association: {0}")]
    InconsistentAssociation(String),

    /// A Metropolis–Hastings acceptance probability fell outside `[0, 1]`.
    #[error("{kind} move produced acceptance probability {probability} outside [0, 1]")]
    InvalidAcceptance { kind: MoveKind, probability: f64 },

    /// The truncated-normal rejection sampler ran out of attempts.
    #[error(
        "rejection sampler gave up after {attempts} attempts \
         (mean {mean}, std {std_dev}, bounds [{lower}, {upper}])"
    )]
    RejectionBudgetExhausted {
        attempts: usize,
        mean: f64,
        std_dev: f64,
        lower: f64,
        upper: f64,
    },

    #[error("degenerate triangulation: {0}")]
    Triangulation(#[from] TriangulationError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
