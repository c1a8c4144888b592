/*!
# Run Configuration

All knobs of a run live in [`Config`]: the physical layout (detectors, time and
space windows), the generative model, the inference-time model, the potential
event proposer thresholds, the move set tuning and the driver settings.

Every field has a default, so a YAML file only needs to name what it changes.

```rust
use blip_mcmc::config::Config;

let config = Config::from_yaml_str("event_intensity: 3.0\niterations: 50\n").unwrap();
assert_eq!(config.event_intensity, 3.0);
assert_eq!(config.iterations, 50);
assert_eq!(config.space_range(), (0.0, 100.0));
```
*/

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// YAML-configurable parameters governing a synthetic world and an inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Detector positions on the line, strictly increasing.
    pub detectors: Vec<f64>,
    /// Window in which events may occur.
    pub time_range: (f64, f64),
    /// Window of event locations. Defaults to the detector span.
    pub space_range: Option<(f64, f64)>,

    /// Expected number of events in the time window.
    pub event_intensity: f64,
    /// Smallest magnitude an event can have.
    pub min_magnitude: f64,
    /// Rate of the Gutenberg–Richter magnitude law.
    pub magnitude_rate: f64,
    /// Magnitude lost per unit of distance travelled. Defaults to the largest rate
    /// that keeps a minimal event one std-dev above the noise floor across the
    /// event window.
    pub decay_rate: Option<f64>,

    /// Expected noise blips per detector and unit of time in the event window.
    pub noise_intensity: f64,
    /// Floor of the noise magnitude distribution.
    pub noise_min_magnitude: f64,
    /// Mean excess of a noise magnitude over its floor.
    pub noise_magnitude_scale: f64,

    /// Arrival-time noise used to generate blips.
    pub time_std: f64,
    /// Magnitude noise used to generate blips.
    pub magnitude_std: f64,
    /// Arrival-time noise assumed by inference. Defaults to `time_std`.
    pub inference_time_std: Option<f64>,
    /// Magnitude noise assumed by inference. Defaults to `magnitude_std`.
    pub inference_magnitude_std: Option<f64>,

    /// Blips below this magnitude are not used to seed potential events.
    pub magnitude_threshold: f64,
    /// Minimum best-match log-likelihood ratio of a first-pass candidate.
    pub first_llr_threshold: f64,
    /// Minimum world log-likelihood ratio of a refined candidate.
    pub second_llr_threshold: f64,
    /// Standard deviations of slack allowed when range-filtering candidates.
    pub range_slack_stds: f64,
    /// Largest detector index gap of a triangulated pair.
    pub detector_pair_span: usize,

    /// Probability of attempting a death rather than a birth.
    pub death_probability: f64,
    /// Select death candidates by how little the world loses without them.
    pub biased_death: bool,
    /// Log selection weight of drawing a birth from the prior.
    pub prior_birth_log_weight: f64,

    /// Multiple of a true event's triangulation std-dev within which a guess matches.
    pub match_tolerance: f64,

    /// Number of scans to run.
    pub iterations: usize,
    /// Record statistics every `report_stride` scans.
    pub report_stride: usize,
    /// Keep a snapshot of the world after every scan.
    pub keep_snapshots: bool,
    /// Seed potential events from the ground truth instead of the proposer.
    pub cheat: bool,
    pub seed: u64,
    /// Show a progress bar while sampling.
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detectors: vec![0.0, 30.0, 40.0, 80.0, 100.0],
            time_range: (0.0, 1000.0),
            space_range: None,
            event_intensity: 10.0,
            min_magnitude: 3.0,
            magnitude_rate: std::f64::consts::LN_10,
            decay_rate: None,
            noise_intensity: 0.5,
            noise_min_magnitude: 0.0,
            noise_magnitude_scale: std::f64::consts::LOG10_E,
            time_std: 2.0,
            magnitude_std: 0.1,
            inference_time_std: None,
            inference_magnitude_std: None,
            magnitude_threshold: 0.5,
            first_llr_threshold: 10.0,
            second_llr_threshold: 20.0,
            range_slack_stds: 3.0,
            detector_pair_span: 2,
            death_probability: 0.5,
            biased_death: false,
            prior_birth_log_weight: 0.0,
            match_tolerance: 3.0,
            iterations: 200,
            report_stride: 10,
            keep_snapshots: true,
            cheat: false,
            seed: 137,
            progress: false,
        }
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Location window of events; the detector span unless configured.
    pub fn space_range(&self) -> (f64, f64) {
        self.space_range.unwrap_or_else(|| {
            let first = self.detectors.first().copied().unwrap_or(0.0);
            let last = self.detectors.last().copied().unwrap_or(0.0);
            (first, last)
        })
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate.unwrap_or_else(|| {
            let (x0, x1) = self.space_range();
            (self.min_magnitude - self.noise_min_magnitude - self.magnitude_std) / (x1 - x0)
        })
    }

    pub fn inference_time_std(&self) -> f64 {
        self.inference_time_std.unwrap_or(self.time_std)
    }

    pub fn inference_magnitude_std(&self) -> f64 {
        self.inference_magnitude_std.unwrap_or(self.magnitude_std)
    }

    /// Rejects configurations the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.detectors.len() < 2 {
            return Err(Error::Config(format!(
                "need at least two detectors, got {}",
                self.detectors.len()
            )));
        }
        if self.detectors.iter().any(|x| !x.is_finite()) {
            return Err(Error::Config("detector positions must be finite".into()));
        }
        if self.detectors.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "detector positions must be strictly increasing".into(),
            ));
        }
        let (t0, t1) = self.time_range;
        if !(t0 < t1) {
            return Err(Error::Config(format!("empty time range [{t0}, {t1}]")));
        }
        let (x0, x1) = self.space_range();
        let first = self.detectors[0];
        let last = self.detectors[self.detectors.len() - 1];
        if !(x0 < x1) {
            return Err(Error::Config(format!("empty space range [{x0}, {x1}]")));
        }
        if x0 < first || x1 > last {
            return Err(Error::Config(format!(
                "space range [{x0}, {x1}] leaves the detector span [{first}, {last}]"
            )));
        }

        let positive = [
            ("event_intensity", self.event_intensity),
            ("magnitude_rate", self.magnitude_rate),
            ("decay_rate", self.decay_rate()),
            ("noise_intensity", self.noise_intensity),
            ("noise_magnitude_scale", self.noise_magnitude_scale),
            ("time_std", self.time_std),
            ("magnitude_std", self.magnitude_std),
            ("inference_time_std", self.inference_time_std()),
            ("inference_magnitude_std", self.inference_magnitude_std()),
            ("match_tolerance", self.match_tolerance),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(Error::Config(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }
        if !(self.death_probability > 0.0 && self.death_probability < 1.0) {
            return Err(Error::Config(format!(
                "death_probability must lie in (0, 1), got {}",
                self.death_probability
            )));
        }
        // Blips of the weakest event at the far end of the window must stay above the
        // noise floor on average, or the noise process cannot explain them.
        let weakest = self.min_magnitude - self.decay_rate() * (x1 - x0);
        if !(weakest > self.noise_min_magnitude) {
            return Err(Error::Config(format!(
                "decay_rate {} takes a magnitude {} event to {weakest} over the event \
                 window, not above the noise floor {}",
                self.decay_rate(),
                self.min_magnitude,
                self.noise_min_magnitude
            )));
        }
        if self.detector_pair_span == 0 {
            return Err(Error::Config("detector_pair_span must be at least 1".into()));
        }
        if self.report_stride == 0 {
            return Err(Error::Config("report_stride must be at least 1".into()));
        }
        Ok(())
    }
}
