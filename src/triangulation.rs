/*!
# Triangulation

Closed-form Gaussian approximation to the posterior of an event given blips seen on
both sides of it.

Every blip left of the event is projected back onto the nearest left detector with the
travel-time and decay laws, and likewise on the right. Averaging each side yields two
pseudo-observations `(tau_l, mu_l)` and `(tau_r, mu_r)` with

```text
tau_l = t + (x - x_l)        mu_l = m - k (x - x_l)
tau_r = t + (x_r - x)        mu_r = m - k (x_r - x)
```

Sums of the two sides pin down `t` and `m`; differences give two independent
estimates of `x` (one from timing, one from magnitude) which are combined by inverse
variance weighting.
*/

use rand::Rng;

use crate::distributions::TruncatedNormal;
use crate::error::{Result, TriangulationError};
use crate::world::{BlipId, Event, Model, Observations};

/// Gaussian summary of where an event could be.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangulation {
    pub mean: Event,
    /// Per-axis standard deviations, stored in the same `(time, location, magnitude)` layout.
    pub std_dev: Event,
    /// Positions of the two boundary detectors.
    pub x_range: (f64, f64),
}

/// A triangulated candidate together with its likelihood-ratio score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PotentialEvent {
    pub triangulation: Triangulation,
    pub score: f64,
}

impl Triangulation {
    /// Location interval the event may occupy, within the event window.
    pub fn location_bounds(&self, model: &Model) -> (f64, f64) {
        (
            self.x_range.0.max(model.space_range.0),
            self.x_range.1.min(model.space_range.1),
        )
    }

    pub fn is_feasible(&self, model: &Model) -> bool {
        let (lo, hi) = self.location_bounds(model);
        lo < hi
    }

    /// Independent truncated normals over time, location and magnitude, restricted to
    /// the prior's support and the boundary detectors.
    pub fn proposal(&self, model: &Model) -> [TruncatedNormal; 3] {
        let (x_lo, x_hi) = self.location_bounds(model);
        [
            TruncatedNormal::new(
                self.mean.time,
                self.std_dev.time,
                model.time_range.0,
                model.time_range.1,
            ),
            TruncatedNormal::new(self.mean.location, self.std_dev.location, x_lo, x_hi),
            TruncatedNormal::new(
                self.mean.magnitude,
                self.std_dev.magnitude,
                model.min_magnitude,
                f64::INFINITY,
            ),
        ]
    }

    pub fn log_density(&self, model: &Model, event: &Event) -> f64 {
        if !self.is_feasible(model) {
            return f64::NEG_INFINITY;
        }
        let [t, x, m] = self.proposal(model);
        let lp = t.log_pdf(event.time) + x.log_pdf(event.location);
        if lp == f64::NEG_INFINITY {
            return lp;
        }
        lp + m.log_pdf(event.magnitude)
    }

    pub fn sample<R: Rng + ?Sized>(&self, model: &Model, rng: &mut R) -> Result<Event> {
        let [t, x, m] = self.proposal(model);
        Ok(Event {
            time: t.sample(rng)?,
            location: x.sample(rng)?,
            magnitude: m.sample(rng)?,
        })
    }

    /// The mean pulled inside the proposal's support.
    pub fn clamped_mean(&self, model: &Model) -> Event {
        let (x_lo, x_hi) = self.location_bounds(model);
        Event {
            time: self.mean.time.clamp(model.time_range.0, model.time_range.1),
            location: self.mean.location.clamp(x_lo, x_hi.max(x_lo)),
            magnitude: self.mean.magnitude.max(model.min_magnitude),
        }
    }
}

/// Triangulates an event from blips left and right of it.
///
/// The boundary detectors are the rightmost detector of `left` and the leftmost of
/// `right`; they must be distinct and in order.
pub fn triangulate(
    model: &Model,
    observations: &Observations,
    left: &[BlipId],
    right: &[BlipId],
) -> std::result::Result<Triangulation, TriangulationError> {
    if left.is_empty() {
        return Err(TriangulationError::EmptyLeft);
    }
    if right.is_empty() {
        return Err(TriangulationError::EmptyRight);
    }
    let boundary_left = left
        .iter()
        .map(|&b| observations.blip(b).detector)
        .max()
        .unwrap_or(0);
    let boundary_right = right
        .iter()
        .map(|&b| observations.blip(b).detector)
        .min()
        .unwrap_or(0);
    if boundary_left >= boundary_right {
        return Err(TriangulationError::InvertedDetectors {
            left: boundary_left,
            right: boundary_right,
        });
    }
    let x_l = model.detectors[boundary_left];
    let x_r = model.detectors[boundary_right];
    let k = model.decay_rate;

    let project = |blips: &[BlipId], anchor: f64| -> (f64, f64) {
        let n = blips.len() as f64;
        let (tau, mu) = blips.iter().fold((0.0, 0.0), |(tau, mu), &b| {
            let blip = observations.blip(b);
            let gap = (anchor - model.detectors[blip.detector]).abs();
            (tau + blip.time - gap, mu + blip.magnitude + k * gap)
        });
        (tau / n, mu / n)
    };
    let (tau_l, mu_l) = project(left, x_l);
    let (tau_r, mu_r) = project(right, x_r);

    let spread = 1.0 / left.len() as f64 + 1.0 / right.len() as f64;
    let var_time_pair = model.time_std.powi(2) * spread;
    let var_mag_pair = model.magnitude_std.powi(2) * spread;

    let time = 0.5 * (tau_l + tau_r - (x_r - x_l));
    let magnitude = 0.5 * (mu_l + mu_r + k * (x_r - x_l));

    let x_from_time = 0.5 * (tau_l - tau_r + x_l + x_r);
    let var_x_time = 0.25 * var_time_pair;
    let x_from_mag = 0.5 * (x_l + x_r) - (mu_l - mu_r) / (2.0 * k);
    let var_x_mag = var_mag_pair / (4.0 * k * k);
    let weight_mag = var_x_time / (var_x_time + var_x_mag);
    let location = x_from_time + weight_mag * (x_from_mag - x_from_time);
    let var_location = var_x_time * var_x_mag / (var_x_time + var_x_mag);

    Ok(Triangulation {
        mean: Event {
            time,
            location,
            magnitude,
        },
        std_dev: Event {
            time: (0.25 * var_time_pair).sqrt(),
            location: var_location.sqrt(),
            magnitude: (0.25 * var_mag_pair).sqrt(),
        },
        x_range: (x_l, x_r),
    })
}

/// Triangulates an event in `column` from its full blip set, one blip per detector.
pub fn triangulate_column(
    model: &Model,
    observations: &Observations,
    blips: &[BlipId],
    column: usize,
) -> Result<Triangulation> {
    let split = column.min(blips.len());
    Ok(triangulate(
        model,
        observations,
        &blips[..split],
        &blips[split..],
    )?)
}
