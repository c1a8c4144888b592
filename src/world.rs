/*!
# World Model

The generative side of the system: detectors on a line, latent events and the blips
they leave on every detector, buried in per-detector background noise.

Blips and events get their identity at creation. A blip is the index of its entry in
[`Observations::blips`]; an event is an [`EventId`] handed out by [`WorldState`]. The
association between the two is kept in [`Association`], whose forward (blip to event)
and inverse (event to blips) maps only ever change together.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use rand::Rng;

use crate::config::Config;
use crate::distributions::{
    normal_log_pdf, sample_normal, sample_poisson, sample_shifted_exponential, sample_uniform,
    shifted_exponential_log_pdf, uniform_log_pdf,
};
use crate::error::{Error, Result};

/// Index of a blip in [`Observations::blips`].
pub type BlipId = usize;

/// Stable identity of an event, never reused within a [`WorldState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: f64,
    pub location: f64,
    pub magnitude: f64,
}

impl Event {
    pub fn new(time: f64, location: f64, magnitude: f64) -> Self {
        Self {
            time,
            location,
            magnitude,
        }
    }
}

/// A single detector observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blip {
    pub time: f64,
    pub magnitude: f64,
    pub detector: usize,
}

/// Parameters of the event and noise processes, as seen by one side of the run.
///
/// The generative and the inference views differ only in the observation std-devs,
/// which lets a run simulate model mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub detectors: Vec<f64>,
    pub time_range: (f64, f64),
    pub space_range: (f64, f64),
    pub event_intensity: f64,
    pub min_magnitude: f64,
    pub magnitude_rate: f64,
    pub decay_rate: f64,
    /// Expected number of noise blips on each detector.
    pub noise_intensity: f64,
    pub noise_min_magnitude: f64,
    pub noise_magnitude_rate: f64,
    pub time_std: f64,
    pub magnitude_std: f64,
}

impl Model {
    /// The model blips are generated from.
    pub fn generative(config: &Config) -> Self {
        Self::with_std_devs(config, config.time_std, config.magnitude_std)
    }

    /// The model the sampler believes in.
    pub fn inference(config: &Config) -> Self {
        Self::with_std_devs(
            config,
            config.inference_time_std(),
            config.inference_magnitude_std(),
        )
    }

    fn with_std_devs(config: &Config, time_std: f64, magnitude_std: f64) -> Self {
        Self {
            detectors: config.detectors.clone(),
            time_range: config.time_range,
            space_range: config.space_range(),
            event_intensity: config.event_intensity,
            min_magnitude: config.min_magnitude,
            magnitude_rate: config.magnitude_rate,
            decay_rate: config.decay_rate(),
            noise_intensity: config.noise_intensity * (config.time_range.1 - config.time_range.0),
            noise_min_magnitude: config.noise_min_magnitude,
            noise_magnitude_rate: 1.0 / config.noise_magnitude_scale,
            time_std,
            magnitude_std,
        }
    }

    pub fn n_detectors(&self) -> usize {
        self.detectors.len()
    }

    pub fn distance(&self, location: f64, detector: usize) -> f64 {
        (location - self.detectors[detector]).abs()
    }

    /// Longest distance a wave can travel from the event window to a detector.
    pub fn max_travel(&self) -> f64 {
        let first = self.detectors[0];
        let last = self.detectors[self.detectors.len() - 1];
        (self.space_range.1 - first).max(last - self.space_range.0)
    }

    /// Window of noise arrival times, stretched to catch late arrivals of events.
    pub fn noise_time_range(&self) -> (f64, f64) {
        (self.time_range.0, self.time_range.1 + self.max_travel())
    }

    pub fn predicted_time(&self, event: &Event, detector: usize) -> f64 {
        event.time + self.distance(event.location, detector)
    }

    pub fn predicted_magnitude(&self, event: &Event, detector: usize) -> f64 {
        event.magnitude - self.decay_rate * self.distance(event.location, detector)
    }

    /// Prior log-density of one event's parameters.
    pub fn event_prior_log_density(&self, event: &Event) -> f64 {
        uniform_log_pdf(event.time, self.time_range.0, self.time_range.1)
            + uniform_log_pdf(event.location, self.space_range.0, self.space_range.1)
            + shifted_exponential_log_pdf(event.magnitude, self.min_magnitude, self.magnitude_rate)
    }

    /// Log-density of `blip` having been caused by `event`.
    pub fn event_blip_log_density(&self, event: &Event, blip: &Blip) -> f64 {
        normal_log_pdf(
            blip.time,
            self.predicted_time(event, blip.detector),
            self.time_std,
        ) + normal_log_pdf(
            blip.magnitude,
            self.predicted_magnitude(event, blip.detector),
            self.magnitude_std,
        )
    }

    /// Log-density of `blip` under the background process.
    pub fn noise_blip_log_density(&self, blip: &Blip) -> f64 {
        let (lo, hi) = self.noise_time_range();
        uniform_log_pdf(blip.time, lo, hi)
            + shifted_exponential_log_pdf(
                blip.magnitude,
                self.noise_min_magnitude,
                self.noise_magnitude_rate,
            )
    }

    /// `ln(event density / noise density)` of a blip.
    pub fn blip_log_ratio(&self, event: &Event, blip: &Blip) -> f64 {
        self.event_blip_log_density(event, blip) - self.noise_blip_log_density(blip)
    }

    /// Number of detectors strictly left of `location`, kept within `1..n_detectors`
    /// so that both sides of a column always hold at least one detector.
    pub fn column(&self, location: f64) -> usize {
        let left = self.detectors.iter().filter(|&&x| x < location).count();
        left.clamp(1, self.detectors.len() - 1)
    }

    /// Positions of the two detectors bounding `column`.
    pub fn column_bounds(&self, column: usize) -> (f64, f64) {
        (self.detectors[column - 1], self.detectors[column])
    }

    /// Location interval of `column` intersected with the event window.
    pub fn column_range(&self, column: usize) -> (f64, f64) {
        let (left, right) = self.column_bounds(column);
        (left.max(self.space_range.0), right.min(self.space_range.1))
    }

    pub fn sample_event<R: Rng + ?Sized>(&self, rng: &mut R) -> Event {
        Event {
            time: sample_uniform(rng, self.time_range.0, self.time_range.1),
            location: sample_uniform(rng, self.space_range.0, self.space_range.1),
            magnitude: sample_shifted_exponential(rng, self.min_magnitude, self.magnitude_rate),
        }
    }

    pub fn sample_event_blip<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        event: &Event,
        detector: usize,
    ) -> Blip {
        Blip {
            time: sample_normal(rng, self.predicted_time(event, detector), self.time_std),
            magnitude: sample_normal(
                rng,
                self.predicted_magnitude(event, detector),
                self.magnitude_std,
            ),
            detector,
        }
    }

    pub fn sample_noise_blip<R: Rng + ?Sized>(&self, rng: &mut R, detector: usize) -> Blip {
        let (lo, hi) = self.noise_time_range();
        Blip {
            time: sample_uniform(rng, lo, hi),
            magnitude: sample_shifted_exponential(
                rng,
                self.noise_min_magnitude,
                self.noise_magnitude_rate,
            ),
            detector,
        }
    }
}

/// The immutable blip streams of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    pub blips: Vec<Blip>,
    /// Blip ids of every detector, sorted by arrival time.
    pub by_detector: Vec<Vec<BlipId>>,
}

impl Observations {
    /// Indexes `blips` per detector, sorting each stream by arrival time.
    pub fn new(blips: Vec<Blip>, n_detectors: usize) -> Self {
        let mut by_detector = vec![Vec::new(); n_detectors];
        for (id, blip) in blips.iter().enumerate() {
            by_detector[blip.detector].push(id);
        }
        for stream in by_detector.iter_mut() {
            stream.sort_by(|&a, &b| blips[a].time.total_cmp(&blips[b].time));
        }
        Self { blips, by_detector }
    }

    pub fn blip(&self, id: BlipId) -> &Blip {
        &self.blips[id]
    }

    pub fn len(&self) -> usize {
        self.blips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blips.is_empty()
    }

    pub fn n_detectors(&self) -> usize {
        self.by_detector.len()
    }
}

/// Blip-to-event mapping with its inverse.
///
/// `claims[e][d]` is the blip event `e` owns on detector `d`; `owner[b]` is the event
/// owning blip `b`. The two maps are only touched through [`Association::claim`] and
/// [`Association::release`], which keep them in step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Association {
    owner: Vec<Option<EventId>>,
    claims: BTreeMap<EventId, Vec<BlipId>>,
}

impl Association {
    pub fn new(n_blips: usize) -> Self {
        Self {
            owner: vec![None; n_blips],
            claims: BTreeMap::new(),
        }
    }

    pub fn owner(&self, blip: BlipId) -> Option<EventId> {
        self.owner[blip]
    }

    pub fn is_free(&self, blip: BlipId) -> bool {
        self.owner[blip].is_none()
    }

    pub fn blips_of(&self, event: EventId) -> Option<&[BlipId]> {
        self.claims.get(&event).map(|b| b.as_slice())
    }

    pub fn n_blips(&self) -> usize {
        self.owner.len()
    }

    /// Forward map as `(blip, event)` pairs for every associated blip.
    pub fn iter_owned(&self) -> impl Iterator<Item = (BlipId, EventId)> + '_ {
        self.owner
            .iter()
            .enumerate()
            .filter_map(|(b, e)| e.map(|e| (b, e)))
    }

    pub fn iter_claims(&self) -> impl Iterator<Item = (EventId, &[BlipId])> + '_ {
        self.claims.iter().map(|(&e, b)| (e, b.as_slice()))
    }

    /// Gives `blips` to `event`. Fails without side effects if any blip is taken.
    pub fn claim(&mut self, event: EventId, blips: Vec<BlipId>) -> Result<()> {
        if self.claims.contains_key(&event) {
            return Err(Error::InconsistentAssociation(format!(
                "{event} already holds blips"
            )));
        }
        for (i, &b) in blips.iter().enumerate() {
            if b >= self.owner.len() {
                return Err(Error::InconsistentAssociation(format!(
                    "blip {b} does not exist"
                )));
            }
            if let Some(other) = self.owner[b] {
                return Err(Error::InconsistentAssociation(format!(
                    "blip {b} claimed by {event} is owned by {other}"
                )));
            }
            if blips[..i].contains(&b) {
                return Err(Error::InconsistentAssociation(format!(
                    "blip {b} claimed twice by {event}"
                )));
            }
        }
        for &b in &blips {
            self.owner[b] = Some(event);
        }
        self.claims.insert(event, blips);
        Ok(())
    }

    /// Returns the blips of `event` to the noise pool.
    pub fn release(&mut self, event: EventId) -> Option<Vec<BlipId>> {
        let blips = self.claims.remove(&event)?;
        for &b in &blips {
            self.owner[b] = None;
        }
        Some(blips)
    }
}

/// The evolving part of a world: events and who owns which blip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorldState {
    events: BTreeMap<EventId, Event>,
    association: Association,
    next_id: u64,
}

impl WorldState {
    /// A world without events over `n_blips` blips.
    pub fn empty(n_blips: usize) -> Self {
        Self {
            events: BTreeMap::new(),
            association: Association::new(n_blips),
            next_id: 0,
        }
    }

    pub fn n_events(&self) -> usize {
        self.events.len()
    }

    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    pub fn events(&self) -> impl Iterator<Item = (EventId, &Event)> + '_ {
        self.events.iter().map(|(&id, e)| (id, e))
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.keys().copied().collect()
    }

    pub fn association(&self) -> &Association {
        &self.association
    }

    pub fn blips_of(&self, id: EventId) -> Option<&[BlipId]> {
        self.association.blips_of(id)
    }

    /// Adds `event` together with its blips, one per detector in detector order.
    pub fn insert_event(&mut self, event: Event, blips: Vec<BlipId>) -> Result<EventId> {
        let id = EventId(self.next_id);
        self.association.claim(id, blips)?;
        self.next_id += 1;
        self.events.insert(id, event);
        Ok(id)
    }

    /// Removes an event and frees its blips.
    pub fn remove_event(&mut self, id: EventId) -> Option<(Event, Vec<BlipId>)> {
        let event = self.events.remove(&id)?;
        let blips = self.association.release(id)?;
        Some((event, blips))
    }

    /// Replaces the parameters of an event, keeping its blips.
    pub fn replace_event(&mut self, id: EventId, event: Event) -> Result<()> {
        match self.events.get_mut(&id) {
            Some(slot) => {
                *slot = event;
                Ok(())
            }
            None => Err(Error::InconsistentAssociation(format!("{id} does not exist"))),
        }
    }

    /// Replaces both the parameters and the blips of an event in one step.
    ///
    /// Every new blip must be free or already owned by `id`; on failure the old
    /// claims are restored.
    pub fn reassign(&mut self, id: EventId, event: Event, blips: Vec<BlipId>) -> Result<()> {
        let old = self
            .association
            .release(id)
            .ok_or_else(|| Error::InconsistentAssociation(format!("{id} holds no blips")))?;
        if let Err(e) = self.association.claim(id, blips) {
            self.association.claim(id, old)?;
            return Err(e);
        }
        self.replace_event(id, event)
    }

    /// Exchanges the blips of two events on `detectors` and installs new parameters.
    pub fn swap_blips(
        &mut self,
        (a, event_a): (EventId, Event),
        (b, event_b): (EventId, Event),
        detectors: Range<usize>,
    ) -> Result<()> {
        let missing = || Error::InconsistentAssociation(format!("cannot swap {a} and {b}"));
        let mut blips_a = self.association.release(a).ok_or_else(missing)?;
        let mut blips_b = match self.association.release(b) {
            Some(blips) => blips,
            None => {
                self.association.claim(a, blips_a)?;
                return Err(missing());
            }
        };
        for d in detectors {
            std::mem::swap(&mut blips_a[d], &mut blips_b[d]);
        }
        self.association.claim(a, blips_a)?;
        self.association.claim(b, blips_b)?;
        self.replace_event(a, event_a)?;
        self.replace_event(b, event_b)
    }
}

/// A generated world: the blips plus the hidden truth that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticWorld {
    pub observations: Observations,
    pub truth: WorldState,
}

/// Draws a consistent world from the generative model.
///
/// Events and their blips are drawn before any noise so that changing the noise
/// intensity leaves the event draws untouched for a fixed seed.
pub fn sample_world<R: Rng + ?Sized>(model: &Model, rng: &mut R) -> Result<SyntheticWorld> {
    let n_events = sample_poisson(rng, model.event_intensity)?;
    let events: Vec<Event> = (0..n_events).map(|_| model.sample_event(rng)).collect();

    let mut blips = Vec::new();
    let mut claims = Vec::with_capacity(n_events);
    for event in &events {
        let mut owned = Vec::with_capacity(model.n_detectors());
        for d in 0..model.n_detectors() {
            owned.push(blips.len());
            blips.push(model.sample_event_blip(rng, event, d));
        }
        claims.push(owned);
    }

    for d in 0..model.n_detectors() {
        let n_noise = sample_poisson(rng, model.noise_intensity)?;
        for _ in 0..n_noise {
            blips.push(model.sample_noise_blip(rng, d));
        }
    }

    let observations = Observations::new(blips, model.n_detectors());
    let mut truth = WorldState::empty(observations.len());
    for (event, owned) in events.into_iter().zip(claims) {
        truth.insert_event(event, owned)?;
    }
    Ok(SyntheticWorld {
        observations,
        truth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn model() -> Model {
        Model::generative(&Config::default())
    }

    #[test]
    fn column_is_clamped_to_interior() {
        let m = model();
        assert_eq!(m.column(0.0), 1);
        assert_eq!(m.column(10.0), 1);
        assert_eq!(m.column(30.0), 1);
        assert_eq!(m.column(31.0), 2);
        assert_eq!(m.column(100.0), 4);
        assert_eq!(m.column_bounds(2), (30.0, 40.0));
    }

    #[test]
    fn association_rejects_double_claims_atomically() {
        let mut assoc = Association::new(4);
        assoc.claim(EventId(0), vec![0, 1]).unwrap();
        let err = assoc.claim(EventId(1), vec![2, 1]).unwrap_err();
        assert!(matches!(err, Error::InconsistentAssociation(_)));
        assert!(assoc.is_free(2));
        assert_eq!(assoc.blips_of(EventId(1)), None);
        assert_eq!(assoc.owner(1), Some(EventId(0)));
    }

    #[test]
    fn remove_event_frees_its_blips() {
        let mut state = WorldState::empty(3);
        let id = state
            .insert_event(Event::new(1.0, 2.0, 3.0), vec![0, 2])
            .unwrap();
        let (event, blips) = state.remove_event(id).unwrap();
        assert_eq!(event, Event::new(1.0, 2.0, 3.0));
        assert_eq!(blips, vec![0, 2]);
        assert!(state.association().is_free(0));
        assert!(state.association().is_free(2));
        assert_eq!(state.n_events(), 0);
    }

    #[test]
    fn failed_reassign_restores_old_claims() {
        let mut state = WorldState::empty(4);
        let a = state.insert_event(Event::new(0.0, 0.0, 3.0), vec![0, 1]).unwrap();
        let _b = state.insert_event(Event::new(0.0, 0.0, 3.0), vec![2, 3]).unwrap();
        let err = state
            .reassign(a, Event::new(9.0, 9.0, 9.0), vec![0, 3])
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentAssociation(_)));
        assert_eq!(state.blips_of(a), Some(&[0, 1][..]));
        assert_eq!(state.event(a), Some(&Event::new(0.0, 0.0, 3.0)));
    }

    #[test]
    fn swap_exchanges_left_blips() {
        let mut state = WorldState::empty(6);
        let a = state.insert_event(Event::new(0.0, 0.0, 3.0), vec![0, 1, 2]).unwrap();
        let b = state.insert_event(Event::new(0.0, 0.0, 3.0), vec![3, 4, 5]).unwrap();
        let ea = Event::new(1.0, 1.0, 3.0);
        let eb = Event::new(2.0, 2.0, 3.0);
        state.swap_blips((a, ea), (b, eb), 0..1).unwrap();
        assert_eq!(state.blips_of(a), Some(&[3, 1, 2][..]));
        assert_eq!(state.blips_of(b), Some(&[0, 4, 5][..]));
        assert_eq!(state.association().owner(3), Some(a));
        assert_eq!(state.association().owner(0), Some(b));
    }

    #[test]
    fn sampled_world_streams_are_sorted_and_complete() {
        let m = model();
        let mut rng = SmallRng::seed_from_u64(42);
        let world = sample_world(&m, &mut rng).unwrap();
        for (d, stream) in world.observations.by_detector.iter().enumerate() {
            assert!(stream
                .windows(2)
                .all(|w| world.observations.blip(w[0]).time <= world.observations.blip(w[1]).time));
            assert!(stream.iter().all(|&b| world.observations.blip(b).detector == d));
        }
        for (id, _) in world.truth.events() {
            let blips = world.truth.blips_of(id).unwrap();
            assert_eq!(blips.len(), m.n_detectors());
            for (d, &b) in blips.iter().enumerate() {
                assert_eq!(world.observations.blip(b).detector, d);
            }
        }
    }

    #[test]
    fn noise_does_not_perturb_event_draws() {
        let quiet = model();
        let noisy = Model {
            noise_intensity: 2.0 * model().noise_intensity,
            ..model()
        };
        let a = sample_world(&quiet, &mut SmallRng::seed_from_u64(9)).unwrap();
        let b = sample_world(&noisy, &mut SmallRng::seed_from_u64(9)).unwrap();
        let events_a: Vec<Event> = a.truth.events().map(|(_, e)| *e).collect();
        let events_b: Vec<Event> = b.truth.events().map(|(_, e)| *e).collect();
        assert_eq!(events_a, events_b);
        let n_event_blips = events_a.len() * quiet.n_detectors();
        assert_eq!(
            a.observations.blips[..n_event_blips],
            b.observations.blips[..n_event_blips]
        );
    }
}
