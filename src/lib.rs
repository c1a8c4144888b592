/*!
# blip-mcmc

Trans-dimensional MCMC inference of point events on a line from noisy detector
blips.

Events `(time, location, magnitude)` leave one blip on every detector, delayed by
the travel distance and attenuated with it; detectors also record background noise.
Given only the blips, a reversible-jump chain infers how many events there were,
their parameters and which blip belongs to which event.

```rust
use blip_mcmc::config::Config;
use blip_mcmc::sampler::run_synthetic;

let config = Config {
    iterations: 10,
    ..Config::default()
};
let (world, run) = run_synthetic(&config).unwrap();
println!(
    "{} true events, {} inferred",
    world.truth.n_events(),
    run.final_state.n_events()
);
```
*/

pub mod config;
pub mod context;
pub mod density;
pub mod distributions;
pub mod error;
pub mod evaluation;
pub mod moves;
pub mod potential;
pub mod sampler;
pub mod stats;
pub mod triangulation;
pub mod world;
