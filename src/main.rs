use std::process::ExitCode;

use blip_mcmc::config::Config;
use blip_mcmc::moves::MoveKind;
use blip_mcmc::sampler::run_synthetic;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Optional path to a YAML config; defaults otherwise.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_path(&path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (world, run) = match run_synthetic(&config) {
        Ok(result) => result,
        Err(e) => {
            error!("inference failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "true events: {}, inferred events: {}",
        world.truth.n_events(),
        run.final_state.n_events()
    );
    if let Some(last) = run.records.last() {
        if let (Some(events), Some(assoc)) = (last.event_scores, last.association_scores) {
            println!(
                "event P/R/F1 = {:.3}/{:.3}/{:.3}, association P/R/F1 = {:.3}/{:.3}/{:.3}",
                events.precision,
                events.recall,
                events.f1,
                assoc.precision,
                assoc.recall,
                assoc.f1
            );
        }
    }
    for kind in MoveKind::ALL {
        let stats = run.counters.get(kind);
        println!(
            "{kind:>9}: {:>6} proposed, acceptance {:.3}",
            stats.proposed,
            stats.rate()
        );
    }
    if let Some(summary) = run.summary {
        println!(
            "log-probability: mean {:.2}, max {:.2}, ESS {:.1}",
            summary.log_probability.mean,
            summary.log_probability.max,
            summary.log_probability.ess
        );
    }
    ExitCode::SUCCESS
}
