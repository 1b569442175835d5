//! Runs a sweep over a built-in analytic mixing-tank model and persists the
//! result.
//!
//! Environment:
//! - `PARASWEEP_CONFIG`: JSON `SweepConfig` (defaults to a seeded 32-run
//!   simple sweep on a two-worker process pool)
//! - `PARASWEEP_OUTPUT`: store root (default `sweep_results`)
//! - `PARASWEEP_RANKS`: rank count for the message-passing backend (default 4)

use anyhow::Context;
use tracing::{info, warn};

use ps_engine::{init_tracing, run_message_passing, run_sweep, Experiment, SweepOutcome};
use ps_store::{export_csv, SweepStore};
use ps_types::{BackendConfig, OutputDef, OutputValue, SampleSpec, SolveStatus, SweepConfig};

const AMBIENT_TEMPERATURE: f64 = 298.15;

#[derive(Debug, Clone)]
struct Tank {
    flow: f64,
    temperature: f64,
    pressure: f64,
    ambient: f64,
}

impl Tank {
    fn from_config(config: &ps_types::ModelConfig) -> anyhow::Result<Self> {
        let ambient = match config.get("ambient_temperature") {
            Some(value) => value
                .as_f64()
                .with_context(|| format!("ambient_temperature must be a number, got {value}"))?,
            None => AMBIENT_TEMPERATURE,
        };
        Ok(Self { flow: 1.0, temperature: ambient, pressure: 1.0, ambient })
    }

    fn cost(&self) -> f64 {
        10.0 * self.flow + 0.05 * self.temperature * self.pressure / 10.0
    }

    fn outlet_profile(&self) -> Vec<f64> {
        [0.25, 0.5, 1.0]
            .iter()
            .map(|x| self.temperature - (self.temperature - self.ambient) * 0.1 * x / self.flow)
            .collect()
    }
}

fn mixing_tank() -> Experiment<Tank> {
    Experiment::new(
        Tank::from_config,
        |tank: &mut Tank, _| {
            if tank.temperature > 350.0 {
                return Ok(SolveStatus::infeasible().with_message("feed above boiling point"));
            }
            if tank.flow * tank.pressure > 18.0 {
                return Ok(SolveStatus::new(ps_types::TerminationCondition::MaxIterations));
            }
            Ok(SolveStatus::optimal())
        },
    )
    .with_parameter(SampleSpec::uniform("flow", 0.5, 2.0), |tank, v| tank.flow = v)
    .with_parameter(SampleSpec::normal("temperature", 320.0, 15.0), |tank, v| tank.temperature = v)
    .with_parameter(SampleSpec::log_uniform("pressure", 1.0, 10.0), |tank, v| tank.pressure = v)
    .with_output(
        OutputDef::scalar("cost").with_units("USD/h").with_bounds(Some(0.0), None),
        |tank| OutputValue::Scalar(tank.cost()),
    )
    .with_output(OutputDef::array("outlet_temperature", 3).with_units("K"), |tank| {
        OutputValue::Array(tank.outlet_profile())
    })
}

fn load_config() -> anyhow::Result<SweepConfig> {
    match std::env::var("PARASWEEP_CONFIG") {
        Ok(path) => {
            SweepConfig::from_json_file(&path).with_context(|| format!("failed to load sweep config from {path}"))
        }
        Err(_) => {
            let mut config = SweepConfig::new("mixing_tank", 32)
                .with_seed(42)
                .with_backend(BackendConfig::process_pool(2));
            config
                .executor
                .model_config
                .insert("ambient_temperature".to_string(), serde_json::json!(AMBIENT_TEMPERATURE));
            Ok(config)
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing("info")?;

    let config = load_config()?;
    let output = std::env::var("PARASWEEP_OUTPUT").unwrap_or_else(|_| "sweep_results".to_string());
    let store = SweepStore::new(&output)?;
    let name = config.name.clone();

    let message_passing = matches!(config.backend, BackendConfig::MessagePassing);
    let outcome = if message_passing {
        let ranks = match std::env::var("PARASWEEP_RANKS") {
            Ok(value) => value
                .parse::<usize>()
                .with_context(|| format!("invalid PARASWEEP_RANKS {value:?}"))?,
            Err(_) => 4,
        };
        run_message_passing(mixing_tank(), config, ranks)?
    } else {
        run_sweep(mixing_tank(), config)?
    };

    let primary = outcome.primary();
    if !primary.is_complete() {
        warn!(
            "Only {}/{} runs succeeded; failed runs carry NaN outputs",
            primary.metadata.achieved, primary.metadata.requested
        );
    }

    let group = format!("{}/{}", name, primary.metadata.id);
    let dir = outcome.persist(&store, &group)?;
    match &outcome {
        SweepOutcome::Single(result) => export_csv(result, dir.join("results.csv"))?,
        SweepOutcome::Differential(result) => {
            export_csv(&result.nominal, dir.join("nominal.csv"))?;
            export_csv(&result.differential, dir.join("differential.csv"))?;
        }
    }

    info!("Results written to {}", dir.display());
    Ok(())
}
