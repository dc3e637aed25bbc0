use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtuner::{config::Config, corpus::read_position_file, error_metric::{find_smallest_k, DELTA_K}, scorer::EnginePool, tuner::Tuner};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rtuner")]
#[command(about = "Tunes engine evaluation parameters against labelled positions (Texel's Tuning Method)")]
struct Cli {
    /// Tuner configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tuning loop and write the best parameters
    Tune {
        /// Overrides 'options.result_file'
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Find the scaling constant K that best fits the configured parameter values
    CalibrateK {
        /// Starting K; defaults to the configured 'k'
        #[arg(long)]
        start: Option<f64>,
        #[arg(long, default_value_t = DELTA_K)]
        delta: f64,
    },
}

fn init_logging(debug_log: bool) {
    let default_level = if debug_log { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    let config = Config::load(&config).with_context(|| format!("failed reading configuration {}", config.display()))?;
    init_logging(config.debug_log);
    config.check_concurrency();

    info!("Reading test positions ...");
    let positions = read_position_file(&config.test_positions_file)?;
    info!("Read {} test positions", positions.len());

    let mut pool = EnginePool::start(&config.engine, config.concurrency, config.timeouts, positions, config.k)?;

    let outcome = match command {
        Commands::Tune { output } => tune(&mut pool, &config, output),
        Commands::CalibrateK { start, delta } => calibrate_k(&mut pool, &config, start, delta),
    };

    // Sessions are stopped even when tuning failed.
    let stopped = pool.shutdown();
    outcome?;
    stopped?;
    Ok(())
}

fn tune(pool: &mut EnginePool, config: &Config, output: Option<PathBuf>) -> Result<()> {
    let result_file = output.unwrap_or_else(|| config.result_file.clone());
    let mut tuner = Tuner::new(pool, config.tuning.clone())?.with_result_file(result_file.clone());

    let summary = tuner.run()?;

    info!("Avg. error before tuning: {:.8}", summary.initial_error);
    info!("Avg. error after tuning : {:.8}", summary.final_error);
    info!("Rounds / trials         : {} / {}", summary.rounds, summary.trials);
    info!("Tuning duration         : {:.2}s", summary.duration.as_secs_f64());
    info!("Result written to {}", result_file.display());
    Ok(())
}

fn calibrate_k(pool: &mut EnginePool, config: &Config, start: Option<f64>, delta: f64) -> Result<()> {
    let error = pool.run_pass(&config.tuning)?;
    info!("Error with configured K {}: {:.8}", config.k, error);

    let best_k = find_smallest_k(start.unwrap_or(config.k), delta, pool.positions());
    println!("k = {best_k:.6}");
    Ok(())
}
