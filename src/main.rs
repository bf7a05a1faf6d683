use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use overtake_predictor::analysis;
use overtake_predictor::config::LoggingConfig;
use overtake_predictor::data::load_lap_records;
use overtake_predictor::pairs::write_pairs_csv;
use overtake_predictor::pipeline;
use overtake_predictor::{ArtifactStore, Orientation, PipelineConfig, Scenario, ScenarioDriver, ScenarioScorer};

#[derive(Parser)]
#[command(name = "overtake")]
#[command(version)]
#[command(about = "Train and query a pairwise F1 overtake probability model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, env = "OVERTAKE_CONFIG", default_value = "config/default.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full training pipeline and publish a new artifact
    Train {
        /// Lap table CSV
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Clean laps and export the labelled pair observations
    Pairs {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Feature correlation report over the pair observations
    Analyze {
        #[arg(short, long)]
        input: PathBuf,
        /// |r| above which two features are reported as redundant
        #[arg(long, default_value = "0.7")]
        redundancy: f64,
    },
    /// Score one hand-entered scenario with the current artifact
    Score {
        /// Running position of the attacking driver
        #[arg(long)]
        position: u32,
        #[arg(long)]
        own_lap_time: f64,
        #[arg(long)]
        own_tyre_age: u32,
        #[arg(long)]
        own_compound: String,
        #[arg(long)]
        opp_lap_time: f64,
        #[arg(long)]
        opp_tyre_age: u32,
        #[arg(long)]
        opp_compound: String,
        /// The opponent attacks instead of your driver
        #[arg(long)]
        defense: bool,
    },
    /// Print the current artifact's selection report
    Report,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = PipelineConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    init_logging(&cfg.logging);

    let store = ArtifactStore::from_config(&cfg.artifacts);

    match cli.command {
        Commands::Train { input } => {
            // load the raw lap table first; a bad row stops the run here with its row number
            let records = load_lap_records(&input).with_context(|| format!("reading {}", input.display()))?;
            info!(rows = records.len(), path = %input.display(), "loaded lap table");

            // All three models are fitted and compared; an error here means none survived.
            let artifact = pipeline::train(&records, &cfg)?;
            // only a winning artifact gets here, and publishing swaps CURRENT in one rename
            let dir = store.publish(&artifact)?;

            let report = &artifact.metadata().report;
            println!("{}", report.render_table());
            for condition in &report.degraded {
                println!("degraded: {}", serde_json::to_string(condition)?);
            }
            println!("Selected {} -> {}", report.chosen, dir.display());
        }
        Commands::Pairs { input, output } => {
            let records = load_lap_records(&input).with_context(|| format!("reading {}", input.display()))?;
            let pairs = pipeline::build_pairs(&records, &cfg);
            let file = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
            write_pairs_csv(&pairs.observations, BufWriter::new(file))?;
            println!("Wrote {} pair observations to {}", pairs.observations.len(), output.display());
        }
        Commands::Analyze { input, redundancy } => {
            let records = load_lap_records(&input).with_context(|| format!("reading {}", input.display()))?;
            let pairs = pipeline::build_pairs(&records, &cfg);
            print!("{}", analysis::analyze(&pairs.observations, redundancy));
        }
        Commands::Score {
            position,
            own_lap_time,
            own_tyre_age,
            own_compound,
            opp_lap_time,
            opp_tyre_age,
            opp_compound,
            defense,
        } => {
            let artifact = Arc::new(store.load_current()?);
            let scorer = ScenarioScorer::new(artifact, cfg.scoring.threshold);
            let scenario = Scenario {
                attacker_position: position,
                own: ScenarioDriver {
                    lap_time: own_lap_time,
                    tyre_age: own_tyre_age,
                    compound: own_compound,
                },
                opponent: ScenarioDriver {
                    lap_time: opp_lap_time,
                    tyre_age: opp_tyre_age,
                    compound: opp_compound,
                },
                orientation: if defense { Orientation::Defense } else { Orientation::Attack },
            };
            let score = scorer.score(&scenario)?;
            println!("{}", serde_json::to_string_pretty(&score)?);
        }
        Commands::Report => {
            let artifact = store.load_current()?;
            println!("{}", serde_json::to_string_pretty(artifact.metadata())?);
        }
    }

    Ok(())
}

// Logs go to stderr so JSON printed on stdout stays machine-readable.
fn init_logging(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
