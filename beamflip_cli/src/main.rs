use beamflip_core::config::AttackConfig;
use beamflip_core::resources::GradientSignal;
use beamflip_core::runner::{AttackRunner, CheckpointPolicy, RunEntry, RunReport};
use beamflip_core::{BagOfWordsClassifier, Dataset};

use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// JSON lines of `{"text": ..., "label": ...}`.
    #[clap(short, long, value_parser)]
    dataset: PathBuf,
    /// Overrides `[resources] model`.
    #[clap(short, long, value_parser)]
    model: Option<PathBuf>,
    /// Where to write one JSON result per line.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
    #[clap(short, long)]
    threads: Option<usize>,
    #[clap(short, long)]
    num_examples: Option<usize>,
    /// Overrides `[runner] checkpoint`; resumes from it when it exists.
    #[clap(long, value_parser)]
    checkpoint: Option<PathBuf>,
    #[clap(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(config_file: Option<&Path>) -> Result<AttackConfig, anyhow::Error> {
    match config_file {
        Some(path) => {
            info!(?path, "loading configuration");
            AttackConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from("beamflip.toml");
            if default_path.exists() {
                info!(path = ?default_path, "no config file specified, loading default");
                AttackConfig::load_from_file(&default_path)
            } else {
                info!("no config file specified and 'beamflip.toml' not found, using built-in defaults");
                Ok(AttackConfig::default())
            }
        }
    }
}

fn write_results(path: &Path, report: &RunReport) -> Result<(), anyhow::Error> {
    let mut out = BufWriter::new(File::create(path)?);
    for (index, entry) in &report.entries {
        let line = match entry {
            RunEntry::Completed(result) => serde_json::json!({ "index": index, "result": result }),
            RunEntry::Errored {
                input_hash,
                message,
            } => serde_json::json!({ "index": index, "input-hash": input_hash, "error": message }),
        };
        serde_json::to_writer(&mut out, &line)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config_file.as_deref())?;
    if let Some(model) = cli.model {
        config.resources.model = Some(model);
    }
    if let Some(threads) = cli.threads {
        config.runner.threads = threads;
    }
    if let Some(n) = cli.num_examples {
        config.runner.num_examples = Some(n);
    }
    if let Some(checkpoint) = cli.checkpoint {
        config.runner.checkpoint = Some(checkpoint);
    }
    info!("effective configuration: {config:?}");

    let model_path = config
        .resources
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No model configured: set [resources] model or pass --model"))?;
    let model = Arc::new(BagOfWordsClassifier::load_from_file(&model_path)?);

    let mut resources = config.resources.load()?;
    resources.num_classes = Some(model.labels.len());
    resources.vocabulary = model.vocabulary();
    let gradient: Arc<dyn GradientSignal> = model.clone();
    resources.gradient = Some(gradient);

    let settings = config.settings();
    let attack = settings.assemble(&resources)?;
    info!(attack = %attack.describe(), "attack assembled");

    let runner_settings = &config.runner;
    let mut dataset = Dataset::load_jsonl(&cli.dataset)?;
    if runner_settings.shuffle {
        dataset = dataset.shuffled(runner_settings.seed);
    }
    if let Some(n) = runner_settings.num_examples {
        dataset = dataset.take(n);
    }

    let mut runner =
        AttackRunner::new(&attack, model.as_ref()).with_threads(runner_settings.threads);
    if let Some(path) = &runner_settings.checkpoint {
        runner = runner.with_checkpoint(CheckpointPolicy {
            path: path.clone(),
            interval: runner_settings.checkpoint_interval,
            config_hash: config.fingerprint(),
        });
    }

    println!(
        "Attacking {} examples with {} thread(s)...",
        dataset.len(),
        runner_settings.threads
    );
    let start_time = Instant::now();
    let report = runner.run(&dataset)?;
    let elapsed_total = start_time.elapsed();

    let stats = report.stats;
    println!("\nAttack run finished in {elapsed_total:.2?}.");
    if report.resumed > 0 {
        println!("Resumed {} results from checkpoint.", report.resumed);
    }
    println!(
        "Succeeded: {}, Failed: {}, Skipped: {}, Maxed out: {}, Errored: {}",
        stats.succeeded, stats.failed, stats.skipped, stats.maxed_out, stats.errored
    );
    if report.interrupted > 0 {
        println!(
            "Interrupted: {} (not checkpointed, attacked again on resume)",
            report.interrupted
        );
    }
    if let Some(rate) = stats.success_rate() {
        println!("Attack success rate: {:.2}%", rate * 100.0);
    }
    if let Some(avg) = stats.avg_queries() {
        println!("Average queries per example: {avg:.1}");
    }

    match &cli.output {
        Some(path) => {
            write_results(path, &report)?;
            println!("Results written to {path:?}");
        }
        None => {
            for (index, entry) in &report.entries {
                match entry {
                    RunEntry::Completed(result) => println!(
                        "[{index}] {:?}: {} -> {}",
                        result.status,
                        result.original.text(),
                        result.perturbed_text().unwrap_or_else(|| "-".to_string())
                    ),
                    RunEntry::Errored { message, .. } => println!("[{index}] error: {message}"),
                }
            }
        }
    }

    Ok(())
}
