use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use phloem_core::config::Role;
use phloem_core::stats::{StatsAggregator, WorkerStats};
use phloem_core::threading::ThreadSupervisor;
use phloem_core::worker::WorkerLoop;
use phloem_protocol::{ConsumerSession, ProviderSession};
use phloem_transport::Acceptor;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod output;
mod profile;

/// Phloem: market data distribution latency harness
///
/// Phloem runs one side of a provider/consumer pair described by a TOML
/// profile. Start a provider, point one or more consumers at its listen
/// address, and read the latency summaries both sides report.
///
/// Example usage:
///   phloem run -P profiles/provider.toml
///   phloem run -P profiles/consumer.toml --set consumer.connect=10.0.0.1:14002
///   phloem run -P profiles/consumer.toml --set experiment.run_time=120s --set threads.count=4
///   phloem completions bash > ~/.local/share/bash-completion/completions/phloem
///
/// Override any config value using dot notation:
///   --set provider.update_rate=200000
///   --set consumer.item_count=50000
///   --set transport.guaranteed_output_buffers=20000
///
/// See profiles/ directory for example configurations.
#[derive(Parser)]
#[command(name = "phloem")]
#[command(version, about = "Market data distribution latency harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one side of a distribution experiment
    Run {
        /// Path to TOML profile configuration file
        #[arg(short = 'P', long, required = true)]
        profile: PathBuf,

        /// Override any configuration value using dot notation (can be specified multiple times)
        ///
        /// Examples:
        ///   --set consumer.connect=127.0.0.1:14002
        ///   --set experiment.run_time=60s
        ///   --set provider.latency_update_rate=all
        ///   --set output.summary_file=/tmp/summary.json
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "phloem".to_string(), &mut io::stdout());
            Ok(())
        }
        Commands::Run { profile, set } => run_harness(profile, set),
    }
}

fn run_harness(profile: PathBuf, set: Vec<String>) -> anyhow::Result<()> {
    tracing::info!("Loading profile: {}", profile.display());
    let config = profile::load(&profile, &set)?;

    tracing::info!("=== Experiment Configuration ===");
    tracing::info!("Name: {}", config.experiment.name);
    if let Some(desc) = &config.experiment.description {
        tracing::info!("Description: {}", desc);
    }
    if let Some(seed) = config.experiment.seed {
        tracing::info!("Seed: {} (reproducible sampling schedule)", seed);
    }
    tracing::info!("Role: {}", config.role);
    tracing::info!("Run time: {:?}", config.experiment.run_time);
    tracing::info!(
        "Workers: {} at {} ticks/s",
        config.threads.count,
        config.pacing.ticks_per_sec
    );
    match config.role {
        Role::Provider => {
            if let Some(provider) = &config.provider {
                tracing::info!(
                    "Provider: listen {}, {} updates/s and {} generics/s per worker",
                    provider.listen,
                    provider.update_rate,
                    provider.generic_rate
                );
            }
        }
        Role::Consumer => {
            if let Some(consumer) = &config.consumer {
                tracing::info!(
                    "Consumer: connect {}, {} items at {} requests/s",
                    consumer.connect,
                    consumer.item_count,
                    consumer.request_rate
                );
            }
        }
    }
    tracing::info!("================================");

    let worker_count = config.threads.count;
    let ticks_per_sec = config.pacing.ticks_per_sec;
    let poller_kind = config.poller_kind()?;
    let run_time = config.experiment.run_time;
    let write_interval = config.experiment.write_stats_interval;

    let stats: Vec<Arc<WorkerStats>> =
        (0..worker_count).map(|_| Arc::new(WorkerStats::new())).collect();
    let mut aggregator = StatsAggregator::new(&config.output, &stats)?;

    let supervisor = match config.role {
        Role::Provider => {
            let acceptor = Acceptor::bind(config.listen_addr()?, config.channel_options())?;
            tracing::info!("Listening on {}", acceptor.local_addr()?);
            let acceptor = Arc::new(Mutex::new(acceptor));
            let worker_config = config.clone();
            let worker_stats = stats.clone();
            ThreadSupervisor::spawn(worker_count, move |index, control| {
                let session = ProviderSession::new(
                    &worker_config,
                    index,
                    Arc::clone(&acceptor),
                    Arc::clone(&worker_stats[index]),
                )?;
                let mut worker = WorkerLoop::new(index, poller_kind, ticks_per_sec, session)?;
                worker.run(&control)
            })?
        }
        Role::Consumer => {
            let worker_config = config.clone();
            let worker_stats = stats.clone();
            ThreadSupervisor::spawn(worker_count, move |index, control| {
                let session =
                    ConsumerSession::new(&worker_config, index, Arc::clone(&worker_stats[index]))?;
                let mut worker = WorkerLoop::new(index, poller_kind, ticks_per_sec, session)?;
                worker.run(&control)
            })?
        }
    };

    aggregator.run(run_time, write_interval, || supervisor.all_stopped());
    supervisor.shutdown()?;

    let summary = aggregator.summarize(&config.experiment.name, config.role, run_time.as_secs());
    output::print_summary(&summary);

    if let Some(path) = &config.output.summary_file {
        output::write_summary(path, &summary)?;
        tracing::info!("Summary written to: {}", path.display());
    }

    Ok(())
}
