// ============================================================================
// FLEETSTAT BINARY
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use fleetstat::agent::{run_aggregator, run_instrumenter, split_by_host, AggregatorAgent, InstrumenterAgent, SampleFeed};
use fleetstat::descriptors::register_stock;
use fleetstat::logging::init_logging;
use fleetstat::metric::Sample;
use fleetstat::{
    CoordinatorHandle, CoordinatorService, FleetConfig, InstrumentationSpec, LocalBus, Timestamp, Transport,
    FLEETSTAT_FULL_NAME, FLEETSTAT_VERSION,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fleetstat", version, about = "Fleet-wide metrics control plane")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fleetstat.toml", env = "FLEETSTAT_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "FLEETSTAT_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a coordinator on an in-process bus and wait for Ctrl-C
    Run,

    /// Run a coordinator, one aggregator and synthetic instrumenters
    Demo {
        /// Number of instrumenter hosts
        #[arg(long, default_value_t = 3)]
        hosts: usize,

        /// Report intervals to print before deleting the instrumentation
        #[arg(long, default_value_t = 5)]
        ticks: u32,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Subcommand handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = FleetConfig::load(config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("  key base:        {}", config.coordinator.key_base);
    println!("  ack timeout:     {:?}", config.coordinator.ack_timeout);
    println!("  report interval: {:?}", config.agent.report_interval);
    println!("  retain samples:  {}", config.agent.retain_samples);
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = FleetConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", FLEETSTAT_FULL_NAME, FLEETSTAT_VERSION);
    println!("  target: {}", std::env::consts::ARCH);
    println!("  os:     {}", std::env::consts::OS);
}

async fn run_coordinator(config: FleetConfig) -> AnyhowResult<()> {
    let bus = LocalBus::shared();
    let (handle, service) = CoordinatorService::spawn(&config.coordinator, bus);

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!(target: "fleetstat::init", "Received Ctrl-C");

    handle.shutdown();
    service.await??;
    Ok(())
}

// ----------------------------------------------------------------------------
// Demo
// ----------------------------------------------------------------------------

/// Advance each host's synthetic counters by one interval
fn feed_tick(feeds: &[SampleFeed], tick: u64, interval: Duration) {
    let now = Timestamp::now().as_nanos();
    let elapsed = interval.as_nanos() as f64;
    for (i, feed) in feeds.iter().enumerate() {
        let scale = (i + 1) as f64;
        let t = tick as f64;
        feed.set(
            Sample::new("nic:net0", now)
                .with_attr("name", "net0")
                .with_counter("obytes64", scale * 1500.0 * t)
                .with_counter("rbytes64", scale * 900.0 * t),
        );
        feed.set(
            Sample::new("cpu:0", now)
                .with_attr("instance", "0")
                .with_counter("cpu_nsec_kernel", elapsed * t * 0.05 * scale)
                .with_counter("cpu_nsec_user", elapsed * t * 0.10 * scale),
        );
    }
}

async fn wait_for_fleet(handle: &CoordinatorHandle, hosts: usize) -> AnyhowResult<()> {
    for _ in 0..100 {
        let status = handle.status().await?;
        if status.instrumenters.len() == hosts && !status.aggregators.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("agents did not come online")
}

async fn run_demo(config: FleetConfig, hosts: usize, ticks: u32) -> AnyhowResult<()> {
    let bus = LocalBus::shared();
    let transport: Arc<dyn Transport> = bus.clone();
    let key_base = config.coordinator.key_base.clone();
    let interval = config.agent.report_interval;

    let (handle, service) = CoordinatorService::spawn(&config.coordinator, transport.clone());
    let (stop, shutdown) = watch::channel(false);
    let mut tasks = Vec::new();

    let aggregator = AggregatorAgent::new(transport.clone(), &key_base, "agg0", config.agent.retain_samples);
    let store = aggregator.store();
    tasks.push(tokio::spawn(run_aggregator(aggregator, shutdown.clone())));

    let mut feeds = Vec::with_capacity(hosts);
    for i in 0..hosts {
        let feed = SampleFeed::new();
        let mut agent = InstrumenterAgent::new(transport.clone(), &key_base, &format!("host{}", i));
        register_stock(&mut agent, &feed)?;
        let agent_config = config.agent.clone();
        let agent_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            run_instrumenter(agent, &agent_config, agent_shutdown).await
        }));
        feeds.push(feed);
    }

    wait_for_fleet(&handle, hosts).await?;
    let catalog = handle.list_metrics().await?;
    println!("Catalog:");
    for (module, info) in &catalog {
        let stats: Vec<&str> = info.stats.keys().map(String::as_str).collect();
        println!("  {:<8} {}", module, stats.join(", "));
    }

    let spec = InstrumentationSpec::new("nic", "bytes").with_decomposition(&["hostname"]);
    let id = handle.create_instrumentation(spec).await?;
    println!("\nCreated instrumentation {} (nic/bytes by hostname)", id);

    for tick in 1..=u64::from(ticks) {
        feed_tick(&feeds, tick, interval);
        tokio::time::sleep(interval).await;
        match store.latest(id) {
            Some((second, value)) => {
                let mut per_host: Vec<(String, f64)> = split_by_host(&value).into_iter().collect();
                per_host.sort_by(|a, b| a.0.cmp(&b.0));
                let rendered: Vec<String> =
                    per_host.iter().map(|(h, v)| format!("{}={}", h, v)).collect();
                println!("  t={} {}", second, rendered.join(" "));
            }
            None => println!("  (no data yet)"),
        }
    }

    handle.delete_instrumentation(id).await?;
    println!(
        "Deleted instrumentation {}; {} remaining",
        id,
        handle.list_instrumentations().await?.len()
    );

    handle.shutdown();
    stop.send_replace(true);
    service.await??;
    for task in tasks {
        match tokio::time::timeout(Duration::from_secs(1), task).await {
            Ok(joined) => joined??,
            Err(_) => warn!(target: "fleetstat::init", "Agent did not stop in time"),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Main
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.as_deref());
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        FleetConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        FleetConfig::from_env().context("Invalid environment configuration")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!(
            target: "fleetstat::init",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }
    info!(target: "fleetstat::init", "{} v{}", FLEETSTAT_FULL_NAME, FLEETSTAT_VERSION);

    match cli.command {
        Some(Commands::Demo { hosts, ticks }) => run_demo(config, hosts, ticks).await?,
        _ => run_coordinator(config).await?,
    }

    Ok(())
}
