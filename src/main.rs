// src/main.rs
//
// CLI entrypoint for signalflow.
//
// - `run`: resolve config (CLI > env > file > defaults), load the device
//   manifest, optionally overlay remote status, drive the simulator with the
//   chosen controller, emit tickets, then analyse trips.
// - `analyze`: trip analysis of the most recent run.
//
// The lock-step loop runs on a blocking task; Ctrl-C and --timeout-secs only
// flip its cancellation token, so it always finalises and reports.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use signalflow::config::{Config, ControlMode, Scenario, CONFIG_VERSION};
use signalflow::controller::build_controller;
use signalflow::engine::TraciEngine;
use signalflow::overlay::RemoteOverlay;
use signalflow::registry::DeviceRegistry;
use signalflow::report::{ReportEmitter, ReportSink};
use signalflow::runner::{CancelToken, RunError, RunOutcome, SimulationLoop};
use signalflow::telemetry::TelemetrySink;
use signalflow::TripAnalyzer;

/// Simulator executable used by --spawn when the config names none.
const DEFAULT_SIMULATOR: &str = "sumo";

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ScenarioArg {
    Osm,
    Api,
}

impl From<ScenarioArg> for Scenario {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Osm => Scenario::Osm,
            ScenarioArg::Api => Scenario::Api,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Static,
    Adaptive,
}

impl From<ModeArg> for ControlMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Static => ControlMode::Static,
            ModeArg::Adaptive => ControlMode::Adaptive,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "signalflow",
    about = "Traffic-signal control against a running road-traffic simulation",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive one simulation run.
    Run(RunArgs),
    /// Analyse the trips of the most recent run.
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_enum)]
    scenario: ScenarioArg,

    #[arg(long, value_enum)]
    mode: ModeArg,

    /// Config file (default: config/signalflow.yaml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for every random draw in the run.
    #[arg(long)]
    seed: Option<u64>,

    /// Wall-clock limit; the loop stops after the current step.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Cap on simulation steps.
    #[arg(long)]
    max_steps: Option<u64>,

    #[arg(long)]
    engine_host: Option<String>,

    #[arg(long)]
    engine_port: Option<u16>,

    /// Start the simulator with the scenario's config instead of attaching
    /// to a running one.
    #[arg(long)]
    spawn: bool,

    /// Skip the remote status overlay.
    #[arg(long)]
    no_overlay: bool,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// Label recorded with the metrics.
    #[arg(long, default_value = "MANUAL")]
    mode: String,

    /// Analyse this scenario instead of the most recent one.
    #[arg(long, value_enum)]
    scenario: Option<ScenarioArg>,

    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// CLI flags override everything loaded so far.
fn apply_cli_overrides(cfg: &mut Config, args: &RunArgs, scenario: Scenario) -> Result<()> {
    if let Some(seed) = args.seed {
        cfg.seed = Some(seed);
    }
    if let Some(host) = &args.engine_host {
        cfg.engine.host = host.clone();
    }
    if let Some(port) = args.engine_port {
        cfg.engine.port = port;
    }
    if let Some(max) = args.max_steps {
        cfg.engine.max_steps = Some(max);
    }
    if args.spawn {
        if cfg.engine.binary.is_none() {
            cfg.engine.binary = Some(DEFAULT_SIMULATOR.to_string());
        }
        if cfg.engine.config_file.is_none() {
            cfg.engine.config_file = Some(cfg.paths.simulator_config(scenario));
        }
    }
    if args.no_overlay {
        cfg.overlay.enabled = false;
    }
    cfg.validate().context("invalid configuration after CLI overrides")?;
    Ok(())
}

async fn load_registry(cfg: &Config, scenario: Scenario) -> Result<DeviceRegistry> {
    let manifest = cfg.paths.manifest(scenario);
    let mut registry = DeviceRegistry::load_manifest(&manifest)
        .with_context(|| format!("loading device manifest {}", manifest.display()))?;

    if scenario != Scenario::Api || !cfg.overlay.enabled {
        info!(scenario = scenario.as_str(), "remote overlay skipped; using manifest status");
        return Ok(registry);
    }

    let fetched = match RemoteOverlay::from_env(&cfg.overlay) {
        Ok(overlay) => overlay.fetch().await,
        Err(e) => Err(e),
    };
    match fetched {
        Ok(rows) => {
            registry.apply_overlay(&rows);
        }
        Err(e) => warn!(error = %e, "remote overlay unavailable; using manifest status"),
    }
    Ok(registry)
}

fn spawn_cancel_triggers(cancel: &CancelToken, timeout_secs: Option<u64>) {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            on_interrupt.cancel();
        }
    });

    if let Some(secs) = timeout_secs {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(secs, "timeout reached; stopping after the current step");
            on_timeout.cancel();
        });
    }
}

/// Connect and run the loop. Blocking.
fn drive(
    cfg: Config,
    mode: ControlMode,
    seed: u64,
    registry: DeviceRegistry,
    cancel: CancelToken,
    mut emitter: ReportEmitter,
) -> RunOutcome {
    let engine = match TraciEngine::connect(&cfg.engine) {
        Ok(engine) => engine,
        Err(e) => {
            let outcome = RunOutcome::failed_before_start(RunError::Connect(e));
            if let Err(e) = emitter.emit(&outcome) {
                error!(error = %e, "report emission failed");
            }
            return outcome;
        }
    };

    let controller = build_controller(mode, &cfg, seed);
    let mut sim = SimulationLoop::new(engine, controller, registry)
        .with_telemetry(TelemetrySink::from_env())
        .with_cancel(cancel)
        .with_max_steps(cfg.engine.max_steps)
        .with_report_sink(Box::new(emitter));
    sim.run()
}

async fn run(args: RunArgs) -> Result<()> {
    let scenario: Scenario = args.scenario.into();
    let mode: ControlMode = args.mode.into();

    let mut cfg = Config::load(args.config.as_deref()).context("loading config")?;
    apply_cli_overrides(&mut cfg, &args, scenario)?;
    let seed = cfg.seed.unwrap_or_else(rand::random);

    println!(
        "signalflow | cfg={} | cfg_hash={} | scenario={} | mode={} | seed={}",
        CONFIG_VERSION,
        cfg.fingerprint(),
        scenario.as_str(),
        mode.as_str(),
        seed
    );

    let registry = load_registry(&cfg, scenario).await?;

    let cancel = CancelToken::new();
    spawn_cancel_triggers(&cancel, args.timeout_secs);

    let emitter = ReportEmitter::new(&cfg.paths, scenario, mode, seed, registry.clone());
    let loop_cfg = cfg.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        drive(loop_cfg, mode, seed, registry, cancel, emitter)
    })
    .await
    .context("control loop task failed")?;

    let analyzer = TripAnalyzer::new(cfg.paths.clone(), mode.as_str());
    if let Err(e) = analyzer.run(Some(scenario)) {
        warn!(error = %e, "trip analysis failed");
    }

    match outcome.error {
        Some(e) => Err(anyhow::Error::new(e).context("simulation run failed")),
        None => Ok(()),
    }
}

fn analyze(args: AnalyzeArgs) -> Result<()> {
    let cfg = Config::load(args.config.as_deref()).context("loading config")?;
    let analyzer = TripAnalyzer::new(cfg.paths, args.mode);
    match analyzer.run(args.scenario.map(Into::into))? {
        Some(m) => println!(
            "signalflow analyze | scenario={} | vehicles={} | duration={:.2}s | wait={:.2}s | loss={:.2}s | speed={:.2}km/h",
            m.scenario, m.count, m.duration, m.wait, m.loss, m.speed
        ),
        None => println!("signalflow analyze | no tripinfo.xml found"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Analyze(args) => analyze(args),
    }
}
