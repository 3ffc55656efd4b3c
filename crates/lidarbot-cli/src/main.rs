use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::{error, info};

use lidarbot_core::{
    build_actuator, CaptureLoop, ControlLoop, ControlOptions, CooldownGate, DecisionEngine, FrameSource,
    KeyBindings, LoggingMotor, PolicyKind, RoverConfig, Session, SimulatedLidar, StopSignal,
};
use lidarbot_store::{ReplaySource, TrainingStore};

mod keyboard;
mod signal;

use keyboard::KeyboardLabels;

#[derive(Parser)]
#[command(name = "lidarbot", about = "Lidar obstacle-avoiding rover", version)]
struct Cli {
    /// TOML configuration file; `LIDARBOT_*` environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity: -v debug, -vv trace. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive with the rule-based sector avoider
    Avoid {
        #[command(flatten)]
        source: SourceArgs,
        /// Also store every executed action with its frame
        #[arg(long)]
        record: bool,
    },
    /// Drive with a learned model
    Drive {
        #[command(flatten)]
        source: SourceArgs,
        /// Model file, overriding `policy.learned.model_path`
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long)]
        record: bool,
    },
    /// Steer by keyboard and record labelled frames
    Capture {
        #[command(flatten)]
        source: SourceArgs,
        /// Training log to append to, overriding `capture.db_path`
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Summarize a training log
    Stats {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Write a training log as JSON lines for the offline trainer
    Export {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Write the default configuration as TOML
    InitConfig {
        #[arg(short, long, default_value = "lidarbot.toml")]
        out: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Simulated sensor from `sensor.sim`
    Sim,
    /// Frames stored in a training log, looped
    Replay,
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long, value_enum, default_value_t = SourceKind::Sim)]
    source: SourceKind,
    /// Training log to replay (with `--source replay`)
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let raw_terminal = matches!(cli.command, Commands::Capture { .. });
    init_logging(cli.verbose, raw_terminal);

    if let Err(e) = run(cli) {
        error!("{}", e);
        return Err(e);
    }
    Ok(())
}

fn init_logging(verbose: u8, raw_terminal: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if raw_terminal {
        // raw mode needs an explicit carriage return
        builder.format(|buf, record| {
            write!(buf, "[{} {:<5} {}] {}\r\n", buf.timestamp(), record.level(), record.target(), record.args())
        });
    }
    builder.init();
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let load = || RoverConfig::load(cli.config.as_deref());
    match cli.command {
        Commands::Avoid { source, record } => {
            let mut cfg = load()?;
            cfg.policy.kind = PolicyKind::RuleBased;
            cfg.control.record_autonomous |= record;
            autonomous(&cfg, &source)
        }
        Commands::Drive { source, model, record } => {
            let mut cfg = load()?;
            cfg.policy.kind = PolicyKind::Learned;
            if let Some(model) = model {
                cfg.policy.learned.model_path = model;
            }
            cfg.control.record_autonomous |= record;
            autonomous(&cfg, &source)
        }
        Commands::Capture { source, output } => {
            let cfg = load()?;
            let db = output.unwrap_or_else(|| cfg.capture.db_path.clone());
            capture(&cfg, &source, &db)
        }
        Commands::Stats { db } => stats(&load()?, db.as_deref()),
        Commands::Export { db, out } => export(&load()?, db.as_deref(), out.as_deref()),
        Commands::InitConfig { out, force } => init_config(&out, force),
    }
}

fn build_source(cfg: &RoverConfig, args: &SourceArgs) -> Result<Box<dyn FrameSource>, Box<dyn Error>> {
    match args.source {
        SourceKind::Sim => {
            info!("simulated range sensor (hardware port {} not opened)", cfg.sensor.port);
            Ok(Box::new(SimulatedLidar::new(cfg.sensor.sim.clone())))
        }
        SourceKind::Replay => {
            let path = args.db.as_deref().unwrap_or(cfg.capture.db_path.as_path());
            let store = TrainingStore::open(path, cfg.policy.actions.clone())?;
            let replay = ReplaySource::from_store(&store)?;
            if replay.is_empty() {
                return Err(format!("{} has no recorded frames to replay", path.display()).into());
            }
            let period = Duration::from_millis(cfg.sensor.sim.frame_period_ms);
            Ok(Box::new(replay.with_period(period).looping()))
        }
    }
}

fn autonomous(cfg: &RoverConfig, source_args: &SourceArgs) -> Result<(), Box<dyn Error>> {
    // model problems surface here, before anything moves
    let engine = DecisionEngine::from_config(cfg)?;
    let store = if cfg.control.record_autonomous {
        Some(TrainingStore::open(&cfg.capture.db_path, cfg.policy.actions.clone())?)
    } else {
        None
    };
    let source = build_source(cfg, source_args)?;

    let stop = StopSignal::new();
    signal::watch_ctrl_c(stop.clone())?;

    let mut control =
        ControlLoop::new(engine, CooldownGate::from_config(&cfg.cooldown), ControlOptions::from(&cfg.control));
    if let Some(store) = &store {
        control = control.with_recorder(Box::new(store));
    }
    let actuator = build_actuator(&cfg.actuator, LoggingMotor::default());
    let report = Session::from_config(cfg, stop).run(source, actuator, |ctx| control.run(ctx))?;

    let r = &report.consumer;
    info!(
        "{} ticks, {} decisions ({} held by cooldown), {} stale ticks, {} records",
        r.ticks, r.decisions, r.suppressed, r.stale_ticks, r.records_written
    );
    if let Some(acq) = &report.acquisition {
        info!(
            "acquisition: {} frames published, {} dropped, {} transient errors",
            acq.frames_published, acq.frames_dropped, acq.transient_errors
        );
    }
    Ok(())
}

fn capture(cfg: &RoverConfig, source_args: &SourceArgs, db: &Path) -> Result<(), Box<dyn Error>> {
    let store = TrainingStore::open(db, cfg.policy.actions.clone())?;
    let before = store.count()?;
    let bindings = KeyBindings::from_config(&cfg.capture);
    let source = build_source(cfg, source_args)?;

    let stop = StopSignal::new();
    signal::watch_ctrl_c(stop.clone())?;

    info!("keys: {}", bindings.describe());
    let labels = KeyboardLabels::new(bindings, Duration::from_millis(100))?;
    let mut capture = CaptureLoop::new(labels, &store).with_gate(CooldownGate::from_config(&cfg.cooldown));
    let actuator = build_actuator(&cfg.actuator, LoggingMotor::default());
    let result = Session::from_config(cfg, stop).run(source, actuator, |ctx| capture.run(ctx));
    drop(capture);

    let report = result?.consumer;
    info!(
        "{} labels ({} held by cooldown), {} saved, {} empty scans skipped, {} failed; log now holds {} records (was {})",
        report.labels,
        report.held_by_cooldown,
        report.records_written,
        report.skipped_empty,
        report.record_errors,
        store.count()?,
        before
    );
    Ok(())
}

fn stats(cfg: &RoverConfig, db: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let path = db.unwrap_or(cfg.capture.db_path.as_path());
    let store = TrainingStore::open(path, cfg.policy.actions.clone())?;
    let total = store.count()?;
    println!("{}: {} records in {} sessions", path.display(), total, store.session_count()?);
    for (action, n) in store.action_histogram()? {
        let share = if total > 0 { n as f64 * 100.0 / total as f64 } else { 0.0 };
        println!("  {:<8} {:>7}  {:5.1}%", action, n, share);
    }
    if let Some(last) = store.last_recorded_at()? {
        println!("last record: {}", last.to_rfc3339());
    }
    Ok(())
}

fn export(cfg: &RoverConfig, db: Option<&Path>, out: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let path = db.unwrap_or(cfg.capture.db_path.as_path());
    let store = TrainingStore::open(path, cfg.policy.actions.clone())?;
    let lines = match out {
        Some(out) => store.export_jsonl(BufWriter::new(File::create(out)?))?,
        None => store.export_jsonl(BufWriter::new(io::stdout().lock()))?,
    };
    info!("exported {} records from {}", lines, path.display());
    Ok(())
}

fn init_config(out: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if out.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", out.display()).into());
    }
    std::fs::write(out, RoverConfig::default().to_toml_string()?)?;
    info!("wrote default configuration to {}", out.display());
    Ok(())
}
