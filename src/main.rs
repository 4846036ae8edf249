//! probe_scan CLI: plan grids, match pads in images, and run simulated scans.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use probe_scan::config::ProbeConfig;
use probe_scan::grid::{CalibrationAnchor, GridAnchors, ScanPlan};
use probe_scan::hardware::mock::{
    MockFrameSource, MockPositioner, MockRelay, MockSourceMeter, MockTransport, SyntheticScene,
};
use probe_scan::hardware::{
    HardwareLock, Instruments, LcusRelay, Positioner, Relay, ScanningStage,
};
use probe_scan::monitor::MemoryGuard;
use probe_scan::scan::{Recenterer, ScanController, ScanEvent};
use probe_scan::vision::{
    multi_scale_match, read_bias_file, BgrFrame, TemplateMatcher, TemplateRole, TemplateStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "probe_scan")]
#[command(about = "Probe-needle positioning and serpentine grid scanning")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, default_value = "config/probe_scan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the planned device sequence as JSON.
    Plan(PlanArgs),

    /// Detect pads in an image with the multi-scale matcher.
    Match(MatchArgs),

    /// Run a full scan against simulated hardware and print lifecycle events.
    Simulate(SimulateArgs),

    /// Print the effective configuration (file, environment and defaults) as TOML.
    ShowConfig,
}

#[derive(Debug, Clone, Args)]
struct PlanArgs {
    /// Top-left anchor as `x,y,row,col[,name]` (1-based row and column).
    #[arg(long, value_parser = parse_anchor)]
    top_left: CalibrationAnchor,

    /// Top-right anchor as `x,y,row,col[,name]`.
    #[arg(long, value_parser = parse_anchor)]
    top_right: CalibrationAnchor,

    /// Bottom-right anchor as `x,y,row,col[,name]`.
    #[arg(long, value_parser = parse_anchor)]
    bottom_right: CalibrationAnchor,

    /// Grid rows.
    #[arg(long)]
    rows: u32,

    /// Grid columns.
    #[arg(long)]
    cols: u32,
}

#[derive(Debug, Clone, Args)]
struct MatchArgs {
    /// Camera image to search.
    #[arg(long)]
    image: PathBuf,

    /// Pad template image; defaults to the configured pad template.
    #[arg(long)]
    template: Option<PathBuf>,

    /// Alignment bias file (`x,y`); defaults to the configured one.
    #[arg(long)]
    bias_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct SimulateArgs {
    /// Grid rows.
    #[arg(long, default_value = "3")]
    rows: u32,

    /// Grid columns.
    #[arg(long, default_value = "4")]
    cols: u32,

    /// Device pitch in stage units.
    #[arg(long, default_value = "5.0")]
    pitch: f64,

    /// Label of the top-left device.
    #[arg(long, default_value = "AA_1")]
    first_name: String,

    /// Drive the bracket-protocol stage over a recording transport instead
    /// of the ideal positioner.
    #[arg(long)]
    stage_protocol: bool,

    /// Current returned by the simulated source meter, in amps.
    #[arg(long, default_value = "2e-9")]
    current: f64,

    /// Skip the press/measure/retract cycle.
    #[arg(long)]
    skip_electrical: bool,

    /// Override every settle and dwell delay, in milliseconds.
    #[arg(long, default_value = "5")]
    settle_ms: u64,
}

fn parse_anchor(text: &str) -> std::result::Result<CalibrationAnchor, String> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    if !(4..=5).contains(&parts.len()) {
        return Err(format!("expected x,y,row,col[,name], got '{}'", text));
    }
    let x: f64 = parts[0].parse().map_err(|e| format!("bad x: {}", e))?;
    let y: f64 = parts[1].parse().map_err(|e| format!("bad y: {}", e))?;
    let row: u32 = parts[2].parse().map_err(|e| format!("bad row: {}", e))?;
    let col: u32 = parts[3].parse().map_err(|e| format!("bad col: {}", e))?;
    let anchor = CalibrationAnchor::new(x, y, row, col);
    Ok(match parts.get(4) {
        Some(name) if !name.is_empty() => anchor.with_name(*name),
        _ => anchor,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ProbeConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    probe_scan::logging::init_from_config(&config.application)?;

    match cli.command {
        Commands::Plan(args) => run_plan(args),
        Commands::Match(args) => run_match(args, &config),
        Commands::Simulate(args) => run_simulate(args, config).await,
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let anchors = GridAnchors {
        top_left: args.top_left,
        top_right: args.top_right,
        bottom_right: args.bottom_right,
    };
    let plan = ScanPlan::from_anchors(&anchors, args.rows, args.cols)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn run_match(args: MatchArgs, config: &ProbeConfig) -> Result<()> {
    let frame = BgrFrame::open(&args.image)?;
    let template = match &args.template {
        Some(path) => BgrFrame::open(path)?,
        None => configured_pad(config)?,
    };
    let bias_path = args.bias_file.unwrap_or_else(|| config.vision.bias_file.clone());
    let bias = read_bias_file(&bias_path);

    let pads = multi_scale_match(&frame, &template, bias);
    info!(pads = pads.len(), "Pad detection finished");
    println!("{}", serde_json::to_string_pretty(&pads)?);
    Ok(())
}

fn configured_pad(config: &ProbeConfig) -> Result<BgrFrame> {
    let store = TemplateStore::new();
    let report = store.load_or_refresh(&config.templates);
    info!(
        loaded = report.reloaded.len(),
        failed = report.failed.len(),
        "Configured templates loaded"
    );
    store
        .get(TemplateRole::Pad)
        .map(|t| t.image.clone())
        .ok_or_else(|| anyhow!("pad template {} not loaded", config.templates.pad.display()))
}

async fn run_simulate(args: SimulateArgs, mut config: ProbeConfig) -> Result<()> {
    config.scan.settle_ms = args.settle_ms;
    config.scan.post_move_settle_ms = args.settle_ms;
    config.scan.pressure_settle_ms = args.settle_ms;
    config.electrical.relay_settle_ms = args.settle_ms;
    config.positioner.motion_dwell_ms = args.settle_ms;
    config.scan.skip_electrical = args.skip_electrical;
    config.validate()?;

    let plan = simulated_plan(&args)?;
    let scene = SyntheticScene::default();

    let store = Arc::new(TemplateStore::new());
    store.insert(TemplateRole::Needle, scene.needle.clone());
    store.insert(TemplateRole::Pad, scene.pad.clone());
    let matcher = Arc::new(TemplateMatcher::new(store, &config.vision.bias_file));
    let recenterer = Recenterer::new(matcher, &config.vision);

    let (positioner, relay) =
        if args.stage_protocol {
            let lock = HardwareLock::new(
                "stage",
                Box::new(MockTransport::new()),
                config.positioner.retry_policy(),
                config.scan.lock_timeout(),
            );
            let stage: Arc<dyn Positioner> =
                Arc::new(ScanningStage::new(lock.clone(), &config.positioner));
            let relay: Arc<dyn Relay> = Arc::new(LcusRelay::new(lock, 1));
            (stage, relay)
        } else {
            let stage: Arc<dyn Positioner> = Arc::new(MockPositioner::new());
            let relay: Arc<dyn Relay> = Arc::new(MockRelay::new());
            (stage, relay)
        };

    let instruments = Instruments {
        positioner,
        meter: Arc::new(MockSourceMeter::new(args.current)),
        relay,
        camera: Arc::new(MockFrameSource::new(scene.frame)),
    };
    let memory = MemoryGuard::for_current_process(config.scan.memory_ceiling_mb);
    let controller = ScanController::new(plan, instruments, recenterer, memory, &config);

    let mut events = controller.subscribe();
    if !controller.start().await? {
        return Err(anyhow!("scan did not start"));
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(event, ScanEvent::Stopped { .. }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event printer lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; stopping after the current point");
                controller.stop();
            }
        }
    }
    controller.wait().await;
    Ok(())
}

fn simulated_plan(args: &SimulateArgs) -> Result<ScanPlan> {
    let (x0, y0) = (10.0, 10.0);
    let right = x0 + args.pitch * f64::from(args.cols.saturating_sub(1));
    let bottom = y0 + args.pitch * f64::from(args.rows.saturating_sub(1));
    let anchors = GridAnchors {
        top_left: CalibrationAnchor::new(x0, y0, 1, 1).with_name(args.first_name.as_str()),
        top_right: CalibrationAnchor::new(right, y0, 1, args.cols),
        bottom_right: CalibrationAnchor::new(right, bottom, args.rows, args.cols),
    };
    Ok(ScanPlan::from_anchors(&anchors, args.rows, args.cols)?)
}
