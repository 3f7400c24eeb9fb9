use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use log::info;

use videosoc_core::viewer::parse_key_script;
use videosoc_core::{BusLayer, HeadlessViewer, Platform, PlatformConfig, SocRunner};

#[derive(Parser, Debug)]
#[command(
    name = "videosoc",
    about = "Run the demo video SoC headless on a simulated timeline."
)]
struct Args {
    /// Platform configuration (JSON). Missing fields keep their defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Simulated time to run, in milliseconds.
    #[arg(long, default_value_t = 200)]
    run_ms: u64,

    /// Scripted host input, one entry per presented frame: l/r/u/d arrows,
    /// '-' release, 'q' quit.
    #[arg(long, value_name = "KEYS")]
    keys: Option<String>,

    /// Bus modelling style for every master (overrides the config file).
    #[arg(long, value_enum)]
    layer: Option<BusLayer>,

    /// Wire the filter straight to the display.
    #[arg(long, default_value_t = false)]
    no_demo: bool,

    /// Save the last presented frame as PNG.
    #[arg(long, value_name = "PATH")]
    dump_frame: Option<PathBuf>,

    /// Write register banks, bus statistics and counters as JSON.
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

fn load_config(args: &Args) -> anyhow::Result<PlatformConfig> {
    let mut config = match &args.config {
        Some(path) => PlatformConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PlatformConfig::default(),
    };
    if let Some(layer) = args.layer {
        config = config.with_layer(layer);
    }
    if args.no_demo {
        config = config.with_demo(false);
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    let script = args.keys.as_deref().map(parse_key_script).unwrap_or_default();
    let viewer = Rc::new(RefCell::new(HeadlessViewer::with_input(script)));
    let platform = Platform::build(config, viewer.clone()).context("assembling platform")?;
    let mut runner = SocRunner::new(platform);

    let outcome = runner.run_for(args.run_ms.saturating_mul(1_000_000));
    runner.shutdown();

    let counters = runner.platform().counters();
    info!(
        "ran {:.3} ms: {} frames presented, quit {}",
        outcome.elapsed_ns as f64 / 1e6,
        outcome.frames_presented,
        outcome.quit_requested
    );
    println!("{}", serde_json::to_string(&counters)?);

    if let Some(path) = &args.dump_frame {
        viewer
            .borrow()
            .save_png(path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    if let Some(path) = &args.snapshot {
        let snapshot = runner.platform().snapshot();
        fs::write(path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}
