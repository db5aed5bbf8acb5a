//! Heteroflow CLI
//!
//! A demonstration CLI for the heteroflow library.

use anyhow::{bail, Context, Result};
use heteroflow::prelude::*;
use heteroflow::stages::StatisticsHandle;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("heteroflow");

    if args.len() < 2 {
        print_usage(program);
        return Ok(());
    }

    match args[1].as_str() {
        "devices" => {
            let config = load_config(args.get(2))?;
            init_logging(&config);
            list_devices(&config)
        }
        "demo" => {
            let config = load_config(args.get(2))?;
            init_logging(&config);
            run_demo(&config)
        }
        "help" | "--help" | "-h" => {
            print_usage(program);
            Ok(())
        }
        other => {
            print_usage(program);
            bail!("unknown command: {}", other)
        }
    }
}

fn print_usage(program: &str) {
    println!("{} v{}", heteroflow::NAME, heteroflow::VERSION);
    println!();
    println!("Usage: {} <command> [config.toml]", program);
    println!();
    println!("Commands:");
    println!("  devices [config]  List registered devices and the default compute device");
    println!("  demo [config]     Run pattern -> invert -> statistics through the driver");
    println!("  help              Show this help message");
    println!();
    println!("Logging follows [logging] level in the config; RUST_LOG overrides it.");
}

fn load_config(path: Option<&String>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(Path::new(path))
            .with_context(|| format!("loading configuration from {}", path)),
        None => Ok(EngineConfig::default()),
    }
}

fn init_logging(config: &EngineConfig) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
}

fn list_devices(config: &EngineConfig) -> Result<()> {
    let context = PipelineContext::from_config(config)?;
    let default = context.default_device();

    println!("Devices ({} registered):", context.devices().len());
    for device in context.devices().devices() {
        let caps = device.capabilities();
        let marker = if device == default { "*" } else { " " };
        println!(
            "  {} {} {:<16} kind={} channels={:?} peer_group={:?}",
            marker,
            device.id(),
            device.name(),
            caps.kind,
            caps.surface_channels,
            caps.peer_group
        );
    }
    println!();
    println!("Default compute device: {} ({:?} policy)", default, context.devices().policy());
    Ok(())
}

fn run_demo(config: &EngineConfig) -> Result<()> {
    let mut config = config.clone();
    if config.driver.max_timesteps.is_none() {
        config.driver.max_timesteps = Some(10);
    }
    let context = PipelineContext::from_config(&config)?;

    let mut pipeline = Pipeline::new("demo", context.clone());
    pipeline.add_stage("pattern", PatternSource::new(256, 256));
    pipeline.add_stage("invert", ImageKernel::invert());
    let sink = StatisticsSink::new();
    let stats: StatisticsHandle = sink.handle();
    pipeline.add_stage("statistics", sink);
    pipeline.connect("pattern", 0, "invert", 0)?;
    pipeline.connect("invert", 0, "statistics", 0)?;
    pipeline.validate()?;

    for (_, stage) in pipeline.stages() {
        stage.enable_runtime_measurements();
    }

    let driver = PipelineDriver::start(pipeline.sinks(), &context, &config.driver)
        .context("starting the pipeline driver")?;
    let events = driver.events().clone();
    let timesteps = driver.join();

    let mut failures = 0;
    for event in events.try_iter() {
        if let DriverEvent::Failed { timestep, error, .. } = event {
            failures += 1;
            eprintln!("timestep {}: {}", timestep, error);
        }
    }
    println!("Ran {} timesteps ({} failed)", timesteps, failures);

    if let Some(latest) = stats.latest() {
        println!(
            "Last frame: min {} max {} mean {:.3}",
            latest.stats.minimum, latest.stats.maximum, latest.stats.mean
        );
    }

    let mut report = serde_json::Map::new();
    for (name, measurement) in pipeline.runtime_report() {
        report.insert(name, serde_json::to_value(measurement)?);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failures > 0 && stats.frames() == 0 {
        bail!("no frame reached the statistics sink");
    }
    Ok(())
}
