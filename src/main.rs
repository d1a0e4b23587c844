mod cli;

use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tcprtt::capture::engine::{self, CaptureEnd};
use tcprtt::config::{Config, ConfigError};
use tcprtt::display;
use tcprtt::flow::HostSet;
use tcprtt::metrics;
use tcprtt::pipeline::{self, DispatchConfig, PipelineParts, ReporterConfig};

fn main() {
    let args = cli::Cli::parse();

    // Initialize tracing/logging
    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    if args.list_interfaces {
        list_interfaces();
        return;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
        eprintln!("\nInterrupt received, stopping capture...");
    }) {
        eprintln!("error: failed to set Ctrl-C handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&config, &running) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// List available network interfaces and print them.
fn list_interfaces() {
    match engine::list_interfaces() {
        Ok(devices) => {
            println!("Available network interfaces:");
            println!("{:<20} {:<20} {}", "Name", "Description", "Addresses");
            println!("{}", "-".repeat(70));
            for device in &devices {
                let desc = device.desc.as_deref().unwrap_or("");
                let addrs: Vec<String> = device
                    .addresses
                    .iter()
                    .map(|a| format!("{}", a.addr))
                    .collect();
                println!("{:<20} {:<20} {}", device.name, desc, addrs.join(", "));
            }
            if devices.is_empty() {
                println!("  (no interfaces found, try running with sudo)");
            }
        }
        Err(e) => {
            eprintln!("error listing interfaces: {}", e);
            eprintln!("hint: try running with sudo");
        }
    }
}

/// Open the capture, start the pipeline and pump packets until interrupted
/// or the capture ends.
fn run(config: &Config, running: &Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let mut capture = engine::open(&config.capture)?;
    let sink = metrics::build_sink(&config.metrics)?;

    let parts = PipelineParts {
        config: config.pipeline.clone(),
        dispatch: DispatchConfig::from(&config.flow),
        reporter: ReporterConfig::new(&config.report, &config.flow, &config.metrics),
        hosts: HostSet::new(capture.hosts().iter().copied()),
        sink,
    };
    let mut pipeline = pipeline::spawn(parts, running.clone())?;

    println!("tcprtt v{}", env!("CARGO_PKG_VERSION"));
    println!("Capturing on: {}", capture.label());
    println!("Filter: {}", capture.filter());
    println!("Reporting every {}s (Ctrl-C to stop)...", config.report.interval_secs);

    // A file can be read faster than workers keep up; wait instead of dropping.
    let result = if capture.is_offline() {
        capture.pump(running, |packet| pipeline.submit_blocking(packet))
    } else {
        capture.pump(running, |packet| pipeline.submit(packet))
    };
    match &result {
        Ok(CaptureEnd::EndOfFile) => tracing::info!("end of capture file"),
        Ok(CaptureEnd::Stopped) => tracing::info!("capture stopped"),
        Err(_) => {}
    }
    capture.log_stats();

    // Drains the worker queues, then stops the reporter and timers.
    pipeline.shutdown();

    let flows: Vec<_> = pipeline
        .table()
        .snapshot()
        .iter()
        .map(|record| record.snapshot())
        .collect();
    for flow in flows.iter().filter(|f| f.total_samples > 0) {
        tracing::info!(
            flow = %flow.key,
            srtt_ns = flow.srtt_ns,
            jitter_ns = flow.jitter_ns,
            samples = flow.total_samples,
            last_seen_ns = flow.last_seen_ns,
            "final flow state"
        );
    }
    display::print_flow_summary(&flows, config.flow.smoothing());
    display::print_capture_summary(&pipeline.stats().snapshot(), flows.len());

    result.map(|_| ()).map_err(Into::into)
}

/// Merge the config file (if any) with CLI overrides.
fn load_config(args: &cli::Cli) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let capture = &mut config.capture;
    if let Some(value) = &args.interface {
        capture.interface = Some(value.clone());
    }
    if let Some(value) = &args.pcap_file {
        capture.pcap_file = Some(value.clone());
    }
    if let Some(value) = &args.filter {
        capture.filter = value.clone();
    }
    if let Some(value) = args.snaplen {
        capture.snaplen = value;
    }
    if let Some(value) = args.timeout_ms {
        capture.timeout_ms = value;
    }
    capture.ips.extend(args.ips.iter().copied());

    if let Some(value) = args.idle_ttl {
        config.flow.idle_ttl_secs = value;
    }
    if let Some(value) = args.exp_ttl {
        config.flow.exp_ttl_secs = value;
    }
    if args.soft {
        config.flow.soft = true;
    }
    if let Some(value) = args.interval {
        config.report.interval_secs = value;
    }

    let metrics = &mut config.metrics;
    if let Some(value) = args.sink {
        metrics.sink = value;
    }
    if let Some(value) = &args.statsd_addr {
        metrics.statsd_addr = value.clone();
    }
    if let Some(value) = &args.jsonl_path {
        metrics.jsonl_path = Some(value.clone());
    }
    if args.histograms {
        metrics.histograms = true;
    }
    metrics.tags.extend(args.tags.iter().cloned());

    if let Some(value) = args.workers {
        config.pipeline.workers = value;
    }

    config.validate()?;
    Ok(config)
}
