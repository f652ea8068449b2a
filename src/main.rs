// src/main.rs
mod args;

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use lovelace_scope::drivers::simulator::{SimulatedTransport, SimulatorConfig};
use lovelace_scope::drivers::transport::{available_ports, SerialTransport, Transport};
use lovelace_scope::types::{CaptureMode, Channel, ScopeEvent, ScopeStatus, Slope, TriggerConfig};
use lovelace_scope::{ScopeConfig, ScopeController};

use crate::args::Args;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_ports {
        for port in available_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    let config = build_config(&args)?;
    if args.simulate {
        run(SimulatedTransport::new(SimulatorConfig::default()), config, &args)
    } else {
        let Some(port) = args.port.clone() else {
            bail!("no device given: pass --port or --simulate");
        };
        run(SerialTransport::new(port, args.baud), config, &args)
    }
}

fn build_config(args: &Args) -> Result<ScopeConfig> {
    let mut config = match &args.config {
        Some(path) => ScopeConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ScopeConfig::default(),
    };
    if let Some(rate) = args.sample_rate {
        config.sample_rate = rate;
    }
    if let Some(depth) = args.depth {
        config.depth = depth;
    }
    if let Some(level) = args.trigger_level {
        config.trigger = Some(TriggerConfig {
            channel: args.trigger_channel,
            slope: if args.falling {
                Slope::Falling
            } else {
                Slope::Rising
            },
            level,
            position: args.trigger_position,
        });
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run<T: Transport + 'static>(transport: T, config: ScopeConfig, args: &Args) -> Result<()> {
    let scope = ScopeController::spawn(transport, config).context("failed to start acquisition")?;
    scope.connect().context("failed to connect to the scope")?;
    let mode = if args.single {
        CaptureMode::Single
    } else {
        CaptureMode::Continuous
    };
    scope.start(mode).context("failed to start capture")?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut single_done = false;
    while Instant::now() < deadline && !single_done {
        thread::sleep(POLL_INTERVAL);
        for event in scope.poll_events() {
            match event {
                ScopeEvent::CaptureReady { generation, triggered } => {
                    info!("capture {generation} ready (triggered: {triggered})");
                    single_done |= mode == CaptureMode::Single;
                }
                ScopeEvent::Status(ScopeStatus::Desynchronized) => {
                    warn!("stream lost sync, resynchronizing");
                    scope.resync()?;
                    scope.start(mode)?;
                }
                ScopeEvent::Status(ScopeStatus::AcquisitionFault { reason }) => {
                    bail!("acquisition failed: {reason}");
                }
                ScopeEvent::Status(status) => info!("status: {status:?}"),
            }
        }
    }
    scope.stop()?;

    let capture = scope.capture();
    if capture.is_empty() {
        warn!("no capture completed");
    } else {
        println!(
            "capture {}: {} samples at {} ({:?})",
            capture.generation,
            capture.len(),
            capture.sample_rate,
            capture.duration()
        );
        for channel in Channel::ALL {
            let stats = scope.measure(channel)?;
            let frequency = stats
                .dominant_frequency_hz
                .map_or_else(|| "-".to_string(), |hz| format!("{hz:.1} Hz"));
            println!(
                "{channel}: max {:.3} V, min {:.3} V, Vpp {:.3} V, freq {frequency}",
                stats.max, stats.min, stats.peak_to_peak
            );
        }
    }
    println!("{}", serde_json::to_string_pretty(&scope.stats())?);
    scope.disconnect()?;
    Ok(())
}
