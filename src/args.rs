//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;
use lovelace_scope::types::{Channel, SampleRate};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Serial port of the FTDI bridge (e.g. /dev/ttyUSB0 or COM3)
    #[arg(short, long)]
    pub port: Option<String>,
    #[arg(short, long, default_value_t = 115_200)]
    pub baud: u32,
    /// Use the built-in signal simulator instead of hardware
    #[arg(long, conflicts_with = "port")]
    pub simulate: bool,
    /// JSON configuration file; flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Sample rate label, e.g. "500 kHz"
    #[arg(long)]
    pub sample_rate: Option<SampleRate>,
    /// Samples per channel (1250, 2500, 5000 or 12500)
    #[arg(long)]
    pub depth: Option<usize>,
    /// Trigger level in ADC codes; free-running when omitted
    #[arg(long)]
    pub trigger_level: Option<u16>,
    /// Trigger source, CH1 or CH2
    #[arg(long, default_value = "CH1", value_parser = parse_channel)]
    pub trigger_channel: Channel,
    /// Trigger on the falling edge
    #[arg(long)]
    pub falling: bool,
    /// Trigger point within the capture, 0.0 to 1.0
    #[arg(long, default_value_t = 0.5)]
    pub trigger_position: f32,
    /// Stop after one capture
    #[arg(long)]
    pub single: bool,
    /// How long to acquire in continuous mode
    #[arg(long, default_value_t = 5)]
    pub seconds: u64,
    /// Print the available serial ports and exit
    #[arg(long)]
    pub list_ports: bool,
}

fn parse_channel(s: &str) -> Result<Channel, String> {
    match s.to_ascii_uppercase().as_str() {
        "CH1" | "A" => Ok(Channel::A),
        "CH2" | "B" => Ok(Channel::B),
        _ => Err(format!("unknown channel {s}, expected CH1 or CH2")),
    }
}
