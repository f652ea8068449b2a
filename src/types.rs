// src/types.rs
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::SyncSender;

use serde::{Deserialize, Serialize};

use crate::drivers::view::VerticalScale;
use crate::drivers::ScopeError;

/// Analog input channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::A, Channel::B];

    pub fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::A => write!(f, "CH1"),
            Channel::B => write!(f, "CH2"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slope {
    Rising,
    Falling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Sliding window, oldest samples evicted.
    Continuous,
    /// Freeze once the capture is filled; read-only until the next start.
    Single,
}

/// What to do when the trigger search horizon runs out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeoutPolicy {
    /// Accept the most recent window without trigger alignment.
    #[default]
    FreeRun,
    /// Report the timeout and keep searching.
    KeepWaiting,
}

/// Trigger condition. Applied as a whole between capture cycles.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub channel: Channel,
    pub slope: Slope,
    /// Threshold in ADC codes.
    pub level: u16,
    /// Where the crossing lands in the captured window, 0.0 = first sample.
    pub position: f32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            channel: Channel::A,
            slope: Slope::Rising,
            level: 128,
            position: 0.5,
        }
    }
}

impl TriggerConfig {
    /// Rejects levels the wire format cannot produce and positions outside [0, 1].
    pub fn validate(&self, max_code: u16) -> Result<(), ScopeError> {
        if self.level > max_code {
            return Err(ScopeError::Configuration(format!(
                "trigger level {} is above the largest ADC code {max_code}",
                self.level
            )));
        }
        if !(0.0..=1.0).contains(&self.position) {
            return Err(ScopeError::Configuration(format!(
                "trigger position {} is outside [0, 1]",
                self.position
            )));
        }
        Ok(())
    }

    /// Index of the trigger point inside a window of `depth` samples.
    pub fn position_index(&self, depth: usize) -> usize {
        if depth == 0 {
            return 0;
        }
        ((self.position * (depth - 1) as f32).floor() as usize).min(depth - 1)
    }
}

/// Sample rates selectable on the FPGA, in device-code order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleRate {
    #[default]
    Mhz25,
    Mhz12_5,
    Mhz5,
    Mhz2_5,
    Mhz1_25,
    Khz500,
    Khz250,
    Khz125,
    Khz50,
    Khz25,
    Khz12_5,
    Khz5,
    Khz2_5,
    Khz1_25,
    Hz500,
}

impl SampleRate {
    pub const ALL: [SampleRate; 15] = [
        SampleRate::Mhz25,
        SampleRate::Mhz12_5,
        SampleRate::Mhz5,
        SampleRate::Mhz2_5,
        SampleRate::Mhz1_25,
        SampleRate::Khz500,
        SampleRate::Khz250,
        SampleRate::Khz125,
        SampleRate::Khz50,
        SampleRate::Khz25,
        SampleRate::Khz12_5,
        SampleRate::Khz5,
        SampleRate::Khz2_5,
        SampleRate::Khz1_25,
        SampleRate::Hz500,
    ];

    /// Device code sent in the sample-rate command.
    pub fn code(self) -> u8 {
        Self::ALL
            .iter()
            .position(|r| *r == self)
            .map(|p| p as u8)
            .unwrap_or(0)
    }

    pub fn hz(self) -> f32 {
        match self {
            SampleRate::Mhz25 => 25e6,
            SampleRate::Mhz12_5 => 12.5e6,
            SampleRate::Mhz5 => 5e6,
            SampleRate::Mhz2_5 => 2.5e6,
            SampleRate::Mhz1_25 => 1.25e6,
            SampleRate::Khz500 => 500e3,
            SampleRate::Khz250 => 250e3,
            SampleRate::Khz125 => 125e3,
            SampleRate::Khz50 => 50e3,
            SampleRate::Khz25 => 25e3,
            SampleRate::Khz12_5 => 12.5e3,
            SampleRate::Khz5 => 5e3,
            SampleRate::Khz2_5 => 2.5e3,
            SampleRate::Khz1_25 => 1.25e3,
            SampleRate::Hz500 => 500.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SampleRate::Mhz25 => "25 MHz",
            SampleRate::Mhz12_5 => "12.5 MHz",
            SampleRate::Mhz5 => "5 MHz",
            SampleRate::Mhz2_5 => "2.5 MHz",
            SampleRate::Mhz1_25 => "1.25 MHz",
            SampleRate::Khz500 => "500 kHz",
            SampleRate::Khz250 => "250 kHz",
            SampleRate::Khz125 => "125 kHz",
            SampleRate::Khz50 => "50 kHz",
            SampleRate::Khz25 => "25 kHz",
            SampleRate::Khz12_5 => "12.5 kHz",
            SampleRate::Khz5 => "5 kHz",
            SampleRate::Khz2_5 => "2.5 kHz",
            SampleRate::Khz1_25 => "1.25 kHz",
            SampleRate::Hz500 => "500 Hz",
        }
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SampleRate {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ScopeError::Configuration(format!("unknown sample rate: {wanted}")))
    }
}

/// Status surface reported to the presentation layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ScopeStatus {
    Disconnected,
    Connected,
    Armed,
    Searching,
    Found { offset: usize },
    TimedOut,
    Desynchronized,
    AcquisitionFault { reason: String },
}

impl ScopeStatus {
    /// True while a capture cycle is in progress.
    pub fn is_acquiring(&self) -> bool {
        matches!(
            self,
            ScopeStatus::Armed | ScopeStatus::Searching | ScopeStatus::TimedOut
        )
    }
}

/// Messages from the acquisition worker to the presentation layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ScopeEvent {
    Status(ScopeStatus),
    CaptureReady { generation: u64, triggered: bool },
}

pub(crate) type Reply = SyncSender<Result<(), ScopeError>>;

/// Commands from the presentation layer to the acquisition worker.
pub(crate) enum ScopeCommand {
    Connect(Reply),
    Disconnect(Reply),
    Start(CaptureMode, Reply),
    Stop,
    Resync(Reply),
    SetTrigger(Option<TriggerConfig>, Reply),
    SetDepth(usize, Reply),
    SetSampleRate(SampleRate, Reply),
    SetTimeoutPolicy(TimeoutPolicy),
    SetChannelScale(Channel, VerticalScale),
    Shutdown,
}
