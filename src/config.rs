// src/config.rs
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::command::depth_code;
use crate::drivers::view::VerticalScale;
use crate::drivers::ScopeError;
use crate::types::{SampleRate, TimeoutPolicy, TriggerConfig};

/// Per-channel storage ceiling (25 000 samples across both channels).
pub const MAX_DEPTH: usize = 12_500;

/// How the queue between transport reads and the decoder reacts when full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Keep reading, evict the oldest queued bytes.
    #[default]
    DropOldest,
    /// Read only as many bytes as fit.
    BlockProducer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowControl {
    /// The device pushes frames on its own.
    #[default]
    Streaming,
    /// Request / next-packet / resend handshake, one frame at a time.
    RequestPerFrame,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Samples kept per channel.
    pub depth: usize,
    pub sample_rate: SampleRate,
    /// `None` runs untriggered.
    pub trigger: Option<TriggerConfig>,
    /// Samples scanned before the trigger search times out.
    pub search_horizon: usize,
    pub timeout_policy: TimeoutPolicy,
    /// ADC code to volts, per channel.
    pub channel_scale: [VerticalScale; 2],
    pub flow_control: FlowControl,
    /// Largest single transport read.
    pub read_chunk: usize,
    pub read_timeout_ms: u64,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Frames in the malformed-rate window.
    pub malformed_window: usize,
    /// Fraction of the window that may be malformed before desync.
    pub malformed_threshold: f32,
    pub event_capacity: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            depth: 1250,
            sample_rate: SampleRate::default(),
            trigger: None,
            search_horizon: 50_000,
            timeout_policy: TimeoutPolicy::default(),
            channel_scale: [VerticalScale::default(); 2],
            flow_control: FlowControl::default(),
            read_chunk: 4096,
            read_timeout_ms: 50,
            queue_capacity: 64 * 1024,
            backpressure: BackpressurePolicy::default(),
            malformed_window: 32,
            malformed_threshold: 0.25,
            event_capacity: 64,
        }
    }
}

impl ScopeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScopeError> {
        let text = fs::read_to_string(path)?;
        let config: ScopeConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Checks everything that does not depend on the wire format.
    pub fn validate(&self) -> Result<(), ScopeError> {
        validate_depth(self.depth)?;
        if self.search_horizon == 0 {
            return Err(ScopeError::Configuration(
                "search horizon must be at least one sample".into(),
            ));
        }
        if self.read_chunk == 0 {
            return Err(ScopeError::Configuration("read chunk must be non-zero".into()));
        }
        if self.malformed_window == 0 {
            return Err(ScopeError::Configuration(
                "malformed window must hold at least one frame".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.malformed_threshold) {
            return Err(ScopeError::Configuration(format!(
                "malformed threshold {} is outside [0, 1)",
                self.malformed_threshold
            )));
        }
        if self.event_capacity == 0 {
            return Err(ScopeError::Configuration(
                "event capacity must be non-zero".into(),
            ));
        }
        for scale in &self.channel_scale {
            scale.validate()?;
        }
        Ok(())
    }
}

/// Depth checks shared by config loading and `set_depth`.
pub fn validate_depth(depth: usize) -> Result<(), ScopeError> {
    if depth == 0 {
        return Err(ScopeError::Configuration("depth must be non-zero".into()));
    }
    if depth > MAX_DEPTH {
        return Err(ScopeError::Capacity {
            requested: depth,
            max: MAX_DEPTH,
        });
    }
    depth_code(depth).map(|_| ())
}
