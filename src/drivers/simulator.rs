//! Synthetic device for running without hardware.
//!
//! Emits valid v1 frames: a sine on channel A and a square wave of the same
//! frequency on channel B, both with uniform noise. Sample-rate commands
//! written to it change the apparent signal frequency like a real capture
//! would.
use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::thread;
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::error::TransportError;
use crate::drivers::frame::{LovelaceV1, SamplePair, V1_PAIRS};
use crate::drivers::transport::Transport;
use crate::types::SampleRate;

const SAMPLE_RATE_KIND: u8 = 6;
const REQUEST_KIND: u8 = 7;
const RESEND_KIND: u8 = 8;
const NEXT_KIND: u8 = 9;

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Frequency of the generated waveforms.
    pub signal_hz: f32,
    /// Peak amplitude in ADC codes around mid-scale.
    pub amplitude: f32,
    /// Peak uniform noise in ADC codes.
    pub noise: f32,
    /// Upper bound on frames produced per read.
    pub frames_per_read: usize,
    /// Sleep before each read, `None` to run as fast as possible.
    pub pace: Option<Duration>,
    /// Only send frames in answer to request/next/resend commands.
    pub handshake: bool,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            signal_hz: 1_000.0,
            amplitude: 90.0,
            noise: 3.0,
            frames_per_read: 8,
            pace: Some(Duration::from_millis(5)),
            handshake: false,
            seed: 0x5eed,
        }
    }
}

pub struct SimulatedTransport {
    config: SimulatorConfig,
    sample_rate: SampleRate,
    rng: StdRng,
    connected: bool,
    sequence: u8,
    /// Sample index, kept modulo one signal period.
    phase: f32,
    pending: VecDeque<u8>,
    last_frame: Vec<u8>,
    requested: usize,
}

impl SimulatedTransport {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            sample_rate: SampleRate::default(),
            rng,
            connected: false,
            sequence: 0,
            phase: 0.0,
            pending: VecDeque::new(),
            last_frame: Vec::new(),
            requested: 0,
        }
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    fn next_frame(&mut self) -> Vec<u8> {
        let cycle = self.sample_rate.hz() / self.config.signal_hz;
        let mut pairs = Vec::with_capacity(V1_PAIRS);
        for _ in 0..V1_PAIRS {
            let angle = TAU * self.phase / cycle;
            let square = if angle.sin() >= 0.0 { 1.0 } else { -1.0 };
            pairs.push(SamplePair::new(
                self.to_code(angle.sin()),
                self.to_code(square),
            ));
            self.phase += 1.0;
            if self.phase >= cycle {
                self.phase -= cycle;
            }
        }
        let frame = LovelaceV1.encode(self.sequence, &pairs);
        self.sequence = self.sequence.wrapping_add(1);
        frame
    }

    fn to_code(&mut self, unit: f32) -> u16 {
        let noise = if self.config.noise > 0.0 {
            self.rng.gen_range(-self.config.noise..=self.config.noise)
        } else {
            0.0
        };
        (128.0 + unit * self.config.amplitude + noise).round().clamp(0.0, 255.0) as u16
    }

    fn handle_command(&mut self, packet: &[u8]) {
        let (Some(&kind), Some(&payload)) = (packet.get(1), packet.get(3)) else {
            return;
        };
        match kind {
            SAMPLE_RATE_KIND => {
                if let Some(rate) = SampleRate::ALL.get(payload as usize) {
                    debug!("simulator sample rate -> {rate}");
                    self.sample_rate = *rate;
                    self.phase = 0.0;
                }
            }
            REQUEST_KIND | NEXT_KIND => self.requested += 1,
            RESEND_KIND => {
                let last = self.last_frame.clone();
                self.pending.extend(last);
            }
            _ => {}
        }
    }
}

impl Transport for SimulatedTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
        self.pending.clear();
        self.requested = 0;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(pace) = self.config.pace {
            thread::sleep(pace.min(timeout));
        }
        let mut produced = 0;
        while self.pending.len() < max_bytes && produced < self.config.frames_per_read {
            if self.config.handshake {
                if self.requested == 0 {
                    break;
                }
                self.requested -= 1;
            }
            let frame = self.next_frame();
            self.pending.extend(frame.iter().copied());
            self.last_frame = frame;
            produced += 1;
        }
        let take = max_bytes.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.handle_command(bytes);
        Ok(())
    }
}
