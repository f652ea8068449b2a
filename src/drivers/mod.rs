// src/drivers/mod.rs
pub mod buffer;
pub mod command;
pub mod error;
pub mod fft;
pub mod frame;
pub mod pipeline;
pub mod simulator;
pub mod stream;
pub mod transport;
pub mod trigger;
pub mod view;

pub use buffer::{FillTarget, SnapshotCell, WaveformSnapshot, WaveformStore};
pub use command::DeviceCommand;
pub use error::{DecodeError, MalformedKind, ScopeError, TransportError};
pub use fft::{SpectralCache, SpectralEngine, SpectralResult, WindowFunction};
pub use frame::{FrameFormat, LovelaceV1, SampleFrame, SamplePair};
pub use pipeline::{AcquisitionPipeline, AcquisitionStats};
pub use simulator::{SimulatedTransport, SimulatorConfig};
pub use transport::{ManualHandle, ManualTransport, SerialTransport, Transport};
pub use trigger::{TriggerEngine, TriggerState};
pub use view::{ChannelStats, DisplayColumn, VerticalScale, ViewWindow};
