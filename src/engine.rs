// src/engine.rs
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{validate_depth, ScopeConfig};
use crate::drivers::buffer::{SnapshotCell, WaveformSnapshot};
use crate::drivers::fft::{SpectralCache, SpectralResult, WindowFunction};
use crate::drivers::frame::{FrameFormat, LovelaceV1};
use crate::drivers::pipeline::{AcquisitionPipeline, AcquisitionStats};
use crate::drivers::transport::Transport;
use crate::drivers::view::{ChannelStats, DisplayColumn, VerticalScale, ViewWindow};
use crate::drivers::ScopeError;
use crate::types::*;

const COMMAND_CAPACITY: usize = 32;
/// Commands applied per loop turn before the next pump.
const COMMANDS_PER_TURN: usize = 10;
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// State the worker publishes for readers on other threads.
struct ScopeShared {
    snapshots: Arc<SnapshotCell>,
    status: RwLock<ScopeStatus>,
    stats: RwLock<AcquisitionStats>,
    scales: RwLock<[VerticalScale; 2]>,
}

/// Handle to the acquisition worker.
///
/// Setting changes go to the worker over a bounded channel and are applied
/// between pumps. Reads only touch the last published capture.
pub struct ScopeController {
    commands: SyncSender<ScopeCommand>,
    events: Mutex<Receiver<ScopeEvent>>,
    shared: Arc<ScopeShared>,
    cancel: Arc<AtomicBool>,
    spectral: Mutex<SpectralCache>,
    max_code: u16,
    worker: Option<JoinHandle<()>>,
}

impl ScopeController {
    /// Spawns the worker for a device speaking the v1 frame format.
    pub fn spawn<T>(transport: T, config: ScopeConfig) -> Result<Self, ScopeError>
    where
        T: Transport + 'static,
    {
        Self::spawn_with_format(transport, Box::new(LovelaceV1), config)
    }

    pub fn spawn_with_format<T>(
        transport: T,
        format: Box<dyn FrameFormat>,
        config: ScopeConfig,
    ) -> Result<Self, ScopeError>
    where
        T: Transport + 'static,
    {
        let event_capacity = config.event_capacity;
        let scales = config.channel_scale;
        let max_code = format.max_code();
        let pipeline = AcquisitionPipeline::new(transport, format, config)?;
        let shared = Arc::new(ScopeShared {
            snapshots: pipeline.snapshots(),
            status: RwLock::new(pipeline.status().clone()),
            stats: RwLock::new(pipeline.stats()),
            scales: RwLock::new(scales),
        });
        let cancel = pipeline.cancel_flag();
        let (command_tx, command_rx) = mpsc::sync_channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::sync_channel(event_capacity);
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("scope-acquisition".into())
            .spawn(move || run_worker(pipeline, command_rx, event_tx, worker_shared))?;
        Ok(Self {
            commands: command_tx,
            events: Mutex::new(event_rx),
            shared,
            cancel,
            spectral: Mutex::new(SpectralCache::new()),
            max_code,
            worker: Some(worker),
        })
    }

    pub fn connect(&self) -> Result<(), ScopeError> {
        self.request(ScopeCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ScopeError> {
        self.request(ScopeCommand::Disconnect)
    }

    pub fn start(&self, mode: CaptureMode) -> Result<(), ScopeError> {
        self.request(|reply| ScopeCommand::Start(mode, reply))
    }

    /// Halts acquisition; the worker stops decoding at the next frame
    /// boundary.
    pub fn stop(&self) -> Result<(), ScopeError> {
        self.cancel.store(true, Ordering::Release);
        self.send(ScopeCommand::Stop)
    }

    /// Replaces the trigger condition; `None` free-runs.
    pub fn configure(&self, trigger: Option<TriggerConfig>) -> Result<(), ScopeError> {
        if let Some(config) = &trigger {
            config.validate(self.max_code)?;
        }
        self.spectral.lock().clear();
        self.request(|reply| ScopeCommand::SetTrigger(trigger, reply))
    }

    pub fn set_depth(&self, depth: usize) -> Result<(), ScopeError> {
        validate_depth(depth)?;
        self.spectral.lock().clear();
        self.request(|reply| ScopeCommand::SetDepth(depth, reply))
    }

    pub fn set_sample_rate(&self, rate: SampleRate) -> Result<(), ScopeError> {
        self.spectral.lock().clear();
        self.request(|reply| ScopeCommand::SetSampleRate(rate, reply))
    }

    pub fn set_timeout_policy(&self, policy: TimeoutPolicy) -> Result<(), ScopeError> {
        self.send(ScopeCommand::SetTimeoutPolicy(policy))
    }

    pub fn set_channel_scale(
        &self,
        channel: Channel,
        scale: VerticalScale,
    ) -> Result<(), ScopeError> {
        scale.validate()?;
        {
            // held across the swap so no spectrum of the old scale lands after the clear
            let mut cache = self.spectral.lock();
            self.shared.scales.write()[channel.index()] = scale;
            cache.clear();
        }
        self.send(ScopeCommand::SetChannelScale(channel, scale))
    }

    /// Clears a desynchronized stream so acquisition can start again.
    pub fn resync(&self) -> Result<(), ScopeError> {
        self.request(ScopeCommand::Resync)
    }

    /// Latest published capture.
    pub fn capture(&self) -> Arc<WaveformSnapshot> {
        self.shared.snapshots.load()
    }

    /// Raw codes of one channel of the latest capture.
    pub fn snapshot(&self, channel: Channel) -> Arc<[u16]> {
        Arc::clone(self.capture().channel(channel))
    }

    pub fn window(
        &self,
        channel: Channel,
        view: &ViewWindow,
        columns: usize,
    ) -> Result<Vec<DisplayColumn>, ScopeError> {
        let scale = self.scale(channel);
        self.capture().window(channel, view, columns, scale)
    }

    /// Spectrum of `region` (the whole capture when `None`) in volts.
    pub fn spectral(
        &self,
        channel: Channel,
        region: Option<Range<usize>>,
        window: WindowFunction,
    ) -> Result<SpectralResult, ScopeError> {
        let snapshot = self.capture();
        let codes = snapshot.channel(channel);
        let region = region.unwrap_or(0..codes.len());
        if region.is_empty() || region.end > codes.len() {
            return Err(ScopeError::InvalidView(format!(
                "spectral region {region:?} is outside the {} captured samples",
                codes.len()
            )));
        }
        let mut cache = self.spectral.lock();
        let scale = self.scale(channel);
        let result = cache.get_or_compute(
            snapshot.generation,
            channel,
            region.clone(),
            window,
            snapshot.sample_rate.hz(),
            || codes[region].iter().map(|&code| scale.apply(code)).collect(),
        );
        Ok(result)
    }

    /// Amplitude statistics and dominant frequency of the latest capture.
    pub fn measure(&self, channel: Channel) -> Result<ChannelStats, ScopeError> {
        let codes = self.snapshot(channel);
        let mut stats = ChannelStats::from_codes(&codes, self.scale(channel))
            .ok_or_else(|| ScopeError::InvalidView("nothing captured yet".into()))?;
        stats.dominant_frequency_hz = self
            .spectral(channel, None, WindowFunction::Hann)?
            .dominant_frequency();
        Ok(stats)
    }

    pub fn status(&self) -> ScopeStatus {
        self.shared.status.read().clone()
    }

    pub fn stats(&self) -> AcquisitionStats {
        *self.shared.stats.read()
    }

    /// Events raised since the last poll, oldest first.
    pub fn poll_events(&self) -> Vec<ScopeEvent> {
        self.events.lock().try_iter().collect()
    }

    fn scale(&self, channel: Channel) -> VerticalScale {
        self.shared.scales.read()[channel.index()]
    }

    fn send(&self, command: ScopeCommand) -> Result<(), ScopeError> {
        self.commands.send(command).map_err(|_| ScopeError::WorkerGone)
    }

    fn request<F>(&self, make: F) -> Result<(), ScopeError>
    where
        F: FnOnce(Reply) -> ScopeCommand,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.send(make(reply_tx))?;
        reply_rx.recv().map_err(|_| ScopeError::WorkerGone)?
    }
}

impl Drop for ScopeController {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.commands.send(ScopeCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("acquisition worker panicked");
            }
        }
    }
}

fn run_worker<T: Transport>(
    mut pipeline: AcquisitionPipeline<T>,
    commands: Receiver<ScopeCommand>,
    events: SyncSender<ScopeEvent>,
    shared: Arc<ScopeShared>,
) {
    info!("acquisition worker started");
    'outer: loop {
        for _ in 0..COMMANDS_PER_TURN {
            match commands.try_recv() {
                Ok(command) => {
                    if !apply(&mut pipeline, command, &shared, &events) {
                        break 'outer;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }
        if pipeline.is_running() {
            if let Err(err) = pipeline.pump_once() {
                debug!("pump ended the cycle: {err}");
            }
        } else {
            match commands.recv_timeout(IDLE_WAIT) {
                Ok(command) => {
                    if !apply(&mut pipeline, command, &shared, &events) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        publish(&mut pipeline, &shared, &events);
    }
    if pipeline.is_connected() {
        pipeline.disconnect();
    }
    publish(&mut pipeline, &shared, &events);
    info!("acquisition worker stopped");
}

/// Applies one command. Returns false on shutdown.
fn apply<T: Transport>(
    pipeline: &mut AcquisitionPipeline<T>,
    command: ScopeCommand,
    shared: &ScopeShared,
    events: &SyncSender<ScopeEvent>,
) -> bool {
    let (result, reply) = match command {
        ScopeCommand::Connect(reply) => (pipeline.connect(), Some(reply)),
        ScopeCommand::Disconnect(reply) => {
            pipeline.disconnect();
            (Ok(()), Some(reply))
        }
        ScopeCommand::Start(mode, reply) => (pipeline.start(mode), Some(reply)),
        ScopeCommand::Stop => {
            pipeline.stop();
            (Ok(()), None)
        }
        ScopeCommand::Resync(reply) => (pipeline.resync(), Some(reply)),
        ScopeCommand::SetTrigger(trigger, reply) => (pipeline.set_trigger(trigger), Some(reply)),
        ScopeCommand::SetDepth(depth, reply) => (pipeline.set_depth(depth), Some(reply)),
        ScopeCommand::SetSampleRate(rate, reply) => (pipeline.set_sample_rate(rate), Some(reply)),
        ScopeCommand::SetTimeoutPolicy(policy) => {
            pipeline.set_timeout_policy(policy);
            (Ok(()), None)
        }
        ScopeCommand::SetChannelScale(channel, scale) => {
            (pipeline.set_channel_scale(channel, scale), None)
        }
        ScopeCommand::Shutdown => return false,
    };
    publish(pipeline, shared, events);
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(err) = result {
                warn!("command failed: {err}");
            }
        }
    }
    true
}

fn publish<T: Transport>(
    pipeline: &mut AcquisitionPipeline<T>,
    shared: &ScopeShared,
    events: &SyncSender<ScopeEvent>,
) {
    *shared.stats.write() = pipeline.stats();
    *shared.status.write() = pipeline.status().clone();
    for event in pipeline.take_events() {
        match events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => debug!("event queue full, dropped {event:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::frame::{SamplePair, V1_PAIRS};
    use approx::assert_relative_eq;
    use crate::drivers::transport::{ManualHandle, ManualTransport};
    use std::f32::consts::TAU;
    use std::time::Instant;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn controller(config: ScopeConfig) -> (ScopeController, ManualHandle) {
        let transport = ManualTransport::new();
        let handle = transport.handle();
        (ScopeController::spawn(transport, config).unwrap(), handle)
    }

    /// 1 kHz sine at 64 kHz on A, constant on B.
    fn tone_frames(count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|f| {
                let pairs: Vec<SamplePair> = (0..V1_PAIRS)
                    .map(|i| {
                        let n = (f * V1_PAIRS + i) as f32;
                        let a = 128.0 + 100.0 * (TAU * 1000.0 * n / 64_000.0).sin();
                        SamplePair::new(a.round() as u16, 60)
                    })
                    .collect();
                LovelaceV1.encode(f as u8, &pairs)
            })
            .collect()
    }

    #[test]
    fn start_before_connect_is_refused() {
        let (scope, _) = controller(ScopeConfig::default());
        assert!(matches!(
            scope.start(CaptureMode::Single),
            Err(ScopeError::NotConnected)
        ));
        assert_eq!(scope.status(), ScopeStatus::Disconnected);
    }

    #[test]
    fn invalid_settings_are_rejected_without_clamping() {
        let (scope, handle) = controller(ScopeConfig::default());
        scope.connect().unwrap();
        handle.clear_written();
        let mut trigger = TriggerConfig::default();
        trigger.level = 400;
        assert!(matches!(
            scope.configure(Some(trigger)),
            Err(ScopeError::Configuration(_))
        ));
        assert!(matches!(
            scope.set_depth(25_000),
            Err(ScopeError::Capacity { .. })
        ));
        assert!(scope
            .set_channel_scale(Channel::A, VerticalScale { gain: f32::NAN, offset: 0.0 })
            .is_err());
        assert!(handle.written().is_empty());
    }

    #[test]
    fn single_capture_end_to_end() {
        let mut config = ScopeConfig::default();
        config.sample_rate = SampleRate::Khz500;
        let (scope, handle) = controller(config);
        scope.connect().unwrap();
        assert_eq!(scope.status(), ScopeStatus::Connected);
        scope.set_sample_rate(SampleRate::Khz50).unwrap();
        handle.push_chunks(tone_frames(6));
        scope.start(CaptureMode::Single).unwrap();
        assert!(wait_until(|| scope.capture().generation == 1));
        assert!(wait_until(|| scope.status() == ScopeStatus::Connected));

        let capture = scope.capture();
        assert_eq!(capture.len(), 1250);
        assert_eq!(capture.sample_rate, SampleRate::Khz50);
        assert_eq!(scope.snapshot(Channel::B)[0], 60);

        let columns = scope
            .window(Channel::A, &ViewWindow::full(capture.len()), 100)
            .unwrap();
        assert_eq!(columns.len(), 100);
        assert!(scope
            .window(Channel::A, &ViewWindow::new(1000, 500), 100)
            .is_err());

        let stats = scope.measure(Channel::A).unwrap();
        assert!(stats.peak_to_peak > 7.0 && stats.peak_to_peak < 8.0);
        // 64 samples per period at 50 kHz reads as 781.25 Hz
        let dominant = stats.dominant_frequency_hz.unwrap();
        assert!((dominant - 781.25).abs() < 50.0, "dominant {dominant}");

        let events = scope.poll_events();
        assert!(events.contains(&ScopeEvent::CaptureReady {
            generation: 1,
            triggered: false
        }));
        assert!(scope.poll_events().is_empty());
        assert_eq!(scope.stats().captures_completed, 1);
    }

    #[test]
    fn spectral_results_are_cached_per_capture() {
        let (scope, handle) = controller(ScopeConfig::default());
        scope.connect().unwrap();
        handle.push_chunks(tone_frames(5));
        scope.start(CaptureMode::Single).unwrap();
        assert!(wait_until(|| scope.capture().generation == 1));
        let first = scope.spectral(Channel::A, Some(0..1024), WindowFunction::Hann).unwrap();
        assert_eq!(first.transform_size, 1024);
        assert!(scope.spectral.lock().is_cached(1, Channel::A));
        scope.set_timeout_policy(TimeoutPolicy::KeepWaiting).unwrap();
        scope.set_sample_rate(SampleRate::Mhz5).unwrap();
        assert!(!scope.spectral.lock().is_cached(1, Channel::A));
        assert!(scope.spectral(Channel::A, Some(0..2000), WindowFunction::Hann).is_err());
        assert!(scope.spectral(Channel::A, Some(10..10), WindowFunction::Hann).is_err());
    }

    #[test]
    fn scale_change_never_leaves_a_stale_spectrum() {
        let (scope, handle) = controller(ScopeConfig::default());
        scope.connect().unwrap();
        handle.push_chunks(tone_frames(5));
        scope.start(CaptureMode::Single).unwrap();
        assert!(wait_until(|| scope.capture().generation == 1));
        let doubled = VerticalScale {
            gain: 2.0 * VerticalScale::default().gain,
            offset: 0.0,
        };
        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..200 {
                    scope.spectral(Channel::A, None, WindowFunction::Hann).unwrap();
                }
            });
            thread::sleep(Duration::from_millis(1));
            scope.set_channel_scale(Channel::A, doubled).unwrap();
        });
        let cached = scope.spectral(Channel::A, None, WindowFunction::Hann).unwrap();
        scope.spectral.lock().clear();
        let fresh = scope.spectral(Channel::A, None, WindowFunction::Hann).unwrap();
        assert_eq!(cached.bins.len(), fresh.bins.len());
        for (a, b) in cached.bins.iter().zip(&fresh.bins).skip(1) {
            assert_relative_eq!(a.magnitude, b.magnitude, epsilon = 1e-6);
        }
    }

    #[test]
    fn stop_halts_continuous_acquisition() {
        let (scope, handle) = controller(ScopeConfig::default());
        scope.connect().unwrap();
        scope.start(CaptureMode::Continuous).unwrap();
        handle.push_chunks(tone_frames(4));
        assert!(wait_until(|| handle.pending() == 0 && scope.capture().generation >= 1));
        assert!(scope.status().is_acquiring());
        scope.stop().unwrap();
        assert!(wait_until(|| scope.status() == ScopeStatus::Connected));
        handle.push_chunks(tone_frames(4));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.pending(), 4);
        scope.disconnect().unwrap();
        assert_eq!(scope.status(), ScopeStatus::Disconnected);
    }

    #[test]
    fn transport_fault_is_reported_and_recoverable() {
        let (scope, handle) = controller(ScopeConfig::default());
        scope.connect().unwrap();
        handle.push_failure("cable pulled");
        scope.start(CaptureMode::Continuous).unwrap();
        assert!(wait_until(|| matches!(
            scope.status(),
            ScopeStatus::AcquisitionFault { .. }
        )));
        scope.start(CaptureMode::Continuous).unwrap();
        assert!(scope.status().is_acquiring());
    }

    #[test]
    fn dropping_the_controller_stops_the_worker() {
        let (scope, handle) = controller(ScopeConfig::default());
        scope.connect().unwrap();
        scope.start(CaptureMode::Continuous).unwrap();
        drop(scope);
        // joined, so nothing reads the script any more
        handle.push_chunk(vec![0]);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.pending(), 1);
    }
}
