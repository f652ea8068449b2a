use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{validate_depth, FlowControl, ScopeConfig};
use crate::drivers::buffer::{FillTarget, SnapshotCell, WaveformSnapshot, WaveformStore};
use crate::drivers::command::{settings_commands, trigger_commands, DeviceCommand};
use crate::drivers::error::{DecodeError, ScopeError};
use crate::drivers::frame::{FrameFormat, SamplePair};
use crate::drivers::stream::{ByteQueue, DecodeHealth};
use crate::drivers::transport::Transport;
use crate::drivers::trigger::{TriggerEngine, TriggerState};
use crate::drivers::view::VerticalScale;
use crate::types::{
    CaptureMode, Channel, SampleRate, ScopeEvent, ScopeStatus, TimeoutPolicy, TriggerConfig,
};

/// Counters kept by the acquisition path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AcquisitionStats {
    pub frames_decoded: u64,
    pub malformed_frames: u64,
    pub sequence_gaps: u64,
    /// Bytes evicted by queue backpressure.
    pub bytes_dropped: u64,
    /// Bytes skipped while looking for the next sync marker.
    pub bytes_skipped: u64,
    /// Frames decoded after a single capture froze.
    pub frames_discarded: u64,
    pub captures_completed: u64,
    /// Smoothed captures per second.
    pub capture_rate_hz: f32,
}

/// Transport, decoder, trigger and store glued together. Single-threaded;
/// the engine drives it one [`pump_once`](Self::pump_once) at a time.
pub struct AcquisitionPipeline<T: Transport> {
    transport: T,
    format: Box<dyn FrameFormat>,
    config: ScopeConfig,
    queue: ByteQueue,
    health: DecodeHealth,
    trigger: TriggerEngine,
    store: WaveformStore,
    snapshots: Arc<SnapshotCell>,
    cancel: Arc<AtomicBool>,
    running: bool,
    desynchronized: bool,
    /// Set after a malformed frame until the next good decode; false syncs
    /// met on the way are skipped without counting.
    hunting: bool,
    /// Absolute sample index where the current trigger scan began.
    scan_base: u64,
    last_sequence: Option<u32>,
    status: ScopeStatus,
    events: Vec<ScopeEvent>,
    stats: AcquisitionStats,
    last_capture_at: Option<Instant>,
    smoothed_period: f32,
}

impl<T: Transport> AcquisitionPipeline<T> {
    pub fn new(
        transport: T,
        format: Box<dyn FrameFormat>,
        config: ScopeConfig,
    ) -> Result<Self, ScopeError> {
        config.validate()?;
        if config.queue_capacity < format.frame_len() {
            return Err(ScopeError::Configuration(format!(
                "queue capacity {} cannot hold one {}-byte {} frame",
                config.queue_capacity,
                format.frame_len(),
                format.name()
            )));
        }
        if let Some(trigger) = &config.trigger {
            trigger.validate(format.max_code())?;
        }
        let store = WaveformStore::new(config.depth, CaptureMode::Continuous)?;
        Ok(Self {
            transport,
            queue: ByteQueue::new(config.queue_capacity, config.backpressure),
            health: DecodeHealth::new(config.malformed_window, config.malformed_threshold),
            trigger: TriggerEngine::new(config.trigger, config.search_horizon),
            store,
            snapshots: Arc::new(SnapshotCell::new(WaveformSnapshot::empty(config.sample_rate))),
            cancel: Arc::new(AtomicBool::new(false)),
            running: false,
            desynchronized: false,
            hunting: false,
            scan_base: 0,
            last_sequence: None,
            status: ScopeStatus::Disconnected,
            events: Vec::new(),
            stats: AcquisitionStats::default(),
            last_capture_at: None,
            smoothed_period: 0.0,
            format,
            config,
        })
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn format(&self) -> &dyn FrameFormat {
        self.format.as_ref()
    }

    pub fn status(&self) -> &ScopeStatus {
        &self.status
    }

    pub fn stats(&self) -> AcquisitionStats {
        let mut stats = self.stats;
        stats.bytes_dropped = self.queue.dropped();
        stats
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Cell holding the latest published capture; shared with readers.
    pub fn snapshots(&self) -> Arc<SnapshotCell> {
        Arc::clone(&self.snapshots)
    }

    pub fn latest(&self) -> Arc<WaveformSnapshot> {
        self.snapshots.load()
    }

    /// Flag that makes the decode loop bail out between frames.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Events raised since the last call.
    pub fn take_events(&mut self) -> Vec<ScopeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn connect(&mut self) -> Result<(), ScopeError> {
        if self.transport.is_connected() {
            return Ok(());
        }
        self.transport.open()?;
        for command in settings_commands(&self.config)? {
            if let Err(err) = self.send(command) {
                self.transport.close();
                return Err(err);
            }
        }
        info!(
            "connected: {} at {}, depth {}",
            self.format.name(),
            self.config.sample_rate,
            self.config.depth
        );
        self.queue.clear();
        self.health.reset();
        self.desynchronized = false;
        self.hunting = false;
        self.set_status(ScopeStatus::Connected);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.running = false;
        self.transport.close();
        self.queue.clear();
        self.set_status(ScopeStatus::Disconnected);
        info!("disconnected");
    }

    /// Begins a capture cycle in `mode`, discarding the store contents.
    pub fn start(&mut self, mode: CaptureMode) -> Result<(), ScopeError> {
        if !self.transport.is_connected() {
            return Err(ScopeError::NotConnected);
        }
        if self.desynchronized {
            return Err(ScopeError::Desynchronized {
                malformed: self.health.malformed(),
                window: self.health.window(),
            });
        }
        self.store.reset(mode);
        self.trigger.arm();
        self.scan_base = 0;
        self.health.reset();
        self.hunting = false;
        self.last_sequence = None;
        self.cancel.store(false, Ordering::Release);
        if self.config.flow_control == FlowControl::RequestPerFrame {
            self.send(DeviceCommand::Request)?;
        }
        self.running = true;
        info!("acquisition started ({mode:?})");
        self.set_status(ScopeStatus::Armed);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.running {
            info!("acquisition stopped");
        }
        self.running = false;
        if self.transport.is_connected() && !self.desynchronized {
            self.set_status(ScopeStatus::Connected);
        }
    }

    /// Drops buffered bytes and the malformed history after a desync.
    pub fn resync(&mut self) -> Result<(), ScopeError> {
        if !self.transport.is_connected() {
            return Err(ScopeError::NotConnected);
        }
        let dropped = self.queue.len();
        self.queue.clear();
        self.health.reset();
        self.hunting = false;
        self.last_sequence = None;
        self.desynchronized = false;
        self.running = false;
        info!("resynchronized, {dropped} buffered bytes dropped");
        self.set_status(ScopeStatus::Connected);
        Ok(())
    }

    /// Replaces the trigger condition. A search in flight keeps the old one.
    pub fn set_trigger(&mut self, trigger: Option<TriggerConfig>) -> Result<(), ScopeError> {
        if let Some(config) = &trigger {
            config.validate(self.format.max_code())?;
        }
        let commands = trigger_commands(trigger.as_ref(), self.config.depth)?;
        self.trigger.stage(trigger);
        self.config.trigger = trigger;
        self.send_if_connected(commands)
    }

    /// Changes the storage depth. Implies a store reset; a running
    /// acquisition re-arms.
    pub fn set_depth(&mut self, depth: usize) -> Result<(), ScopeError> {
        validate_depth(depth)?;
        let mut commands = vec![DeviceCommand::SampleDepth(depth)];
        commands.extend(trigger_commands(self.config.trigger.as_ref(), depth)?);
        self.store.resize(depth, self.store.mode())?;
        self.config.depth = depth;
        if self.running {
            self.trigger.arm();
            self.scan_base = 0;
            self.set_status(ScopeStatus::Armed);
        }
        self.send_if_connected(commands)
    }

    pub fn set_sample_rate(&mut self, rate: SampleRate) -> Result<(), ScopeError> {
        self.config.sample_rate = rate;
        self.send_if_connected(vec![DeviceCommand::SampleRate(rate)])
    }

    pub fn set_timeout_policy(&mut self, policy: TimeoutPolicy) {
        self.config.timeout_policy = policy;
    }

    pub fn set_channel_scale(
        &mut self,
        channel: Channel,
        scale: VerticalScale,
    ) -> Result<(), ScopeError> {
        scale.validate()?;
        self.config.channel_scale[channel.index()] = scale;
        Ok(())
    }

    /// One read from the transport and everything that can be decoded from
    /// the queue. Returns the newest capture published during this call.
    pub fn pump_once(&mut self) -> Result<Option<Arc<WaveformSnapshot>>, ScopeError> {
        if !self.running || self.cancel.load(Ordering::Acquire) {
            return Ok(None);
        }
        let captures_before = self.stats.captures_completed;
        let appended_before = self.store.total_appended();
        let budget = self.queue.read_budget(self.config.read_chunk);
        if budget > 0 {
            match self.transport.read(budget, self.config.read_timeout()) {
                Ok(bytes) => {
                    let discarded = self.queue.extend(&bytes);
                    if discarded > 0 {
                        debug!("queue full, {discarded} oldest bytes dropped");
                    }
                }
                Err(err) => {
                    warn!("transport read failed: {err}");
                    return Err(self.fault(err.into()));
                }
            }
        }
        self.decode_available()?;
        if self.running
            && !self.trigger.is_enabled()
            && self.store.mode() == CaptureMode::Continuous
            && self.store.total_appended() != appended_before
        {
            self.complete_capture();
        }
        if self.stats.captures_completed != captures_before {
            Ok(Some(self.snapshots.load()))
        } else {
            Ok(None)
        }
    }

    fn decode_available(&mut self) -> Result<(), ScopeError> {
        let frame_len = self.format.frame_len();
        loop {
            if self.cancel.load(Ordering::Acquire) {
                debug!("decode interrupted by stop request");
                return Ok(());
            }
            match self.format.decode(self.queue.as_slice()) {
                Ok(frame) => {
                    self.queue.consume(frame_len);
                    self.hunting = false;
                    self.health.record(true);
                    self.stats.frames_decoded += 1;
                    self.track_sequence(frame.sequence_id);
                    if !self.running {
                        self.stats.frames_discarded += 1;
                        continue;
                    }
                    self.ingest(&frame.samples);
                    if self.running && self.config.flow_control == FlowControl::RequestPerFrame {
                        self.send_flow(DeviceCommand::NextPacket)?;
                    }
                }
                Err(DecodeError::Truncated { .. }) => return Ok(()),
                Err(DecodeError::Malformed(kind)) => {
                    let skipped = self.queue.skip_to_next_sync(self.format.as_ref());
                    self.stats.bytes_skipped += skipped as u64;
                    if self.hunting {
                        debug!("false sync ({kind}), skipped {skipped} bytes");
                        continue;
                    }
                    self.hunting = true;
                    self.stats.malformed_frames += 1;
                    debug!("malformed frame ({kind}), skipped {skipped} bytes");
                    if self.health.record(false) {
                        return Err(self.desync());
                    }
                    if self.running && self.config.flow_control == FlowControl::RequestPerFrame {
                        self.send_flow(DeviceCommand::Resend)?;
                    }
                }
            }
        }
    }

    /// Halts acquisition on a transport failure and reports it.
    fn fault(&mut self, err: ScopeError) -> ScopeError {
        self.running = false;
        self.set_status(ScopeStatus::AcquisitionFault {
            reason: err.to_string(),
        });
        err
    }

    fn desync(&mut self) -> ScopeError {
        let malformed = self.health.malformed();
        let window = self.health.window();
        warn!("stream desynchronized: {malformed} of the last {window} frames malformed");
        self.running = false;
        self.desynchronized = true;
        self.set_status(ScopeStatus::Desynchronized);
        ScopeError::Desynchronized { malformed, window }
    }

    fn track_sequence(&mut self, id: u32) {
        let modulus = self.format.sequence_modulus();
        if let Some(previous) = self.last_sequence {
            let expected = (previous + 1) % modulus;
            if id != expected {
                let missing = (id + modulus - expected) % modulus;
                debug!("sequence gap: expected {expected}, got {id} ({missing} missing)");
                self.stats.sequence_gaps += 1;
            }
        }
        self.last_sequence = Some(id);
    }

    /// Feeds one frame's samples through the trigger into the store, closing
    /// as many capture cycles as the samples complete.
    fn ingest(&mut self, samples: &[SamplePair]) {
        let mut rest = samples;
        while !rest.is_empty() && self.running {
            if self.store.fill_target().is_none() {
                match self.trigger.channel() {
                    Some(channel) => {
                        if let Some(consumed) = self.scan(rest, channel) {
                            let taken = self.store.append_samples(&rest[..consumed]);
                            rest = &rest[taken..];
                            self.trigger.resume();
                            self.scan_base = self.store.total_appended();
                            continue;
                        }
                    }
                    None if self.store.mode() == CaptureMode::Single => {
                        let depth = self.store.capacity() as u64;
                        self.store
                            .set_fill_target(FillTarget::untriggered(self.scan_base + depth));
                    }
                    None => {}
                }
            }
            let taken = self.store.append_samples(rest);
            rest = &rest[taken..];
            if self.store.capture_complete() {
                self.complete_capture();
            } else if taken == 0 {
                break;
            }
        }
    }

    /// Runs the trigger over `rest`. Sets the fill target on a hit or a
    /// free-running timeout; returns the consumed count when the search
    /// should resume after those samples instead.
    fn scan(&mut self, rest: &[SamplePair], channel: Channel) -> Option<usize> {
        let outcome = self.trigger.scan(rest.iter().map(|pair| pair.code(channel)));
        match outcome.state {
            TriggerState::Armed => None,
            TriggerState::Searching => {
                self.set_status(ScopeStatus::Searching);
                None
            }
            TriggerState::Found(offset) => {
                let depth = self.store.capacity();
                let index = self
                    .trigger
                    .config()
                    .map_or(0, |config| config.position_index(depth));
                let at = self.scan_base + offset as u64;
                if at < index as u64 {
                    debug!("crossing at sample {at} has less than {index} samples before it");
                    self.set_status(ScopeStatus::Searching);
                    return Some(outcome.consumed);
                }
                self.store
                    .set_fill_target(FillTarget::triggered(at, index, depth));
                self.set_status(ScopeStatus::Found { offset });
                None
            }
            TriggerState::TimedOut => {
                self.set_status(ScopeStatus::TimedOut);
                match self.config.timeout_policy {
                    TimeoutPolicy::FreeRun => {
                        let depth = self.store.capacity() as u64;
                        let end = (self.scan_base + self.trigger.horizon() as u64).max(depth);
                        self.store.set_fill_target(FillTarget::untriggered(end));
                        None
                    }
                    TimeoutPolicy::KeepWaiting => {
                        debug!("trigger search timed out, still waiting");
                        Some(outcome.consumed)
                    }
                }
            }
        }
    }

    fn complete_capture(&mut self) {
        let snapshot = self.store.capture(self.config.sample_rate);
        let generation = snapshot.generation;
        let triggered = snapshot.is_triggered();
        self.snapshots.publish(snapshot);
        self.events
            .push(ScopeEvent::CaptureReady { generation, triggered });
        self.stats.captures_completed += 1;
        self.update_capture_rate();
        match self.store.mode() {
            CaptureMode::Single => {
                self.store.freeze();
                self.running = false;
                info!("single capture {generation} complete");
                self.set_status(ScopeStatus::Connected);
            }
            CaptureMode::Continuous => {
                self.store.clear_fill_target();
                self.trigger.arm();
                self.scan_base = self.store.total_appended();
                if self.trigger.is_enabled() {
                    self.set_status(ScopeStatus::Armed);
                }
            }
        }
    }

    fn update_capture_rate(&mut self) {
        let now = Instant::now();
        if let Some(previous) = self.last_capture_at.replace(now) {
            let period = now.duration_since(previous).as_secs_f32();
            self.smoothed_period = if self.smoothed_period == 0.0 {
                period
            } else {
                0.9 * self.smoothed_period + 0.1 * period
            };
            if self.smoothed_period > 0.0 {
                self.stats.capture_rate_hz = 1.0 / self.smoothed_period;
            }
        }
    }

    fn set_status(&mut self, status: ScopeStatus) {
        if self.status != status {
            debug!("status {:?} -> {:?}", self.status, status);
            self.status = status.clone();
            self.events.push(ScopeEvent::Status(status));
        }
    }

    fn send(&mut self, command: DeviceCommand) -> Result<(), ScopeError> {
        let packet = command.encode()?;
        self.transport.write(&packet)?;
        Ok(())
    }

    /// Flow-control writes made while acquiring; a failure faults the cycle.
    fn send_flow(&mut self, command: DeviceCommand) -> Result<(), ScopeError> {
        self.send(command).map_err(|err| {
            warn!("flow-control write failed: {err}");
            self.fault(err)
        })
    }

    fn send_if_connected(&mut self, commands: Vec<DeviceCommand>) -> Result<(), ScopeError> {
        if !self.transport.is_connected() {
            return Ok(());
        }
        for command in commands {
            self.send(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::frame::{LovelaceV1, V1_PAIRS, V1_SYNC};
    use crate::drivers::transport::{ManualHandle, ManualTransport};
    use crate::types::Slope;

    fn pipeline(config: ScopeConfig) -> (AcquisitionPipeline<ManualTransport>, ManualHandle) {
        let transport = ManualTransport::new();
        let handle = transport.handle();
        let pipeline = AcquisitionPipeline::new(transport, Box::new(LovelaceV1), config).unwrap();
        (pipeline, handle)
    }

    /// Encodes channel A codes into frames; channel B carries `255 - a`.
    fn frames(codes: &[u16]) -> Vec<Vec<u8>> {
        codes
            .chunks(V1_PAIRS)
            .enumerate()
            .map(|(i, chunk)| {
                let pairs: Vec<SamplePair> =
                    chunk.iter().map(|&a| SamplePair::new(a, 255 - a)).collect();
                LovelaceV1.encode(i as u8, &pairs)
            })
            .collect()
    }

    /// A frame with no sync byte after its first.
    fn clean_frame(seq: u8) -> Vec<u8> {
        (0u16..)
            .map(|v| LovelaceV1.encode(seq, &vec![SamplePair::new(v, v); V1_PAIRS]))
            .find(|bytes| !bytes[1..].contains(&V1_SYNC))
            .unwrap()
    }

    fn corrupt(mut bytes: Vec<u8>) -> Vec<u8> {
        let last = bytes.len() - 1;
        bytes[last] = bytes[last].wrapping_add(1);
        if bytes[last] == V1_SYNC {
            bytes[last] = bytes[last].wrapping_add(1);
        }
        bytes
    }

    fn pump_all(pipeline: &mut AcquisitionPipeline<ManualTransport>, handle: &ManualHandle) {
        while handle.pending() > 0 && pipeline.is_running() {
            pipeline.pump_once().unwrap();
        }
    }

    fn trigger(level: u16, position: f32) -> TriggerConfig {
        TriggerConfig {
            channel: Channel::A,
            slope: Slope::Rising,
            level,
            position,
        }
    }

    #[test]
    fn start_requires_a_connection() {
        let (mut pipeline, _) = pipeline(ScopeConfig::default());
        assert!(matches!(
            pipeline.start(CaptureMode::Single),
            Err(ScopeError::NotConnected)
        ));
        assert!(pipeline.pump_once().unwrap().is_none());
    }

    #[test]
    fn connect_writes_device_settings_in_order() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(trigger(100, 0.0));
        config.sample_rate = SampleRate::Khz500;
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        let kinds: Vec<u8> = handle.written().iter().map(|packet| packet[1]).collect();
        assert_eq!(kinds, vec![6, 10, 4, 5, 2, 3]);
        assert_eq!(handle.written()[0][3], SampleRate::Khz500.code());
        assert_eq!(pipeline.take_events(), vec![ScopeEvent::Status(ScopeStatus::Connected)]);
    }

    #[test]
    fn failed_open_stays_disconnected() {
        let transport = ManualTransport::new().failing_open();
        let mut pipeline =
            AcquisitionPipeline::new(transport, Box::new(LovelaceV1), ScopeConfig::default())
                .unwrap();
        assert!(matches!(pipeline.connect(), Err(ScopeError::Transport(_))));
        assert_eq!(pipeline.status(), &ScopeStatus::Disconnected);
    }

    #[test]
    fn untriggered_single_takes_the_first_depth_samples() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        let codes: Vec<u16> = (0..1500).map(|i| (i % 200) as u16).collect();
        handle.push_chunk(frames(&codes).concat());
        pipeline.start(CaptureMode::Single).unwrap();
        let published = pipeline.pump_once().unwrap().unwrap();
        assert!(!pipeline.is_running());
        assert_eq!(published.len(), 1250);
        assert_eq!(published.trigger_index, None);
        assert_eq!(&published.channel(Channel::A)[..], &codes[..1250]);
        assert_eq!(published.channel(Channel::B)[0], 255);
        let stats = pipeline.stats();
        assert_eq!(stats.frames_decoded, 6);
        assert_eq!(stats.frames_discarded, 1);
        assert_eq!(stats.captures_completed, 1);
        let events = pipeline.take_events();
        assert!(events.contains(&ScopeEvent::CaptureReady {
            generation: 1,
            triggered: false
        }));
        assert_eq!(pipeline.status(), &ScopeStatus::Connected);
    }

    #[test]
    fn triggered_single_aligns_the_crossing() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(trigger(128, 0.5));
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        let codes: Vec<u16> = (0..3000).map(|i| if i < 2000 { 10 } else { 200 }).collect();
        handle.push_chunks(frames(&codes));
        pipeline.start(CaptureMode::Single).unwrap();
        pump_all(&mut pipeline, &handle);
        let snapshot = pipeline.latest();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.len(), 1250);
        assert_eq!(snapshot.trigger_index, Some(624));
        let a = snapshot.channel(Channel::A);
        assert_eq!(a[623], 10);
        assert_eq!(a[624], 200);
        assert!(pipeline
            .take_events()
            .contains(&ScopeEvent::Status(ScopeStatus::Found { offset: 2000 })));
    }

    #[test]
    fn early_crossing_waits_for_pre_trigger_history() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(trigger(128, 0.5));
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        let codes: Vec<u16> = (0..3000)
            .map(|i| match i {
                0..=9 => 10,
                10..=999 => 200,
                1000..=1499 => 10,
                _ => 200,
            })
            .collect();
        handle.push_chunks(frames(&codes));
        pipeline.start(CaptureMode::Single).unwrap();
        pump_all(&mut pipeline, &handle);
        let snapshot = pipeline.latest();
        assert_eq!(snapshot.len(), 1250);
        assert_eq!(snapshot.trigger_index, Some(624));
        let a = snapshot.channel(Channel::A);
        assert_eq!((a[623], a[624]), (10, 200));
        let events = pipeline.take_events();
        assert!(!events.contains(&ScopeEvent::Status(ScopeStatus::Found { offset: 10 })));
        // offset counts from the sample after the rejected crossing
        assert!(events.contains(&ScopeEvent::Status(ScopeStatus::Found { offset: 1489 })));
    }

    #[test]
    fn continuous_trigger_rearms_after_each_capture() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(trigger(128, 0.0));
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        let codes: Vec<u16> = (0..5000)
            .map(|i| if i % 500 >= 250 { 200 } else { 10 })
            .collect();
        handle.push_chunks(frames(&codes));
        pipeline.start(CaptureMode::Continuous).unwrap();
        let mut generations = Vec::new();
        while handle.pending() > 0 {
            if let Some(snapshot) = pipeline.pump_once().unwrap() {
                let a = snapshot.channel(Channel::A);
                assert_eq!(snapshot.trigger_index, Some(0));
                assert_eq!((a[0], a[249], a[250], a[500]), (200, 200, 10, 200));
                generations.push(snapshot.generation);
            }
        }
        assert_eq!(generations, vec![1, 2, 3]);
        assert_eq!(pipeline.stats().captures_completed, 3);
        assert!(pipeline.is_running());
    }

    #[test]
    fn untriggered_continuous_publishes_every_pump() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        let codes: Vec<u16> = (0..2000).map(|i| (i % 256) as u16).collect();
        handle.push_chunks(frames(&codes));
        pipeline.start(CaptureMode::Continuous).unwrap();
        let mut published = 0;
        while handle.pending() > 0 {
            if pipeline.pump_once().unwrap().is_some() {
                published += 1;
            }
        }
        assert_eq!(published, 8);
        let snapshot = pipeline.latest();
        assert_eq!(snapshot.len(), 1250);
        assert_eq!(&snapshot.channel(Channel::A)[..], &codes[750..]);
        // an empty read publishes nothing new
        assert!(pipeline.pump_once().unwrap().is_none());
    }

    #[test]
    fn free_run_timeout_accepts_an_unaligned_window() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(trigger(250, 0.5));
        config.search_horizon = 600;
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        handle.push_chunks(frames(&[100; 1500]));
        pipeline.start(CaptureMode::Single).unwrap();
        pump_all(&mut pipeline, &handle);
        let snapshot = pipeline.latest();
        assert_eq!(snapshot.len(), 1250);
        assert_eq!(snapshot.trigger_index, None);
        let events = pipeline.take_events();
        assert!(events.contains(&ScopeEvent::Status(ScopeStatus::TimedOut)));
        assert!(events.contains(&ScopeEvent::CaptureReady {
            generation: 1,
            triggered: false
        }));
    }

    #[test]
    fn keep_waiting_reports_timeouts_until_a_crossing() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(trigger(128, 0.0));
        config.search_horizon = 300;
        config.timeout_policy = TimeoutPolicy::KeepWaiting;
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        let codes: Vec<u16> = (0..2500).map(|i| if i < 1000 { 10 } else { 200 }).collect();
        handle.push_chunks(frames(&codes));
        pipeline.start(CaptureMode::Single).unwrap();
        pump_all(&mut pipeline, &handle);
        let events = pipeline.take_events();
        let timeouts = events
            .iter()
            .filter(|e| **e == ScopeEvent::Status(ScopeStatus::TimedOut))
            .count();
        assert_eq!(timeouts, 3);
        assert!(events.contains(&ScopeEvent::Status(ScopeStatus::Found { offset: 100 })));
        let snapshot = pipeline.latest();
        assert_eq!(snapshot.trigger_index, Some(0));
        assert_eq!(snapshot.channel(Channel::A)[0], 200);
    }

    #[test]
    fn sparse_corruption_is_tolerated() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        let stream: Vec<u8> = (0..40u8)
            .map(|i| {
                let frame = clean_frame(i);
                if i % 5 == 4 {
                    corrupt(frame)
                } else {
                    frame
                }
            })
            .collect::<Vec<_>>()
            .concat();
        handle.push_chunk(stream);
        pipeline.start(CaptureMode::Continuous).unwrap();
        while handle.pending() > 0 {
            pipeline.pump_once().unwrap();
        }
        let stats = pipeline.stats();
        assert_eq!(stats.malformed_frames, 8);
        assert_eq!(stats.frames_decoded, 32);
        assert_eq!(pipeline.status(), &ScopeStatus::Armed);
        assert!(pipeline.is_running());
    }

    #[test]
    fn sync_bytes_in_a_bad_frame_count_once() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        // channel A sits on the sync code, so every other payload byte is 0x55
        let mut stream = frames(&[V1_SYNC as u16; V1_PAIRS * 40]);
        stream[20] = corrupt(stream[20].clone());
        handle.push_chunk(stream.concat());
        pipeline.start(CaptureMode::Continuous).unwrap();
        while handle.pending() > 0 {
            pipeline.pump_once().unwrap();
        }
        let stats = pipeline.stats();
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.frames_decoded, 39);
        assert_eq!(stats.sequence_gaps, 1);
        assert_eq!(stats.bytes_skipped, 505);
        assert_eq!(pipeline.status(), &ScopeStatus::Armed);
        assert!(pipeline.is_running());
    }

    #[test]
    fn dense_corruption_desynchronizes_until_resync() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        let stream: Vec<u8> = (0..40u8)
            .map(|i| {
                let frame = clean_frame(i);
                if i % 2 == 1 {
                    corrupt(frame)
                } else {
                    frame
                }
            })
            .collect::<Vec<_>>()
            .concat();
        handle.push_chunk(stream);
        pipeline.start(CaptureMode::Continuous).unwrap();
        let mut result = Ok(None);
        while handle.pending() > 0 && result.is_ok() {
            result = pipeline.pump_once();
        }
        assert!(matches!(
            result,
            Err(ScopeError::Desynchronized { malformed: 9, window: 32 })
        ));
        assert_eq!(pipeline.status(), &ScopeStatus::Desynchronized);
        assert!(!pipeline.is_running());
        assert!(matches!(
            pipeline.start(CaptureMode::Continuous),
            Err(ScopeError::Desynchronized { .. })
        ));
        pipeline.resync().unwrap();
        assert_eq!(pipeline.status(), &ScopeStatus::Connected);
        pipeline.start(CaptureMode::Continuous).unwrap();
    }

    #[test]
    fn request_per_frame_drives_the_handshake() {
        let mut config = ScopeConfig::default();
        config.flow_control = FlowControl::RequestPerFrame;
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        handle.clear_written();
        pipeline.start(CaptureMode::Continuous).unwrap();
        handle.push_chunk([clean_frame(0), clean_frame(1), corrupt(clean_frame(2))].concat());
        pipeline.pump_once().unwrap();
        let kinds: Vec<u8> = handle.written().iter().map(|packet| packet[1]).collect();
        assert_eq!(kinds, vec![7, 9, 9, 8]);
    }

    #[test]
    fn transport_failure_faults_and_allows_restart() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        handle.push_failure("cable pulled");
        pipeline.start(CaptureMode::Continuous).unwrap();
        assert!(matches!(
            pipeline.pump_once(),
            Err(ScopeError::Transport(_))
        ));
        assert!(matches!(
            pipeline.status(),
            ScopeStatus::AcquisitionFault { .. }
        ));
        assert!(!pipeline.is_running());
        pipeline.start(CaptureMode::Continuous).unwrap();
        assert_eq!(pipeline.status(), &ScopeStatus::Armed);
    }

    #[test]
    fn flow_control_write_failure_faults() {
        let mut config = ScopeConfig::default();
        config.flow_control = FlowControl::RequestPerFrame;
        let (mut pipeline, handle) = pipeline(config);
        pipeline.connect().unwrap();
        pipeline.start(CaptureMode::Continuous).unwrap();
        handle.fail_writes("endpoint stalled");
        handle.push_chunk(clean_frame(0));
        assert!(matches!(
            pipeline.pump_once(),
            Err(ScopeError::Transport(_))
        ));
        assert!(matches!(
            pipeline.status(),
            ScopeStatus::AcquisitionFault { .. }
        ));
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.stats().frames_decoded, 1);
        handle.restore_writes();
        pipeline.start(CaptureMode::Continuous).unwrap();
        assert_eq!(pipeline.status(), &ScopeStatus::Armed);
    }

    #[test]
    fn failed_cycle_keeps_the_last_capture() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        handle.push_chunks(frames(&[42; 1250]));
        pipeline.start(CaptureMode::Single).unwrap();
        pump_all(&mut pipeline, &handle);
        assert_eq!(pipeline.latest().generation, 1);
        handle.push_failure("gone");
        pipeline.start(CaptureMode::Single).unwrap();
        assert!(pipeline.pump_once().is_err());
        let kept = pipeline.latest();
        assert_eq!(kept.generation, 1);
        assert_eq!(kept.channel(Channel::A)[0], 42);
    }

    #[test]
    fn sequence_gaps_are_counted_not_fatal() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        handle.push_chunk([clean_frame(0), clean_frame(1), clean_frame(3)].concat());
        pipeline.start(CaptureMode::Continuous).unwrap();
        pipeline.pump_once().unwrap();
        let stats = pipeline.stats();
        assert_eq!(stats.frames_decoded, 3);
        assert_eq!(stats.sequence_gaps, 1);
    }

    #[test]
    fn cancel_flag_stops_between_frames() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        pipeline.connect().unwrap();
        handle.push_chunk(frames(&[1; 1000]).concat());
        pipeline.start(CaptureMode::Continuous).unwrap();
        pipeline.cancel_flag().store(true, Ordering::Release);
        assert!(pipeline.pump_once().unwrap().is_none());
        assert_eq!(pipeline.stats().frames_decoded, 0);
        pipeline.stop();
        assert_eq!(pipeline.status(), &ScopeStatus::Connected);
    }

    #[test]
    fn settings_changes_are_validated_and_written() {
        let (mut pipeline, handle) = pipeline(ScopeConfig::default());
        assert!(pipeline.set_trigger(Some(trigger(300, 0.5))).is_err());
        assert!(matches!(
            pipeline.set_depth(20_000),
            Err(ScopeError::Capacity { .. })
        ));
        pipeline.connect().unwrap();
        handle.clear_written();
        pipeline.set_depth(5000).unwrap();
        pipeline.set_sample_rate(SampleRate::Khz50).unwrap();
        let kinds: Vec<u8> = handle.written().iter().map(|packet| packet[1]).collect();
        assert_eq!(kinds, vec![10, 4, 6]);
        assert_eq!(pipeline.config().depth, 5000);
        assert!(pipeline
            .set_channel_scale(Channel::B, VerticalScale { gain: 0.0, offset: 0.0 })
            .is_err());
    }

    #[test]
    fn tiny_queue_is_rejected() {
        let mut config = ScopeConfig::default();
        config.queue_capacity = 100;
        assert!(AcquisitionPipeline::new(ManualTransport::new(), Box::new(LovelaceV1), config).is_err());
    }
}
