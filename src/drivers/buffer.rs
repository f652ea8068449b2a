use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::config::MAX_DEPTH;
use crate::drivers::frame::{SampleFrame, SamplePair};
use crate::drivers::view::{decimate, DisplayColumn, VerticalScale, ViewWindow};
use crate::drivers::ScopeError;
use crate::types::{CaptureMode, Channel, SampleRate};

/// Where the current capture cycle ends, in samples since the last reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillTarget {
    pub end: u64,
    pub trigger_at: Option<u64>,
}

impl FillTarget {
    /// Places the trigger at `index_in_window` of a `depth`-sample window.
    pub fn triggered(trigger_at: u64, index_in_window: usize, depth: usize) -> Self {
        let post = depth.saturating_sub(index_in_window).max(1) as u64;
        Self {
            end: trigger_at + post,
            trigger_at: Some(trigger_at),
        }
    }

    pub fn untriggered(end: u64) -> Self {
        Self {
            end,
            trigger_at: None,
        }
    }
}

/// Immutable published capture. Cheap to clone.
#[derive(Clone, Debug)]
pub struct WaveformSnapshot {
    pub generation: u64,
    pub mode: CaptureMode,
    pub sample_rate: SampleRate,
    /// Index of the trigger sample, `None` for free-running captures.
    pub trigger_index: Option<usize>,
    pub captured_at: SystemTime,
    channels: [Arc<[u16]>; 2],
}

impl WaveformSnapshot {
    /// Placeholder published before the first capture.
    pub fn empty(sample_rate: SampleRate) -> Self {
        Self {
            generation: 0,
            mode: CaptureMode::Continuous,
            sample_rate,
            trigger_index: None,
            captured_at: SystemTime::now(),
            channels: [Arc::from(Vec::new()), Arc::from(Vec::new())],
        }
    }

    pub fn channel(&self, channel: Channel) -> &Arc<[u16]> {
        &self.channels[channel.index()]
    }

    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger_index.is_some()
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate.hz() as f64)
    }

    /// Time covered by the capture.
    pub fn duration(&self) -> Duration {
        self.sample_period() * self.len() as u32
    }

    /// Seconds of each sample relative to the trigger, or to the first
    /// sample when free-running.
    pub fn time_axis(&self) -> Vec<f64> {
        let period = 1.0 / self.sample_rate.hz() as f64;
        let zero = self.trigger_index.unwrap_or(0) as f64;
        (0..self.len())
            .map(|i| (i as f64 - zero) * period)
            .collect()
    }

    pub fn window(
        &self,
        channel: Channel,
        view: &ViewWindow,
        columns: usize,
        scale: VerticalScale,
    ) -> Result<Vec<DisplayColumn>, ScopeError> {
        let codes = self.channel(channel);
        view.validate(codes.len(), columns)?;
        let range = &codes[view.offset..view.offset + view.length];
        Ok(decimate(
            range.iter().copied(),
            view.length,
            columns,
            scale,
            view.vertical_scale,
        ))
    }
}

/// Latest published snapshot. Writers swap, readers clone the `Arc`.
pub struct SnapshotCell {
    current: RwLock<Arc<WaveformSnapshot>>,
}

impl SnapshotCell {
    pub fn new(initial: WaveformSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Arc<WaveformSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn publish(&self, snapshot: WaveformSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

/// Bounded per-channel sample store. Owned by the acquisition path.
pub struct WaveformStore {
    per_channel: [VecDeque<u16>; 2],
    capacity: usize,
    mode: CaptureMode,
    total: u64,
    target: Option<FillTarget>,
    frozen: bool,
    generation: u64,
}

impl WaveformStore {
    pub fn new(depth: usize, mode: CaptureMode) -> Result<Self, ScopeError> {
        check_capacity(depth)?;
        Ok(Self {
            per_channel: [VecDeque::with_capacity(depth), VecDeque::with_capacity(depth)],
            capacity: depth,
            mode,
            total: 0,
            target: None,
            frozen: false,
            generation: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.per_channel[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Samples accepted since the last reset.
    pub fn total_appended(&self) -> u64 {
        self.total
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn fill_target(&self) -> Option<FillTarget> {
        self.target
    }

    /// Discards all samples and starts over in `mode`.
    pub fn reset(&mut self, mode: CaptureMode) {
        for channel in &mut self.per_channel {
            channel.clear();
        }
        self.mode = mode;
        self.total = 0;
        self.target = None;
        self.frozen = false;
    }

    /// Changes the depth; implies a reset.
    pub fn resize(&mut self, depth: usize, mode: CaptureMode) -> Result<(), ScopeError> {
        check_capacity(depth)?;
        self.capacity = depth;
        for channel in &mut self.per_channel {
            *channel = VecDeque::with_capacity(depth);
        }
        self.reset(mode);
        Ok(())
    }

    pub fn append(&mut self, frame: &SampleFrame) -> usize {
        self.append_samples(&frame.samples)
    }

    /// Appends up to the fill target, evicting the oldest samples at
    /// capacity. Returns how many pairs were taken; a frozen store takes none.
    pub fn append_samples(&mut self, pairs: &[SamplePair]) -> usize {
        if self.frozen {
            return 0;
        }
        let room = self
            .target
            .map_or(pairs.len() as u64, |t| t.end.saturating_sub(self.total));
        let take = pairs.len().min(room as usize);
        for pair in &pairs[..take] {
            for (queue, code) in self.per_channel.iter_mut().zip([pair.a, pair.b]) {
                if queue.len() == self.capacity {
                    queue.pop_front();
                }
                queue.push_back(code);
            }
        }
        self.total += take as u64;
        take
    }

    pub fn set_fill_target(&mut self, target: FillTarget) {
        self.target = Some(target);
    }

    pub fn clear_fill_target(&mut self) {
        self.target = None;
    }

    pub fn capture_complete(&self) -> bool {
        self.target.map_or(false, |t| self.total >= t.end)
    }

    /// Makes the store read-only until the next reset.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn snapshot(&self, channel: Channel) -> Vec<u16> {
        self.per_channel[channel.index()].iter().copied().collect()
    }

    pub fn window(
        &self,
        channel: Channel,
        view: &ViewWindow,
        columns: usize,
        scale: VerticalScale,
    ) -> Result<Vec<DisplayColumn>, ScopeError> {
        let queue = &self.per_channel[channel.index()];
        view.validate(queue.len(), columns)?;
        Ok(decimate(
            queue.range(view.offset..view.offset + view.length).copied(),
            view.length,
            columns,
            scale,
            view.vertical_scale,
        ))
    }

    /// Copies the current contents into a new immutable snapshot.
    pub fn capture(&mut self, sample_rate: SampleRate) -> WaveformSnapshot {
        self.generation += 1;
        let first = self.total - self.len() as u64;
        let trigger_index = self
            .target
            .and_then(|t| t.trigger_at)
            .filter(|at| *at >= first)
            .map(|at| (at - first) as usize);
        WaveformSnapshot {
            generation: self.generation,
            mode: self.mode,
            sample_rate,
            trigger_index,
            captured_at: SystemTime::now(),
            channels: [
                Arc::from(self.snapshot(Channel::A)),
                Arc::from(self.snapshot(Channel::B)),
            ],
        }
    }
}

fn check_capacity(depth: usize) -> Result<(), ScopeError> {
    if depth == 0 {
        return Err(ScopeError::Configuration("depth must be non-zero".into()));
    }
    if depth > MAX_DEPTH {
        return Err(ScopeError::Capacity {
            requested: depth,
            max: MAX_DEPTH,
        });
    }
    Ok(())
}
