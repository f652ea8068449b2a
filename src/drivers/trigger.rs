//! Edge trigger state machine.
//!
//! One capture cycle runs `Armed -> Searching -> Found | TimedOut`. The
//! condition is a snapshot taken at [`TriggerEngine::arm`]; changes staged
//! while searching wait for the next cycle.
use crate::types::{Channel, Slope, TriggerConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerState {
    Armed,
    Searching,
    /// Index of the crossing sample in the stream scanned since arming.
    Found(usize),
    TimedOut,
}

/// Result of one [`TriggerEngine::scan`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanOutcome {
    pub state: TriggerState,
    /// Samples of the batch that were examined.
    pub consumed: usize,
}

pub struct TriggerEngine {
    config: Option<TriggerConfig>,
    staged: Option<Option<TriggerConfig>>,
    horizon: usize,
    state: TriggerState,
    previous: Option<u16>,
    scanned: usize,
}

/// Rising: `prev < level <= curr`. Falling: `prev >= level > curr`.
pub fn crosses(slope: Slope, level: u16, prev: u16, curr: u16) -> bool {
    match slope {
        Slope::Rising => prev < level && level <= curr,
        Slope::Falling => prev >= level && level > curr,
    }
}

impl TriggerEngine {
    pub fn new(config: Option<TriggerConfig>, horizon: usize) -> Self {
        Self {
            config,
            staged: None,
            horizon: horizon.max(1),
            state: TriggerState::Armed,
            previous: None,
            scanned: 0,
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// `None` when the trigger is disabled.
    pub fn config(&self) -> Option<&TriggerConfig> {
        self.config.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    pub fn channel(&self) -> Option<Channel> {
        self.config.map(|c| c.channel)
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn set_horizon(&mut self, horizon: usize) {
        self.horizon = horizon.max(1);
    }

    /// Applies now unless a search is in flight, otherwise at the next `arm`.
    pub fn stage(&mut self, config: Option<TriggerConfig>) {
        if self.state == TriggerState::Searching {
            self.staged = Some(config);
        } else {
            self.config = config;
            self.staged = None;
        }
    }

    /// Starts a new cycle, picking up any staged configuration.
    pub fn arm(&mut self) {
        if let Some(config) = self.staged.take() {
            self.config = config;
        }
        self.state = TriggerState::Armed;
        self.previous = None;
        self.scanned = 0;
    }

    /// Continues after a timeout without losing the last sample, so a
    /// crossing that straddles the restart is still seen.
    pub fn resume(&mut self) {
        self.state = TriggerState::Searching;
        self.scanned = 0;
    }

    /// Scans codes of the trigger channel until a crossing or the horizon.
    ///
    /// Terminal states consume nothing. A disabled trigger stays `Armed`.
    pub fn scan<I>(&mut self, codes: I) -> ScanOutcome
    where
        I: IntoIterator<Item = u16>,
    {
        let Some(config) = self.config else {
            return ScanOutcome {
                state: self.state,
                consumed: 0,
            };
        };
        let mut consumed = 0;
        for code in codes {
            match self.state {
                TriggerState::Armed => self.state = TriggerState::Searching,
                TriggerState::Searching => {}
                TriggerState::Found(_) | TriggerState::TimedOut => break,
            }
            consumed += 1;
            let index = self.scanned;
            self.scanned += 1;
            let hit = self
                .previous
                .map_or(false, |prev| crosses(config.slope, config.level, prev, code));
            self.previous = Some(code);
            if hit {
                self.state = TriggerState::Found(index);
            } else if self.scanned >= self.horizon {
                self.state = TriggerState::TimedOut;
            }
        }
        ScanOutcome {
            state: self.state,
            consumed,
        }
    }
}
