use serde::{Deserialize, Serialize};

use crate::drivers::error::ScopeError;

/// Linear ADC-code calibration: `code * gain + offset`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerticalScale {
    pub gain: f32,
    pub offset: f32,
}

impl Default for VerticalScale {
    fn default() -> Self {
        // 8-bit front end spanning -5 V..+5 V.
        Self {
            gain: 10.0 / 256.0,
            offset: -5.0,
        }
    }
}

impl VerticalScale {
    /// Raw codes, no calibration.
    pub const IDENTITY: VerticalScale = VerticalScale {
        gain: 1.0,
        offset: 0.0,
    };

    pub fn apply(&self, code: u16) -> f32 {
        code as f32 * self.gain + self.offset
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if !self.gain.is_finite() || self.gain == 0.0 || !self.offset.is_finite() {
            return Err(ScopeError::Configuration(format!(
                "invalid channel scale gain={} offset={}",
                self.gain, self.offset
            )));
        }
        Ok(())
    }
}

/// A pan/zoom window over a capture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewWindow {
    /// First sample shown.
    pub offset: usize,
    pub length: usize,
    /// Display zoom applied after calibration.
    pub vertical_scale: f32,
}

impl ViewWindow {
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            vertical_scale: 1.0,
        }
    }

    pub fn with_vertical_scale(mut self, vertical_scale: f32) -> Self {
        self.vertical_scale = vertical_scale;
        self
    }

    /// Whole-capture view.
    pub fn full(available: usize) -> Self {
        Self::new(0, available)
    }

    pub fn validate(&self, available: usize, columns: usize) -> Result<(), ScopeError> {
        if self.length == 0 {
            return Err(ScopeError::InvalidView("window length is zero".into()));
        }
        if columns == 0 {
            return Err(ScopeError::InvalidView("target width is zero".into()));
        }
        if !self.vertical_scale.is_finite() {
            return Err(ScopeError::InvalidView(format!(
                "vertical scale {} is not finite",
                self.vertical_scale
            )));
        }
        let end = self.offset.checked_add(self.length);
        if end.map_or(true, |end| end > available) {
            return Err(ScopeError::InvalidView(format!(
                "window {}..{} exceeds the {available} captured samples",
                self.offset,
                self.offset.saturating_add(self.length)
            )));
        }
        Ok(())
    }
}

/// One pixel column of a decimated trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayColumn {
    pub min: f32,
    pub max: f32,
}

/// Min/max decimation of `length` codes into at most `columns` columns.
///
/// Sample `i` goes to column `i * columns / length`, so every column covers a
/// contiguous run and no sample is skipped. With `length <= columns` each
/// sample is its own column.
pub fn decimate<I>(
    codes: I,
    length: usize,
    columns: usize,
    scale: VerticalScale,
    zoom: f32,
) -> Vec<DisplayColumn>
where
    I: IntoIterator<Item = u16>,
{
    let out_len = columns.min(length);
    let mut out: Vec<(u16, u16)> = Vec::with_capacity(out_len);
    for (i, code) in codes.into_iter().take(length).enumerate() {
        let column = i * out_len / length;
        if column == out.len() {
            out.push((code, code));
        } else if let Some(last) = out.last_mut() {
            last.0 = last.0.min(code);
            last.1 = last.1.max(code);
        }
    }
    out.into_iter()
        .map(|(lo, hi)| {
            let a = scale.apply(lo) * zoom;
            let b = scale.apply(hi) * zoom;
            DisplayColumn {
                min: a.min(b),
                max: a.max(b),
            }
        })
        .collect()
}

/// Amplitude statistics of one channel of a capture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelStats {
    pub max: f32,
    pub min: f32,
    pub peak_to_peak: f32,
    pub dominant_frequency_hz: Option<f32>,
}

impl ChannelStats {
    /// `None` for an empty channel.
    pub fn from_codes(codes: &[u16], scale: VerticalScale) -> Option<Self> {
        let lo = *codes.iter().min()?;
        let hi = *codes.iter().max()?;
        let a = scale.apply(lo);
        let b = scale.apply(hi);
        let (min, max) = (a.min(b), a.max(b));
        Some(Self {
            max,
            min,
            peak_to_peak: max - min,
            dominant_frequency_hz: None,
        })
    }
}
