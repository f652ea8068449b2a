//! Wire frames coming from the FPGA.
//!
//! The format is a fixed contract with the hardware project. It sits behind
//! [`FrameFormat`] so a protocol bump only means a new implementation here.
use std::time::SystemTime;

use crate::drivers::error::{DecodeError, MalformedKind};
use crate::types::Channel;

/// One simultaneous sample of both channels, as raw ADC codes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplePair {
    pub a: u16,
    pub b: u16,
}

impl SamplePair {
    pub fn new(a: u16, b: u16) -> Self {
        Self { a, b }
    }

    pub fn code(self, channel: Channel) -> u16 {
        match channel {
            Channel::A => self.a,
            Channel::B => self.b,
        }
    }
}

/// A decoded batch of dual-channel samples.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleFrame {
    pub sequence_id: u32,
    pub samples: Vec<SamplePair>,
    pub timestamp: SystemTime,
}

impl SampleFrame {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A versioned frame layout.
pub trait FrameFormat: Send {
    fn name(&self) -> &'static str;
    /// Total bytes of one frame on the wire.
    fn frame_len(&self) -> usize;
    fn pairs_per_frame(&self) -> usize;
    /// Largest ADC code a frame can carry.
    fn max_code(&self) -> u16;
    /// Sequence ids wrap at this value.
    fn sequence_modulus(&self) -> u32;
    /// Decodes the frame starting at `bytes[0]`. Never reads past `frame_len()`.
    fn decode(&self, bytes: &[u8]) -> Result<SampleFrame, DecodeError>;
    /// Offset of the next candidate sync marker in `bytes`.
    fn find_sync(&self, bytes: &[u8]) -> Option<usize>;
}

pub const V1_SYNC: u8 = 0x55;
pub const V1_VERSION: u8 = 0x01;
pub const V1_PAIRS: usize = 250;
const V1_HEADER: usize = 4;
pub const V1_FRAME_LEN: usize = V1_HEADER + V1_PAIRS * 2 + 1;

/// The 505-byte packet the current bitstream emits:
/// sync, sequence id, version, pair count, interleaved A/B bytes, checksum.
#[derive(Clone, Copy, Debug, Default)]
pub struct LovelaceV1;

impl LovelaceV1 {
    /// Builds a wire frame. Codes above 255 are truncated to their low byte.
    pub fn encode(&self, sequence_id: u8, pairs: &[SamplePair]) -> Vec<u8> {
        let mut out = Vec::with_capacity(V1_HEADER + pairs.len() * 2 + 1);
        out.push(V1_SYNC);
        out.push(sequence_id);
        out.push(V1_VERSION);
        out.push(pairs.len() as u8);
        for pair in pairs {
            out.push(pair.a as u8);
            out.push(pair.b as u8);
        }
        out.push(checksum(&out));
        out
    }
}

pub(crate) fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl FrameFormat for LovelaceV1 {
    fn name(&self) -> &'static str {
        "lovelace-v1"
    }

    fn frame_len(&self) -> usize {
        V1_FRAME_LEN
    }

    fn pairs_per_frame(&self) -> usize {
        V1_PAIRS
    }

    fn max_code(&self) -> u16 {
        u8::MAX as u16
    }

    fn sequence_modulus(&self) -> u32 {
        256
    }

    fn decode(&self, bytes: &[u8]) -> Result<SampleFrame, DecodeError> {
        let Some(&sync) = bytes.first() else {
            return Err(DecodeError::Truncated {
                needed: V1_FRAME_LEN,
                available: 0,
            });
        };
        if sync != V1_SYNC {
            return Err(DecodeError::Malformed(MalformedKind::BadSync(sync)));
        }
        if bytes.len() < V1_FRAME_LEN {
            return Err(DecodeError::Truncated {
                needed: V1_FRAME_LEN,
                available: bytes.len(),
            });
        }
        let frame = &bytes[..V1_FRAME_LEN];
        if frame[2] != V1_VERSION {
            return Err(DecodeError::Malformed(MalformedKind::UnsupportedVersion(
                frame[2],
            )));
        }
        if frame[3] as usize != V1_PAIRS {
            return Err(DecodeError::Malformed(MalformedKind::BadLength(
                frame[3] as usize,
            )));
        }
        let expected = checksum(&frame[..V1_FRAME_LEN - 1]);
        let actual = frame[V1_FRAME_LEN - 1];
        if expected != actual {
            return Err(DecodeError::Malformed(MalformedKind::Checksum {
                expected,
                actual,
            }));
        }
        let samples = frame[V1_HEADER..V1_FRAME_LEN - 1]
            .chunks_exact(2)
            .map(|pair| SamplePair::new(pair[0] as u16, pair[1] as u16))
            .collect();
        Ok(SampleFrame {
            sequence_id: frame[1] as u32,
            samples,
            timestamp: SystemTime::now(),
        })
    }

    fn find_sync(&self, bytes: &[u8]) -> Option<usize> {
        bytes.iter().position(|b| *b == V1_SYNC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn ramp() -> Vec<SamplePair> {
        (0..V1_PAIRS)
            .map(|i| SamplePair::new(i as u16, 255 - i as u16))
            .collect()
    }

    #[test]
    fn decodes_what_it_encodes() {
        let mut rng = StdRng::seed_from_u64(7);
        for seq in [0u8, 1, 254, 255] {
            let pairs: Vec<SamplePair> = (0..V1_PAIRS)
                .map(|_| SamplePair::new(rng.gen_range(0..=255), rng.gen_range(0..=255)))
                .collect();
            let bytes = LovelaceV1.encode(seq, &pairs);
            assert_eq!(bytes.len(), V1_FRAME_LEN);
            let frame = LovelaceV1.decode(&bytes).unwrap();
            assert_eq!(frame.sequence_id, seq as u32);
            assert_eq!(frame.samples, pairs);
        }
    }

    #[test]
    fn short_input_is_truncated_not_malformed() {
        let bytes = LovelaceV1.encode(3, &ramp());
        assert_eq!(
            LovelaceV1.decode(&bytes[..100]),
            Err(DecodeError::Truncated {
                needed: V1_FRAME_LEN,
                available: 100
            })
        );
        assert!(matches!(
            LovelaceV1.decode(&[]),
            Err(DecodeError::Truncated { available: 0, .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = LovelaceV1.encode(3, &ramp());
        bytes.extend_from_slice(&[V1_SYNC, 9, 9]);
        assert_eq!(LovelaceV1.decode(&bytes).unwrap().samples, ramp());
    }

    #[test]
    fn rejects_corruption() {
        let good = LovelaceV1.encode(3, &ramp());

        let mut bad_sync = good.clone();
        bad_sync[0] = 0xAA;
        assert_eq!(
            LovelaceV1.decode(&bad_sync),
            Err(DecodeError::Malformed(MalformedKind::BadSync(0xAA)))
        );

        let mut bad_sum = good.clone();
        bad_sum[10] ^= 0x01;
        assert!(matches!(
            LovelaceV1.decode(&bad_sum),
            Err(DecodeError::Malformed(MalformedKind::Checksum { .. }))
        ));

        let short = LovelaceV1.encode(3, &ramp()[..100]);
        let mut padded = short.clone();
        padded.resize(V1_FRAME_LEN, 0);
        assert_eq!(
            LovelaceV1.decode(&padded),
            Err(DecodeError::Malformed(MalformedKind::BadLength(100)))
        );

        let mut bad_version = good;
        bad_version[2] = 2;
        assert_eq!(
            LovelaceV1.decode(&bad_version),
            Err(DecodeError::Malformed(MalformedKind::UnsupportedVersion(2)))
        );
    }
}
