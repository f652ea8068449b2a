//! Host-to-FPGA command packets.
//!
//! Layout: `0x55, kind, payload length, payload.., checksum`, the checksum
//! being the byte sum of everything before it.
use crate::config::ScopeConfig;
use crate::drivers::error::ScopeError;
use crate::drivers::frame::checksum;
use crate::types::{Channel, SampleRate, Slope, TriggerConfig};

const COMMAND_SYNC: u8 = 0x55;
/// Trigger position payload meaning "trigger disabled".
const TRIGGER_DISABLED: u16 = 0xFFFF;

/// Depths the bitstream can be switched to, in device-code order.
pub const DEVICE_DEPTHS: [usize; 4] = [1250, 2500, 5000, 12500];

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DeviceCommand {
    TriggerThreshold(u8),
    TriggerSlope(Slope),
    /// Sample index of the trigger point, `None` disables the hardware trigger.
    TriggerPosition(Option<u16>),
    TriggerChannel(Channel),
    SampleRate(SampleRate),
    /// Start sending the first frame of a capture.
    Request,
    /// Repeat the last frame.
    Resend,
    /// Send the next frame.
    NextPacket,
    SampleDepth(usize),
}

impl DeviceCommand {
    pub fn kind(&self) -> u8 {
        match self {
            DeviceCommand::TriggerThreshold(_) => 2,
            DeviceCommand::TriggerSlope(_) => 3,
            DeviceCommand::TriggerPosition(_) => 4,
            DeviceCommand::TriggerChannel(_) => 5,
            DeviceCommand::SampleRate(_) => 6,
            DeviceCommand::Request => 7,
            DeviceCommand::Resend => 8,
            DeviceCommand::NextPacket => 9,
            DeviceCommand::SampleDepth(_) => 10,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, ScopeError> {
        let payload = match *self {
            DeviceCommand::TriggerThreshold(level) => vec![level],
            DeviceCommand::TriggerSlope(Slope::Rising) => vec![1],
            DeviceCommand::TriggerSlope(Slope::Falling) => vec![0],
            DeviceCommand::TriggerPosition(position) => {
                let raw = position.unwrap_or(TRIGGER_DISABLED);
                raw.to_be_bytes().to_vec()
            }
            DeviceCommand::TriggerChannel(channel) => vec![channel.index() as u8],
            DeviceCommand::SampleRate(rate) => vec![rate.code()],
            DeviceCommand::Request | DeviceCommand::Resend | DeviceCommand::NextPacket => {
                vec![1]
            }
            DeviceCommand::SampleDepth(depth) => vec![depth_code(depth)?],
        };
        Ok(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ScopeError> {
        let payload = self.payload()?;
        let mut packet = Vec::with_capacity(payload.len() + 4);
        packet.push(COMMAND_SYNC);
        packet.push(self.kind());
        packet.push(payload.len() as u8);
        packet.extend_from_slice(&payload);
        packet.push(checksum(&packet));
        Ok(packet)
    }
}

pub fn depth_code(depth: usize) -> Result<u8, ScopeError> {
    DEVICE_DEPTHS
        .iter()
        .position(|d| *d == depth)
        .map(|code| code as u8)
        .ok_or_else(|| {
            ScopeError::Configuration(format!(
                "depth {depth} is not one of the device depths {DEVICE_DEPTHS:?}"
            ))
        })
}

/// Commands describing the trigger part of the device state.
pub fn trigger_commands(
    trigger: Option<&TriggerConfig>,
    depth: usize,
) -> Result<Vec<DeviceCommand>, ScopeError> {
    let Some(trigger) = trigger else {
        return Ok(vec![DeviceCommand::TriggerPosition(None)]);
    };
    let level = u8::try_from(trigger.level).map_err(|_| {
        ScopeError::Configuration(format!(
            "trigger level {} does not fit the 8-bit threshold register",
            trigger.level
        ))
    })?;
    let position = u16::try_from(trigger.position_index(depth)).map_err(|_| {
        ScopeError::Configuration(format!("trigger position does not fit depth {depth}"))
    })?;
    Ok(vec![
        DeviceCommand::TriggerPosition(Some(position)),
        DeviceCommand::TriggerChannel(trigger.channel),
        DeviceCommand::TriggerThreshold(level),
        DeviceCommand::TriggerSlope(trigger.slope),
    ])
}

/// Full device state, written once after connecting.
pub fn settings_commands(config: &ScopeConfig) -> Result<Vec<DeviceCommand>, ScopeError> {
    let mut commands = vec![
        DeviceCommand::SampleRate(config.sample_rate),
        DeviceCommand::SampleDepth(config.depth),
    ];
    commands.extend(trigger_commands(config.trigger.as_ref(), config.depth)?);
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_packets_with_checksum() {
        assert_eq!(
            DeviceCommand::Request.encode().unwrap(),
            vec![0x55, 7, 1, 1, 0x55 + 7 + 1 + 1]
        );
        assert_eq!(
            DeviceCommand::TriggerSlope(Slope::Falling).encode().unwrap(),
            vec![0x55, 3, 1, 0, 0x55 + 3 + 1]
        );
        let threshold = DeviceCommand::TriggerThreshold(200).encode().unwrap();
        assert_eq!(threshold[..4], [0x55, 2, 1, 200]);
        assert_eq!(threshold[4], (0x55u32 + 2 + 1 + 200) as u8);
    }

    #[test]
    fn trigger_position_is_big_endian_and_disable_is_all_ones() {
        assert_eq!(
            DeviceCommand::TriggerPosition(Some(0x1234)).encode().unwrap()[..5],
            [0x55, 4, 2, 0x12, 0x34]
        );
        assert_eq!(
            DeviceCommand::TriggerPosition(None).encode().unwrap()[..5],
            [0x55, 4, 2, 0xFF, 0xFF]
        );
    }

    #[test]
    fn depth_must_be_a_device_depth() {
        assert_eq!(depth_code(5000).unwrap(), 2);
        assert!(DeviceCommand::SampleDepth(1000).encode().is_err());
        assert_eq!(
            DeviceCommand::SampleDepth(12500).encode().unwrap()[..4],
            [0x55, 10, 1, 3]
        );
    }

    #[test]
    fn settings_follow_device_order() {
        let mut config = ScopeConfig::default();
        config.trigger = Some(TriggerConfig {
            channel: Channel::B,
            slope: Slope::Falling,
            level: 90,
            position: 0.0,
        });
        let commands = settings_commands(&config).unwrap();
        assert_eq!(
            commands,
            vec![
                DeviceCommand::SampleRate(config.sample_rate),
                DeviceCommand::SampleDepth(config.depth),
                DeviceCommand::TriggerPosition(Some(0)),
                DeviceCommand::TriggerChannel(Channel::B),
                DeviceCommand::TriggerThreshold(90),
                DeviceCommand::TriggerSlope(Slope::Falling),
            ]
        );
        config.trigger = None;
        assert_eq!(
            settings_commands(&config).unwrap()[2..],
            [DeviceCommand::TriggerPosition(None)]
        );
    }
}
