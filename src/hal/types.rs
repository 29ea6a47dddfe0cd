use serde::{Deserialize, Serialize};

/// Channels per RHS2116 chip
pub const RHS2116_CHANNELS: usize = 16;

/// Raw RHS2116 payload: 16 AC codes then 16 DC codes, all `u16` LE
pub const RHS2116_PAYLOAD_BYTES: usize = RHS2116_CHANNELS * 2 * 2;

/// AC amplifier resolution (µV per code)
pub const AC_STEP_UV: f32 = 0.195;
pub const AC_OFFSET: i32 = 32768;

/// DC amplifier resolution (mV per code)
pub const DC_STEP_MV: f32 = -19.23;
pub const DC_OFFSET: i32 = 512;

/// ONI device type identifiers used by this system
pub mod type_id {
    pub const HEARTBEAT: u32 = 12;
    pub const FMC: u32 = 23;
    pub const RHS2116: u32 = 31;
}

/// One row of the hardware device table enumerated at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_index: u32,
    pub type_id: u32,
    pub firmware_version: u32,
    /// Frame payload size in bytes
    pub read_size: usize,
    pub write_size: usize,
}

/// One raw frame as delivered by `read_frame`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDeviceFrame {
    pub device_index: u32,
    /// Acquisition-clock ticks at capture
    pub clock_ticks: u64,
    pub payload: Vec<u8>,
}

impl RawDeviceFrame {
    pub fn new(device_index: u32, clock_ticks: u64, payload: Vec<u8>) -> Self {
        Self {
            device_index,
            clock_ticks,
            payload,
        }
    }
}

/// Decoded samples of one RHS2116 frame, in hardware channel order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rhs2116Sample {
    pub ac_uv: [f32; RHS2116_CHANNELS],
    pub dc_mv: [f32; RHS2116_CHANNELS],
}

impl Rhs2116Sample {
    /// Decode a raw payload. Returns `None` if the payload is too short.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < RHS2116_PAYLOAD_BYTES {
            return None;
        }

        let mut ac_uv = [0.0f32; RHS2116_CHANNELS];
        let mut dc_mv = [0.0f32; RHS2116_CHANNELS];
        let dc_base = RHS2116_CHANNELS * 2;

        for ch in 0..RHS2116_CHANNELS {
            let ac = u16::from_le_bytes([payload[ch * 2], payload[ch * 2 + 1]]);
            let dc = u16::from_le_bytes([payload[dc_base + ch * 2], payload[dc_base + ch * 2 + 1]]);
            ac_uv[ch] = (ac as i32 - AC_OFFSET) as f32 * AC_STEP_UV;
            dc_mv[ch] = (dc as i32 - DC_OFFSET) as f32 * DC_STEP_MV;
        }

        Some(Self { ac_uv, dc_mv })
    }
}

/// Encode AC/DC codes into an RHS2116 payload (simulation and tests)
pub fn encode_rhs2116_payload(ac_codes: &[u16; RHS2116_CHANNELS], dc_codes: &[u16; RHS2116_CHANNELS]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(RHS2116_PAYLOAD_BYTES);
    for code in ac_codes {
        payload.extend_from_slice(&code.to_le_bytes());
    }
    for code in dc_codes {
        payload.extend_from_slice(&code.to_le_bytes());
    }
    payload
}

/// Convert a µV value to the nearest AC code
pub fn ac_code_for_uv(uv: f32) -> u16 {
    let code = (uv / AC_STEP_UV).round() as i32 + AC_OFFSET;
    code.clamp(0, u16::MAX as i32) as u16
}

/// Tagged variant over the device kinds this system drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// FMC host link; powers the headstage port
    Fmc { port_voltage: f32 },
    /// Periodic heartbeat, the playback drift reference
    HeartBeat { frequency_hz: f64 },
    /// Single amplifier/stimulator chip
    Rhs2116 { device_index: u32 },
    /// Logical aggregate of several chips acquired as one sample
    Rhs2116Multi { members: Vec<u32> },
    /// Logical aggregate of the stimulator halves of several chips
    Rhs2116Stim { members: Vec<u32> },
}

impl DeviceKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Fmc { .. } => "Fmc",
            Self::HeartBeat { .. } => "HeartBeat",
            Self::Rhs2116 { .. } => "Rhs2116",
            Self::Rhs2116Multi { .. } => "Rhs2116Multi",
            Self::Rhs2116Stim { .. } => "Rhs2116Stim",
        }
    }

    /// Number of amplifier probes this device contributes to a sample
    pub fn probe_count(&self) -> usize {
        match self {
            Self::Rhs2116 { .. } => RHS2116_CHANNELS,
            Self::Rhs2116Multi { members } | Self::Rhs2116Stim { members } => {
                members.len() * RHS2116_CHANNELS
            }
            Self::Fmc { .. } | Self::HeartBeat { .. } => 0,
        }
    }

    pub fn can_stimulate(&self) -> bool {
        matches!(self, Self::Rhs2116 { .. } | Self::Rhs2116Stim { .. })
    }

    pub fn streams_samples(&self) -> bool {
        matches!(self, Self::Rhs2116 { .. } | Self::Rhs2116Multi { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_midscale_is_zero() {
        let payload = encode_rhs2116_payload(&[32768; 16], &[512; 16]);
        let sample = Rhs2116Sample::decode(&payload).unwrap();
        assert!(sample.ac_uv.iter().all(|v| *v == 0.0));
        assert!(sample.dc_mv.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_decode_scaling() {
        let mut ac = [32768u16; 16];
        ac[3] = 32768 + 100;
        let mut dc = [512u16; 16];
        dc[15] = 513;
        let sample = Rhs2116Sample::decode(&encode_rhs2116_payload(&ac, &dc)).unwrap();
        assert!((sample.ac_uv[3] - 19.5).abs() < 1e-4);
        assert!((sample.dc_mv[15] + 19.23).abs() < 1e-4);
    }

    #[test]
    fn test_short_payload_rejected() {
        assert!(Rhs2116Sample::decode(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_ac_code_roundtrip_close() {
        let code = ac_code_for_uv(-120.0);
        let payload = encode_rhs2116_payload(&[code; 16], &[512; 16]);
        let sample = Rhs2116Sample::decode(&payload).unwrap();
        assert!((sample.ac_uv[0] + 120.0).abs() < AC_STEP_UV);
    }

    #[test]
    fn test_device_kind_capabilities() {
        let multi = DeviceKind::Rhs2116Multi { members: vec![0, 1, 2, 3] };
        assert_eq!(multi.probe_count(), 64);
        assert!(multi.streams_samples());
        assert!(!multi.can_stimulate());
        assert_eq!(DeviceKind::HeartBeat { frequency_hz: 100.0 }.probe_count(), 0);
    }
}
