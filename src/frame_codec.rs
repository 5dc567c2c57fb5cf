//! Pure encode/decode of the meter device's binary frames and of the relay's
//! PCM audio sample format.
//!
//! Meter frame layout (little-endian `u16` fields):
//!
//! ```text
//! [flag, cmd, len, reserved, swr_lo, swr_hi, pwr_lo, pwr_hi, maxpwr_lo, maxpwr_hi]
//! ```

use thiserror::Error;

/// Leading flag byte of every device command.
pub const SCMD_FLAG: u8 = 0xFF;
/// Asks the device to emit a fresh meter frame.
pub const SCMD_SYNC: u8 = 0x01;
/// Command byte of a meter status frame.
pub const SCMD_METER_STATUS: u8 = 0x02;

/// flag + cmd + len + reserved
pub const FRAME_HEADER_LEN: usize = 4;
/// Smallest frame that can carry a meter reading.
pub const METER_FRAME_LEN: usize = 10;
const METER_PAYLOAD_LEN: usize = METER_FRAME_LEN - FRAME_HEADER_LEN;

/// Full scale of the 16-bit sample quantizer.
const PCM_SCALE: f32 = 32767.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes (minimum {FRAME_HEADER_LEN})")]
    TooShort(usize),

    #[error("declared payload length {declared} exceeds received {available} bytes")]
    LengthOverrun { declared: usize, available: usize },

    #[error("PCM payload length {0} is not a multiple of 2")]
    OddLength(usize),
}

/// One parsed device frame. Borrows the payload from the received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryFrame<'a> {
    pub flag: u8,
    pub command: u8,
    pub declared_len: u8,
    pub payload: &'a [u8],
}

impl<'a> TelemetryFrame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CodecError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(CodecError::TooShort(bytes.len()));
        }

        let declared = bytes[2] as usize;
        let available = bytes.len() - FRAME_HEADER_LEN;
        if declared > available {
            return Err(CodecError::LengthOverrun { declared, available });
        }

        Ok(Self {
            flag: bytes[0],
            command: bytes[1],
            declared_len: bytes[2],
            payload: &bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared],
        })
    }
}

/// Meter values carried by one status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterReading {
    pub forward_power: u16,
    pub swr_raw: u16,
    pub max_power: u16,
}

impl MeterReading {
    /// Display SWR. The device sends hundredths once the ratio reaches 1.00
    /// and a bare value below that; both cases are passed through as-is.
    pub fn swr(&self) -> f64 {
        if self.swr_raw >= 100 {
            self.swr_raw as f64 / 100.0
        } else {
            self.swr_raw as f64
        }
    }

    /// Forward power as a percentage of max power, clamped to 100.
    pub fn efficiency(&self) -> f64 {
        if self.max_power == 0 {
            return 0.0;
        }
        (self.forward_power as f64 / self.max_power as f64 * 100.0).min(100.0)
    }
}

fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Decode a meter status frame. Anything else (short, garbled, other
/// commands) yields `None`; callers drop those frames without further action.
pub fn decode_telemetry(bytes: &[u8]) -> Option<MeterReading> {
    if bytes.len() < METER_FRAME_LEN {
        return None;
    }

    let frame = TelemetryFrame::parse(bytes).ok()?;
    if frame.command != SCMD_METER_STATUS || frame.payload.len() < METER_PAYLOAD_LEN {
        return None;
    }

    Some(MeterReading {
        swr_raw: read_u16_le(frame.payload, 0),
        forward_power: read_u16_le(frame.payload, 2),
        max_power: read_u16_le(frame.payload, 4),
    })
}

pub fn encode_sync_command() -> [u8; 3] {
    [SCMD_FLAG, SCMD_SYNC, 0x00]
}

/// Quantize float samples in [-1.0, 1.0] to 16-bit little-endian PCM.
/// Out-of-range input saturates.
pub fn encode_audio_sample(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let q = (s.clamp(-1.0, 1.0) * PCM_SCALE).round() as i16;
        out.extend_from_slice(&q.to_le_bytes());
    }
    out
}

/// Inverse scale of [`encode_audio_sample`].
pub fn decode_audio_sample(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    Ok(decode_pcm_i16(bytes)?
        .into_iter()
        .map(|q| q as f32 / PCM_SCALE)
        .collect())
}

pub fn decode_pcm_i16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}
