//! Opus decoding for TX audio. The stream runs at the device sample rate,
//! so no resampling is needed; only the channel layout is adapted.

use anyhow::Result;

use super::stream_decoder::{StreamDecoder, convert_channels};

/// 120 ms at 48 kHz, the largest frame Opus can produce.
const MAX_FRAME_SAMPLES: usize = 5760;

pub struct OpusDecoder {
    decoder: opus::Decoder,
    input_channels: u32,
    output_channels: u32,
}

impl OpusDecoder {
    /// * `sample_rate`     - Opus stream rate, must be one Opus supports (8/12/16/24/48 kHz)
    /// * `input_channels`  - channels in the Opus stream
    /// * `output_channels` - channels of the playback device
    pub fn new(sample_rate: u32, input_channels: u32, output_channels: u32) -> Result<Self> {
        let channels = if input_channels == 1 {
            opus::Channels::Mono
        } else {
            opus::Channels::Stereo
        };
        let decoder = opus::Decoder::new(sample_rate, channels)?;

        Ok(Self {
            decoder,
            input_channels: input_channels.clamp(1, 2),
            output_channels,
        })
    }
}

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * self.input_channels as usize];
        let per_channel = self.decoder.decode(data, &mut pcm, false)?;
        pcm.truncate(per_channel * self.input_channels as usize);
        Ok(convert_channels(&pcm, self.input_channels, self.output_channels))
    }
}
