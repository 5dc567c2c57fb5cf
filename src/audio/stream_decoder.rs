//! Decoders for TX audio arriving from relay clients.

use anyhow::Result;

use crate::frame_codec::decode_pcm_i16;

/// Converts one inbound audio frame into interleaved i16 PCM laid out for
/// the playback device.
pub trait StreamDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>>;
}

/// Raw 16-bit little-endian mono PCM, the same wire format clients receive.
pub struct PcmDecoder {
    output_channels: u32,
}

impl PcmDecoder {
    pub fn new(output_channels: u32) -> Self {
        Self { output_channels }
    }
}

impl StreamDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let mono = decode_pcm_i16(data)?;
        Ok(convert_channels(&mono, 1, self.output_channels))
    }
}

/// Pick a decoder for the configured TX stream format.
pub fn create_decoder(format: &str, sample_rate: u32, channels: u32) -> Result<Box<dyn StreamDecoder>> {
    match format {
        "pcm" => Ok(Box::new(PcmDecoder::new(channels))),
        #[cfg(feature = "hardware")]
        "opus" => {
            let decoder = super::opus_codec::OpusDecoder::new(sample_rate, 1, channels)?;
            Ok(Box::new(decoder))
        }
        #[cfg(not(feature = "hardware"))]
        "opus" => {
            let _ = sample_rate;
            anyhow::bail!("opus stream format requires the `hardware` feature")
        }
        other => anyhow::bail!("Unsupported stream format: {}", other),
    }
}

/// Remap interleaved samples between channel counts: downmix averages,
/// upmix repeats source channels in order.
pub fn convert_channels(pcm: &[i16], from: u32, to: u32) -> Vec<i16> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return pcm.to_vec();
    }

    let frames = pcm.len() / from;
    if to == 1 {
        return pcm
            .chunks_exact(from)
            .map(|frame| (frame.iter().map(|&s| i32::from(s)).sum::<i32>() / from as i32) as i16)
            .collect();
    }

    let mut out = vec![0i16; frames * to];
    for i in 0..frames {
        for c in 0..to {
            out[i * to + c] = pcm[i * from + c % from];
        }
    }
    out
}
