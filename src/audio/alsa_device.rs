//! ALSA-backed capture and playback devices.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::audio_system::{AudioBackend, AudioConfig, AudioSink, AudioSource};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    format: Format,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(format)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    if params.sample_rate != sample_rate {
        log::warn!(
            "ALSA {}: requested {}Hz but device runs at {}Hz",
            dir_name,
            sample_rate,
            params.sample_rate
        );
    }
    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

pub struct AlsaCapture {
    pcm: PCM,
    params: AlsaParams,
}

impl AlsaCapture {
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let (pcm, params) = open_pcm(
            &config.capture_device,
            Direction::Capture,
            Format::FloatLE,
            config.sample_rate,
            config.channels,
            config.block_size,
        )?;
        Ok(Self { pcm, params })
    }
}

impl AudioSource for AlsaCapture {
    fn read_block(&mut self, buf: &mut [f32]) -> Result<usize> {
        Ok(self.pcm.io_f32()?.readi(buf)?)
    }

    fn recover(&mut self) -> Result<()> {
        Ok(self.pcm.prepare()?)
    }

    fn channels(&self) -> u32 {
        self.params.channels
    }
}

pub struct AlsaPlayback {
    pcm: PCM,
    params: AlsaParams,
}

impl AlsaPlayback {
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let (pcm, params) = open_pcm(
            &config.playback_device,
            Direction::Playback,
            Format::S16LE,
            config.sample_rate,
            config.channels,
            config.block_size,
        )?;
        Ok(Self { pcm, params })
    }
}

impl AudioSink for AlsaPlayback {
    fn write(&mut self, pcm: &[i16]) -> Result<usize> {
        Ok(self.pcm.io_i16()?.writei(pcm)?)
    }

    fn recover(&mut self) -> Result<()> {
        Ok(self.pcm.prepare()?)
    }

    fn channels(&self) -> u32 {
        self.params.channels
    }
}

fn open_capture(config: &AudioConfig) -> Result<Box<dyn AudioSource>> {
    Ok(Box::new(AlsaCapture::open(config)?))
}

fn open_playback(config: &AudioConfig) -> Result<Box<dyn AudioSink>> {
    Ok(Box::new(AlsaPlayback::open(config)?))
}

/// Capture and playback on the configured ALSA devices.
pub fn hardware_backend() -> AudioBackend {
    AudioBackend {
        capture: Box::new(open_capture),
        playback: Box::new(open_playback),
    }
}
