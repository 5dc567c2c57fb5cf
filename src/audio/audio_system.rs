//! Capture and playback threads of the device's audio sub-link.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks. Capture runs for as long as the
//! system is up, whether or not any audio client is attached, so late
//! joiners pick up a continuous stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use super::stream_decoder::convert_channels;
use crate::frame_codec::encode_audio_sample;
use crate::registry::{Broadcaster, RelayEvent};

/// Decoded TX blocks waiting for the playback device.
pub const PLAYBACK_QUEUE_DEPTH: usize = 32;
const PLAYBACK_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub enabled: bool,
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    pub playback_device: String,
    pub sample_rate: u32,
    /// Device channel count; clients always get mono.
    pub channels: u32,
    /// Frames per captured block, one broadcast message each.
    pub block_size: usize,
    /// Encoding of TX audio sent by clients: "pcm" or "opus"
    pub tx_format: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            sample_rate: 24000,
            channels: 1,
            block_size: 1024,
            tx_format: "pcm".to_string(),
        }
    }
}

pub trait AudioSource {
    /// Blocking read of interleaved float samples; returns frames read.
    fn read_block(&mut self, buf: &mut [f32]) -> Result<usize>;
    fn recover(&mut self) -> Result<()>;
    fn channels(&self) -> u32;
}

pub trait AudioSink {
    /// Write interleaved samples; returns frames accepted.
    fn write(&mut self, pcm: &[i16]) -> Result<usize>;
    fn recover(&mut self) -> Result<()>;
    fn channels(&self) -> u32;
}

pub type SourceFactory = Box<dyn FnOnce(&AudioConfig) -> Result<Box<dyn AudioSource>> + Send>;
pub type SinkFactory = Box<dyn FnOnce(&AudioConfig) -> Result<Box<dyn AudioSink>> + Send>;

/// Device openers, called on the audio threads themselves.
pub struct AudioBackend {
    pub capture: SourceFactory,
    pub playback: SinkFactory,
}

/// The audio system manages capture and playback in dedicated OS threads.
///
/// - Capture thread: device → mono → 16-bit PCM → broadcast to audio sessions
/// - Playback thread: `playback_tx` → device
pub struct AudioSystem {
    running: Arc<AtomicBool>,
    playback_tx: mpsc::Sender<Vec<i16>>,
    record_handle: Option<JoinHandle<()>>,
    play_handle: Option<JoinHandle<()>>,
}

impl AudioSystem {
    /// Open both devices and start streaming. Fails if either device cannot
    /// be opened; the relay then runs without audio.
    pub fn start(config: AudioConfig, backend: AudioBackend, broadcaster: Arc<dyn Broadcaster>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (playback_tx, playback_rx) = mpsc::channel(PLAYBACK_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let AudioBackend { capture, playback } = backend;

        log::info!(
            "AudioSystem starting: capture \"{}\", playback \"{}\", rate: {}Hz, ch: {}, block: {}",
            config.capture_device,
            config.playback_device,
            config.sample_rate,
            config.channels,
            config.block_size,
        );

        let record_handle = {
            let running = running.clone();
            let config = config.clone();
            let ready = ready_tx.clone();
            thread::Builder::new().name("audio-capture".into()).spawn(move || {
                let source = match capture(&config).context("capture device unavailable") {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                let _ = ready.send(Ok(()));
                record_thread(&config, source, &*broadcaster, &running);
            })?
        };

        let play_handle = {
            let running = running.clone();
            let config = config.clone();
            thread::Builder::new().name("audio-play".into()).spawn(move || {
                let sink = match playback(&config).context("playback device unavailable") {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                play_thread(&config, sink, playback_rx, &running);
            })?
        };

        let mut system = Self {
            running,
            playback_tx,
            record_handle: Some(record_handle),
            play_handle: Some(play_handle),
        };

        for _ in 0..2 {
            let opened = ready_rx
                .recv()
                .unwrap_or_else(|_| Err(anyhow::anyhow!("audio thread exited during startup")));
            if let Err(e) = opened {
                system.stop();
                return Err(e);
            }
        }
        Ok(system)
    }

    /// Queue for decoded TX audio, consumed by the playback thread.
    pub fn playback_sender(&self) -> mpsc::Sender<Vec<i16>> {
        self.playback_tx.clone()
    }

    /// Signal threads to stop and wait for capture to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.record_handle.take() {
            let _ = h.join();
        }
        // Playback thread exits once every playback sender is dropped.
        self.play_handle.take();
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Average interleaved frames down to one channel.
fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn record_thread(config: &AudioConfig, mut source: Box<dyn AudioSource>, broadcaster: &dyn Broadcaster, running: &AtomicBool) {
    let channels = source.channels().max(1) as usize;
    let mut block = vec![0f32; config.block_size.max(1) * channels];

    log::info!("Capture started: block={} frames, ch={}", config.block_size, channels);

    while running.load(Ordering::Relaxed) {
        match source.read_block(&mut block) {
            Ok(0) => {}
            Ok(frames) => {
                let frames = frames.min(block.len() / channels);
                let mono = mix_to_mono(&block[..frames * channels], channels);
                broadcaster.broadcast(RelayEvent::Audio(Bytes::from(encode_audio_sample(&mono))));
            }
            Err(e) => {
                log::warn!("Capture error: {}, recovering...", e);
                if let Err(e2) = source.recover() {
                    log::error!("Failed to recover capture device: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Capture stopped");
}

fn play_thread(
    config: &AudioConfig,
    mut sink: Box<dyn AudioSink>,
    mut playback_rx: mpsc::Receiver<Vec<i16>>,
    running: &AtomicBool,
) {
    let channels = sink.channels().max(1);
    log::info!("Playback started: rate={}, ch={}", config.sample_rate, channels);

    while running.load(Ordering::Relaxed) {
        let Some(pcm) = playback_rx.blocking_recv() else {
            log::info!("Playback channel closed");
            break;
        };
        if pcm.is_empty() {
            continue;
        }
        // Decoders target the configured layout; the device may have negotiated another.
        let pcm = if channels == config.channels {
            pcm
        } else {
            convert_channels(&pcm, config.channels, channels)
        };
        write_block(sink.as_mut(), &pcm, channels as usize);
    }

    log::info!("Playback stopped");
}

/// Write a whole block, recovering from short writes and underruns. Gives
/// up on the block after a fixed number of failed attempts.
fn write_block(sink: &mut dyn AudioSink, pcm: &[i16], channels: usize) -> bool {
    let total_frames = pcm.len() / channels;
    let mut frames_written = 0;
    let mut failures = 0;

    while frames_written < total_frames {
        let offset = frames_written * channels;
        let error = match sink.write(&pcm[offset..total_frames * channels]) {
            Ok(0) => anyhow::anyhow!("device accepted no frames"),
            Ok(n) => {
                frames_written += n;
                continue;
            }
            Err(e) => e,
        };

        failures += 1;
        if failures >= PLAYBACK_WRITE_ATTEMPTS {
            log::error!(
                "Dropping {} playback frames after {} failed writes: {}",
                total_frames - frames_written,
                failures,
                error
            );
            return false;
        }
        log::warn!("Playback error: {}, recovering...", error);
        if let Err(e2) = sink.recover() {
            log::error!("Failed to recover playback device: {}", e2);
            return false;
        }
    }
    true
}
