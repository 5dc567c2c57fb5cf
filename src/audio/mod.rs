//! audio - the device's audio sub-link
//!
//! Continuous capture fanned out to audio sessions, and decoded client TX
//! audio played back on the device. ALSA and Opus are only compiled in with
//! the `hardware` feature.

#[cfg(feature = "hardware")]
mod alsa_device;
mod audio_system;
#[cfg(feature = "hardware")]
mod opus_codec;
pub mod stream_decoder;

#[cfg(feature = "hardware")]
pub use alsa_device::hardware_backend;
pub use audio_system::{AudioConfig, AudioSystem};
pub use stream_decoder::{StreamDecoder, create_decoder};
