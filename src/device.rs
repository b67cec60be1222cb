//! CPAL device discovery and an output stream driving the engine.
//!
//! ```no_run
//! use routegraph::{CpalDevice, EngineConfig, Project};
//!
//! let device = CpalDevice::default_output().unwrap();
//! let config = device.engine_config(EngineConfig::default());
//! let project = Project::new(config).unwrap();
//! project.recalc_graph(false).unwrap();
//!
//! let stream = device.start(project.engine().clone()).unwrap();
//! # drop(stream);
//! ```

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, SupportedStreamConfig};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::engine::AudioEngine;
use crate::error::{Error, Result};

/// A discovered audio output device.
pub struct CpalDevice {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
    sample_rate: u32,
    channels: u16,
}

impl CpalDevice {
    fn from_device(device: cpal::Device) -> Result<Self> {
        let config = device.default_output_config()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        check_channels(&name, config.channels())?;
        Ok(Self {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            name,
            device,
            config,
        })
    }

    /// The host's default output device.
    pub fn default_output() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(Error::NoDevice)?;
        Self::from_device(device)
    }

    /// Every output device that reports a default config.
    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(|d| Self::from_device(d).ok()).collect())
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// `base` with the device's sample rate.
    pub fn engine_config(&self, base: EngineConfig) -> EngineConfig {
        base.with_sample_rate(self.sample_rate)
    }

    /// Open an output stream whose callback runs `engine` and plays its
    /// exposed outputs. Dropping the stream stops playback.
    pub fn start(&self, engine: Arc<AudioEngine>) -> Result<cpal::Stream> {
        if engine.config().sample_rate != self.sample_rate {
            warn!(
                engine = engine.config().sample_rate,
                device = self.sample_rate,
                "engine and device sample rates differ"
            );
        }
        let stream = match self.config.sample_format() {
            SampleFormat::F32 => self.build_stream::<f32>(engine)?,
            SampleFormat::I16 => self.build_stream::<i16>(engine)?,
            SampleFormat::U16 => self.build_stream::<u16>(engine)?,
            other => {
                error!("unsupported sample format {:?}", other);
                return Err(Error::BuildStream(cpal::BuildStreamError::StreamConfigNotSupported));
            }
        };
        stream.play()?;
        info!(device = %self.name, channels = self.channels, "output stream started");
        Ok(stream)
    }

    fn build_stream<T>(&self, engine: Arc<AudioEngine>) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = self.channels as usize;
        let max_frames = engine.config().buffer_size as usize;
        // allocated once; the callback never grows it
        let mut scratch = vec![0.0f32; max_frames * channels];

        let stream = self.device.build_output_stream(
            &self.config.config(),
            move |data: &mut [T], _| {
                for chunk in data.chunks_mut(max_frames * channels) {
                    let frames = chunk.len() / channels;
                    let out = &mut scratch[..chunk.len()];
                    engine.process(frames as u32);
                    engine.read_output(out, channels);
                    for (dst, src) in chunk.iter_mut().zip(out.iter()) {
                        *dst = T::from_sample(*src);
                    }
                }
            },
            |err| error!("CPAL stream error: {:?}", err),
            None,
        )?;
        Ok(stream)
    }
}

/// The stream callback splits its buffer into whole frames.
fn check_channels(name: &str, channels: u16) -> Result<()> {
    if channels == 0 {
        return Err(Error::InvalidConfig(format!("device {} reports no output channels", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_without_channels_is_rejected() {
        assert!(matches!(check_channels("null", 0), Err(Error::InvalidConfig(_))));
        assert!(check_channels("stereo", 2).is_ok());
    }
}
