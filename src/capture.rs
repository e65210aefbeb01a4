//! Microphone capture using CPAL
//!
//! Opens the default input device and feeds raw float chunks from the audio
//! callback into a [`BlockWriter`]. The callback does nothing besides format
//! conversion and the writer push: encoding and transport run outside the
//! real-time deadline budget, on the consumer side of the exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use crate::exchange::BlockWriter;

/// Errors raised while opening or starting the capture device. All of these
/// surface before any recording begins.
#[derive(Debug, Clone)]
pub enum DeviceError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NoInputDevice => write!(f, "No audio input device found"),
            DeviceError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            DeviceError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Handle to an active capture stream.
///
/// Dropping the handle (or calling [`stop`](Self::stop)) tears down the CPAL
/// stream, which also drops the writer inside the callback closure and closes
/// the settled lane — the consumer observes end of input and drains.
pub struct CaptureHandle {
    _stream: Stream,
    is_capturing: Arc<AtomicBool>,
}

impl CaptureHandle {
    pub fn stop(self) {
        self.is_capturing.store(false, Ordering::SeqCst);
        log::info!("Capture stopped");
        // Stream drops here.
    }
}

/// Microphone bound to the default input device.
pub struct Microphone {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl Microphone {
    pub fn new() -> Result<Self, DeviceError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| DeviceError::NoSupportedConfig)?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        Ok(Self {
            device,
            config,
            sample_format,
        })
    }

    /// Device sample rate. Rate conversion is out of scope here: the device
    /// rate must already match what the recognizer expects.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start capturing into the exchange.
    ///
    /// The writer moves into the callback closure and lives as long as the
    /// stream. Of an interleaved multi-channel frame only the first channel is
    /// kept; the recognizer wire format is mono.
    pub fn start(&self, writer: BlockWriter) -> Result<CaptureHandle, DeviceError> {
        let is_capturing = Arc::new(AtomicBool::new(true));

        let stream = self.build_stream(writer, is_capturing.clone())?;

        stream.play().map_err(|e| {
            DeviceError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        log::info!("Capture started ({} Hz)", self.config.sample_rate.0);

        Ok(CaptureHandle {
            _stream: stream,
            is_capturing,
        })
    }

    fn build_stream(
        &self,
        writer: BlockWriter,
        is_capturing: Arc<AtomicBool>,
    ) -> Result<Stream, DeviceError> {
        let err_fn = |err| log::error!("Audio stream error: {}", err);

        match self.sample_format {
            SampleFormat::I16 => self.build_stream_typed::<i16>(writer, is_capturing, err_fn),
            SampleFormat::U16 => self.build_stream_typed::<u16>(writer, is_capturing, err_fn),
            SampleFormat::F32 => self.build_stream_typed::<f32>(writer, is_capturing, err_fn),
            _ => Err(DeviceError::NoSupportedConfig),
        }
    }

    fn build_stream_typed<T>(
        &self,
        mut writer: BlockWriter,
        is_capturing: Arc<AtomicBool>,
        err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    ) -> Result<Stream, DeviceError>
    where
        T: cpal::SizedSample + cpal::Sample<Float = f32> + Send + 'static,
    {
        let channels = self.config.channels.max(1) as usize;
        // Reused between callbacks so the hot path settles into zero
        // allocations after the first few invocations.
        let mut mono: Vec<f32> = Vec::with_capacity(4096);

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !is_capturing.load(Ordering::SeqCst) {
                        return;
                    }
                    if data.is_empty() {
                        // Device yielded nothing for this callback; no-op.
                        return;
                    }

                    mono.clear();
                    mono.extend(data.iter().step_by(channels).map(|s| s.to_float_sample()));
                    writer.push(&mono);
                },
                err_fn,
                None,
            )
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        Ok(stream)
    }
}
