//! Capture/playback backends (ambient, peripheral per the Non-goals: no
//! resampling, no format conversion, no encryption).
//!
//! Grounded directly in the teacher's `audio.rs`: `cpal` device enumeration
//! and the per-`SampleFormat` match used to build input/output streams. Two
//! thin adapters replace the teacher's buffer-pool callback: a
//! callback-driven producer ([`CaptureProducer`]) and a pull-driven consumer
//! ([`PlaybackConsumer`]), matching spec §4.6's split between "opaque
//! callback-driven producer" and "pull-driven consumer".

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::AdaptiveBuffer;
use crate::error::AudiocastError;
use crate::format_change::PlaybackController;
use crate::wire::{AudioFormat, Encoding};

/// Enumerates available input and output devices.
pub fn list_devices() -> Result<(Vec<Device>, Vec<Device>)> {
    let host = cpal::default_host();
    let inputs: Vec<_> = host.input_devices().context("enumerating input devices")?.collect();
    let outputs: Vec<_> = host.output_devices().context("enumerating output devices")?.collect();
    Ok((inputs, outputs))
}

/// Best-effort device name (fallback to "<unknown>").
pub fn device_name(dev: &Device) -> String {
    dev.name().unwrap_or_else(|_| "<unknown>".into())
}

/// The `cpal::SampleFormat` a negotiated [`Encoding`] must be built on, or
/// `None` for encodings no device stream in this crate can produce
/// (`PcmS32Le`, `PcmS24Le`, `Invalid`).
fn sample_format_for_encoding(enc: Encoding) -> Option<SampleFormat> {
    match enc {
        Encoding::PcmF32Le => Some(SampleFormat::F32),
        Encoding::PcmS16Le => Some(SampleFormat::I16),
        Encoding::PcmU8 => Some(SampleFormat::U16), // device-native u16 has no wire counterpart; treated as opaque bytes
        Encoding::PcmS32Le | Encoding::PcmS24Le | Encoding::Invalid => None,
    }
}

/// Copies the raw little-endian byte representation of `data` out as-is, no
/// format conversion performed (wire format equals the negotiated format
/// verbatim).
fn bytes_of<T: Copy>(data: &[T]) -> Vec<u8> {
    let byte_len = std::mem::size_of_val(data);
    let ptr = data.as_ptr() as *const u8;
    unsafe { std::slice::from_raw_parts(ptr, byte_len) }.to_vec()
}

/// Wraps a `cpal` input stream whose callback forwards raw PCM byte spans
/// over a bounded `crossbeam_channel`, bridging the synchronous audio
/// callback thread into the async world the packetizer runs in.
pub struct CaptureProducer {
    _stream: cpal::Stream,
    pub format: AudioFormat,
}

impl CaptureProducer {
    /// Starts capture on `dev` at exactly `requested`, the format the server
    /// has already told (or will tell) its clients is on the wire.
    ///
    /// Fails with [`AudiocastError::FormatInvalid`] rather than silently
    /// substituting the device's default configuration — the wire format
    /// must equal the negotiated format verbatim, so a device that cannot
    /// produce `requested` aborts startup instead of streaming bytes that
    /// don't match what `GetAudioFormat` and the packetizer believe is on
    /// the wire.
    pub fn start(dev: &Device, running: Arc<AtomicBool>, requested: AudioFormat) -> Result<(Self, Receiver<Vec<u8>>)> {
        let sample_format = sample_format_for_encoding(requested.encoding).ok_or_else(|| {
            let err = AudiocastError::FormatInvalid(requested);
            tracing::error!(%err, "requested encoding has no device sample format");
            err
        })?;

        let supported = dev
            .supported_input_configs()
            .context("enumerating input configs")?
            .find(|range| {
                range.channels() == requested.channels as u16
                    && range.sample_format() == sample_format
                    && range.min_sample_rate().0 <= requested.sample_rate
                    && range.max_sample_rate().0 >= requested.sample_rate
            })
            .ok_or_else(|| {
                let err = AudiocastError::FormatInvalid(requested);
                tracing::error!(%err, "no input device config matches the requested audio format");
                err
            })?
            .with_sample_rate(cpal::SampleRate(requested.sample_rate));

        let config: StreamConfig = supported.into();
        let format = requested;
        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(64);

        let err_fn = |err| tracing::warn!(%err, "input stream error");

        let stream = match sample_format {
            SampleFormat::F32 => build_input::<f32>(dev, &config, tx, running, err_fn)?,
            SampleFormat::I16 => build_input::<i16>(dev, &config, tx, running, err_fn)?,
            SampleFormat::U16 => build_input::<u16>(dev, &config, tx, running, err_fn)?,
            _ => return Err(AudiocastError::FormatInvalid(requested).into()),
        };
        stream.play().context("starting input stream")?;

        tracing::info!(rate = format.sample_rate, channels = format.channels, encoding = %format.encoding, "capture stream running");
        Ok((Self { _stream: stream, format }, rx))
    }
}

fn build_input<T>(
    dev: &Device,
    config: &StreamConfig,
    tx: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Copy,
{
    dev.build_input_stream(
        config,
        move |data: &[T], _| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            if tx.try_send(bytes_of(data)).is_err() {
                tracing::trace!("capture channel full, dropping chunk");
            }
        },
        err_fn,
        None,
    )
    .context("building input stream")
}

/// Wraps a `cpal` output stream whose callback pulls `need_samples` worth of
/// bytes from the adaptive buffer on every invocation — a pull-driven
/// consumer, the mirror image of [`CaptureProducer`]'s push model.
pub struct PlaybackConsumer {
    stream: Option<cpal::Stream>,
    device: Device,
    buffer: Arc<Mutex<AdaptiveBuffer>>,
    running: Arc<AtomicBool>,
    format: AudioFormat,
}

impl PlaybackConsumer {
    pub fn new(device: Device, buffer: Arc<Mutex<AdaptiveBuffer>>, running: Arc<AtomicBool>, format: AudioFormat) -> Self {
        Self { stream: None, device, buffer, running, format }
    }
}

impl PlaybackController for PlaybackConsumer {
    type Error = anyhow::Error;

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    fn stop(&mut self) -> Result<()> {
        self.stream = None; // dropping the cpal::Stream pauses it
        Ok(())
    }

    fn rebuild(&mut self, format: AudioFormat) -> Result<()> {
        self.format = format;
        Ok(())
    }

    /// Builds an output stream at exactly `self.format` — the format the
    /// server's `GetAudioFormat`/format-change notification says is on the
    /// wire, not whatever the device's default output configuration
    /// happens to be. Fails with [`AudiocastError::FormatInvalid`] if no
    /// supported device config can produce it, rather than silently
    /// interpreting incoming buffer bytes under the wrong sample type.
    fn start(&mut self) -> Result<()> {
        let format = self.format;
        let sample_format = sample_format_for_encoding(format.encoding).ok_or_else(|| {
            let err = AudiocastError::FormatInvalid(format);
            tracing::error!(%err, "negotiated encoding has no device sample format");
            err
        })?;

        let supported = self
            .device
            .supported_output_configs()
            .context("enumerating output configs")?
            .find(|range| {
                range.channels() == format.channels as u16
                    && range.sample_format() == sample_format
                    && range.min_sample_rate().0 <= format.sample_rate
                    && range.max_sample_rate().0 >= format.sample_rate
            })
            .ok_or_else(|| {
                let err = AudiocastError::FormatInvalid(format);
                tracing::error!(%err, "no output device config matches the negotiated audio format");
                err
            })?
            .with_sample_rate(cpal::SampleRate(format.sample_rate));

        let config: StreamConfig = supported.into();
        let buffer = self.buffer.clone();
        let running = self.running.clone();
        let err_fn = |err| tracing::warn!(%err, "output stream error");

        let stream = match sample_format {
            SampleFormat::F32 => build_output::<f32>(&self.device, &config, buffer, running, format, err_fn)?,
            SampleFormat::I16 => build_output::<i16>(&self.device, &config, buffer, running, format, err_fn)?,
            SampleFormat::U16 => build_output::<u16>(&self.device, &config, buffer, running, format, err_fn)?,
            _ => return Err(AudiocastError::FormatInvalid(format).into()),
        };
        stream.play().context("starting output stream")?;
        self.stream = Some(stream);
        Ok(())
    }
}

fn build_output<T>(
    dev: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<AdaptiveBuffer>>,
    running: Arc<AtomicBool>,
    format: AudioFormat,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
{
    let sample_size = format.sample_size_bytes().max(1);
    dev.build_output_stream(
        config,
        move |out: &mut [T], _| {
            if !running.load(Ordering::Relaxed) {
                for s in out.iter_mut() {
                    *s = T::EQUILIBRIUM;
                }
                return;
            }
            let mut raw = vec![0u8; out.len() * sample_size];
            buffer.lock().pull(&mut raw, out.len(), format);
            let byte_len = out.len() * std::mem::size_of::<T>().min(sample_size);
            let copy_len = byte_len.min(raw.len());
            unsafe {
                std::ptr::copy_nonoverlapping(raw.as_ptr(), out.as_mut_ptr() as *mut u8, copy_len);
            }
        },
        err_fn,
        None,
    )
    .context("building output stream")
}
