//! cpal stream construction
//!
//! Builds the hardware streams around the callback cores in
//! [`crate::engine::callback`]. cpal opens one stream per direction, so a
//! duplex session is an output stream and an input stream coordinating
//! through the shared atomics inside the callback states.
//!
//! Devices may refuse `f32`; each builder dispatches on the negotiated
//! sample format and converts through a pre-allocated `f32` scratch
//! buffer so the callback cores only ever see floats.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{
    BufferSize as CpalBufferSize, FromSample, Sample as _, SampleFormat, SizedSample, Stream,
    StreamConfig,
};

use super::config::{BufferSize, MAX_BUFFER_SIZE};
use super::device::{config_ranges, Direction};
use super::error::{AudioError, AudioResult};
use crate::engine::callback::{InputCallbackState, OutputCallbackState, PLAYTHROUGH_CHANNELS};
use crate::engine::clock::DriverTimeMode;
use crate::engine::ring_buffer::RingBuffer;

/// Keeps a hardware stream alive. Drop to stop the callbacks.
pub struct StreamHandle {
    stream: Stream,
}

impl StreamHandle {
    pub fn play(&self) -> AudioResult<()> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))
    }
}

/// Pick a stream configuration for one direction: prefer `f32`, enough
/// channels, and the requested rate, falling back a constraint at a time.
/// The rate is clamped into the chosen range when nothing supports it
/// exactly (the rate negotiation upstream makes that rare).
pub fn negotiate(
    device: &cpal::Device,
    direction: Direction,
    rate: f64,
    min_channels: u16,
    buffer_size: BufferSize,
) -> AudioResult<(StreamConfig, SampleFormat)> {
    let ranges = config_ranges(device, direction)?;
    let rate_in = |range: &&cpal::SupportedStreamConfigRange| {
        rate >= range.min_sample_rate().0 as f64 && rate <= range.max_sample_rate().0 as f64
    };

    let best = ranges
        .iter()
        .filter(|r| r.sample_format() == SampleFormat::F32)
        .filter(|r| r.channels() >= min_channels)
        .find(rate_in)
        .or_else(|| {
            ranges
                .iter()
                .filter(|r| r.channels() >= min_channels)
                .find(rate_in)
        })
        .or_else(|| ranges.iter().find(|r| r.channels() >= min_channels))
        .or_else(|| ranges.first())
        .ok_or(AudioError::NoUsableConfig {
            direction: direction.noun().to_string(),
            requested: rate,
        })?;

    let min = best.min_sample_rate().0 as f64;
    let max = best.max_sample_rate().0 as f64;
    let chosen_rate = if rate >= min && rate <= max {
        rate
    } else {
        let clamped = rate.clamp(min, max);
        log::warn!(
            "{} device does not support {:.0} Hz, using {:.0} Hz",
            direction.noun(),
            rate,
            clamped
        );
        clamped
    };

    let config = StreamConfig {
        channels: best.channels(),
        sample_rate: cpal::SampleRate(chosen_rate as u32),
        buffer_size: match buffer_size.as_frames() {
            Some(frames) => CpalBufferSize::Fixed(frames.clamp(64, MAX_BUFFER_SIZE as u32)),
            None => CpalBufferSize::Default,
        },
    };
    let sample_format = best.sample_format();
    log::info!(
        "{} stream: {} channels, {:.0} Hz, {:?}",
        direction.noun(),
        config.channels,
        chosen_rate,
        sample_format
    );
    Ok((config, sample_format))
}

/// Driver-reported output delay for this buffer, if the configuration
/// trusts the driver's timestamps
fn output_delay(info: &cpal::OutputCallbackInfo, mode: DriverTimeMode) -> Option<f64> {
    match mode {
        DriverTimeMode::SystemClock => None,
        DriverTimeMode::DeviceClock => {
            let ts = info.timestamp();
            ts.playback
                .duration_since(&ts.callback)
                .map(|d| d.as_secs_f64())
        }
    }
}

/// Build the playback stream around an output callback core
pub fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    state: OutputCallbackState,
    time_mode: DriverTimeMode,
) -> AudioResult<StreamHandle> {
    match sample_format {
        SampleFormat::F32 => typed_output_stream::<f32>(device, config, state, time_mode),
        SampleFormat::I16 => typed_output_stream::<i16>(device, config, state, time_mode),
        SampleFormat::U16 => typed_output_stream::<u16>(device, config, state, time_mode),
        other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }
}

fn typed_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut state: OutputCallbackState,
    time_mode: DriverTimeMode,
) -> AudioResult<StreamHandle>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch = vec![0.0f32; MAX_BUFFER_SIZE * config.channels as usize];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
                let len = data.len().min(scratch.len());
                if len < data.len() {
                    // Device buffer exceeds anything pre-allocated; the
                    // tail stays silent rather than allocating here
                    for sample in data[len..].iter_mut() {
                        *sample = T::from_sample(0.0f32);
                    }
                }
                let delay = output_delay(info, time_mode);
                state.process(&mut scratch[..len], delay);
                for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(value);
                }
            },
            move |err| log::error!("playback stream error: {err}"),
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok(StreamHandle { stream })
}

/// Build the capture stream around an input callback core
pub fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    state: InputCallbackState,
) -> AudioResult<StreamHandle> {
    match sample_format {
        SampleFormat::F32 => typed_input_stream::<f32>(device, config, state),
        SampleFormat::I16 => typed_input_stream::<i16>(device, config, state),
        SampleFormat::U16 => typed_input_stream::<u16>(device, config, state),
        other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }
}

fn typed_input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut state: InputCallbackState,
) -> AudioResult<StreamHandle>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch = vec![0.0f32; MAX_BUFFER_SIZE * config.channels as usize];

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                let len = data.len().min(scratch.len());
                for (dst, &src) in scratch[..len].iter_mut().zip(data.iter()) {
                    *dst = f32::from_sample(src);
                }
                // cpal surfaces no driver overflow flag, so upstream
                // dropouts can only be inferred from ring shortfalls
                state.process(&scratch[..len], false);
            },
            move |err| log::error!("capture stream error: {err}"),
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok(StreamHandle { stream })
}

/// Build a small output stream that plays the software playthrough ring,
/// used while monitoring input without a transport running
pub fn build_monitor_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    playthrough: Arc<RingBuffer>,
) -> AudioResult<StreamHandle> {
    match sample_format {
        SampleFormat::F32 => typed_monitor_stream::<f32>(device, config, playthrough),
        SampleFormat::I16 => typed_monitor_stream::<i16>(device, config, playthrough),
        SampleFormat::U16 => typed_monitor_stream::<u16>(device, config, playthrough),
        other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }
}

fn typed_monitor_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    playthrough: Arc<RingBuffer>,
) -> AudioResult<StreamHandle>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch = vec![0.0f32; MAX_BUFFER_SIZE * PLAYTHROUGH_CHANNELS];

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / channels).min(MAX_BUFFER_SIZE);
                let wanted = frames * PLAYTHROUGH_CHANNELS;
                let got = playthrough.get(&mut scratch[..wanted]);
                scratch[got..wanted].fill(0.0);

                let mut pairs = scratch[..wanted].chunks_exact(PLAYTHROUGH_CHANNELS);
                for frame in data.chunks_mut(channels) {
                    match pairs.next() {
                        Some(pair) => {
                            frame[0] = T::from_sample(pair[0]);
                            if channels > 1 {
                                frame[1] = T::from_sample(pair[1]);
                            }
                            for extra in frame.iter_mut().skip(2) {
                                *extra = T::from_sample(0.0f32);
                            }
                        }
                        None => frame.fill(T::from_sample(0.0f32)),
                    }
                }
            },
            move |err| log::error!("monitor stream error: {err}"),
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok(StreamHandle { stream })
}
