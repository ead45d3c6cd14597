//! Audio capture via cpal.
//!
//! Opens the requested (or default) input device, captures at its native
//! sample rate, downmixes/resamples to the configured mono rate, converts
//! to PCM16, and pushes into the ring buffer. The loudness meter is
//! updated from the same callback.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{error, info};

use super::ring_buffer::AudioProducer;
use super::{loudness_level, AudioDeviceInfo};

/// List available input devices with their enumeration indices.
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut out = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for (i, dev) in devices.enumerate() {
            if let Ok(name) = dev.name() {
                out.push(AudioDeviceInfo {
                    id: i as i32,
                    name,
                });
            }
        }
    }
    out
}

/// Whether any input device can be resolved for `device_index`
/// (`-1` means the system default).
pub fn input_device_present(device_index: i32) -> bool {
    let host = cpal::default_host();
    if device_index < 0 {
        host.default_input_device().is_some()
    } else {
        host.input_devices()
            .map(|mut devs| devs.nth(device_index as usize).is_some())
            .unwrap_or(false)
    }
}

/// Resolved info about the audio input we will use.
struct CaptureConfig {
    device: cpal::Device,
    stream_config: StreamConfig,
    native_rate: u32,
}

/// Find and configure the input device. `device_index` of `-1` uses the
/// system default.
fn resolve_device(device_index: i32) -> Result<CaptureConfig, String> {
    let host = cpal::default_host();

    let device = if device_index >= 0 {
        host.input_devices()
            .map_err(|e| format!("Failed to enumerate input devices: {e}"))?
            .nth(device_index as usize)
            .ok_or_else(|| format!("Input device not found: index {device_index}"))?
    } else {
        host.default_input_device()
            .ok_or_else(|| "No default input device available".to_string())?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "Selected input device");

    let default_config = device
        .default_input_config()
        .map_err(|e| format!("Failed to get default input config: {e}"))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    Ok(CaptureConfig {
        device,
        stream_config,
        native_rate,
    })
}

/// Simple linear resampler from `from_rate` to `to_rate` on mono samples.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Build and start the capture stream. Returns the cpal `Stream`, which
/// must be kept alive on the thread that created it.
fn start_capture(
    mut producer: AudioProducer,
    level: Arc<AtomicU8>,
    target_rate: u32,
    device_index: i32,
) -> Result<Stream, String> {
    let cfg = resolve_device(device_index)?;
    let native_rate = cfg.native_rate;
    let channels = cfg.stream_config.channels;
    let needs_resample = native_rate != target_rate;
    let needs_downmix = channels > 1;

    let stream = cfg
        .device
        .build_input_stream(
            &cfg.stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if needs_downmix {
                    to_mono(data, channels)
                } else {
                    data.to_vec()
                };

                let resampled = if needs_resample {
                    resample_linear(&mono, native_rate, target_rate)
                } else {
                    mono
                };

                let pcm = to_pcm16(&resampled);
                level.store(loudness_level(&pcm), Ordering::Release);

                let written = producer.push_slice(&pcm);
                if written < pcm.len() {
                    // Buffer full — the send loop trims the oldest samples
                    // when it next runs.
                }
            },
            move |err| {
                error!("Audio input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("Failed to build input stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("Failed to start input stream: {e}"))?;

    info!(target_rate, "Audio capture started");

    Ok(stream)
}

/// Handle to a running capture thread. Dropping it (or calling
/// [`CaptureHandle::stop`]) releases the device.
pub struct CaptureHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capture and release the device, waiting for the capture
    /// thread to exit.
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a dedicated thread that owns the cpal stream for its lifetime.
///
/// `cpal::Stream` is not `Send`, so it is built, parked, and dropped on
/// one thread; the handle only carries the stop signal. Returns an error
/// if the device cannot be opened.
pub fn spawn_capture_thread(
    producer: AudioProducer,
    level: Arc<AtomicU8>,
    target_rate: u32,
    device_index: i32,
) -> Result<CaptureHandle, String> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

    let thread = std::thread::Builder::new()
        .name("audio-capture".into())
        .spawn(move || {
            let stream = match start_capture(producer, level, target_rate, device_index) {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Park until the handle is stopped or dropped.
            let _ = stop_rx.recv();
            drop(stream);
            info!("Audio capture stopped");
        })
        .map_err(|e| format!("Failed to spawn capture thread: {e}"))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err("Capture thread exited before reporting status".to_string()),
    }
}
