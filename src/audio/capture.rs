use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use cpal::SupportedStreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use opus::{Application, Bitrate, Channels, Encoder};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::audio::{AudioConfig, AudioInput, FRAME_SAMPLES, SAMPLE_RATE, opus_compatible};
use crate::errors::Error;

/// Running capture feeding 20 ms opus frames into the shared local track.
/// While muted the track stays attached and frames are simply dropped, so
/// remote peers observe silence rather than a track change.
pub struct Capture {
    running: Arc<AtomicBool>,
}

impl Capture {
    /// Start capturing. Device selection happens up front so a missing or
    /// unusable input device fails here, not in the background.
    pub fn start(
        config: &AudioConfig,
        track: Arc<TrackLocalStaticSample>,
        muted: Arc<AtomicBool>,
    ) -> Result<Capture> {
        let running = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = broadcast::channel::<Bytes>(32);

        match config.input {
            AudioInput::Device => spawn_device_capture(config.bitrate, frame_tx, running.clone())?,
            AudioInput::Silence => spawn_silence_capture(config.bitrate, frame_tx, running.clone()),
        }
        spawn_track_pump(frame_rx, track, muted, running.clone());
        Ok(Capture { running })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the capture thread and the pump task. They notice the flag on
    /// their next frame.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_track_pump(
    mut frames: broadcast::Receiver<Bytes>,
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if !running.load(Ordering::Relaxed) {
                break;
            }
            if muted.load(Ordering::Relaxed) {
                continue;
            }
            let sample = Sample {
                data: frame,
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                warn!("failed to write capture sample: {err}");
            }
        }
        debug!("capture pump exiting");
    });
}

fn spawn_device_capture(
    bitrate: u32,
    frames: broadcast::Sender<Bytes>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(Error::NoInputDevice)?;
    let supported = select_input_config(&device)?;

    // the cpal stream is not Send, so it lives on its own thread
    std::thread::spawn(move || {
        if let Err(err) = run_device_capture(device, supported, bitrate, frames, running) {
            warn!("audio capture stopped: {err}");
        }
    });
    Ok(())
}

/// Pick an input configuration the opus encoder can work with, preferring
/// the native 48 kHz clock.
fn select_input_config(device: &cpal::Device) -> Result<SupportedStreamConfig> {
    if let Ok(configs) = device.supported_input_configs() {
        for range in configs {
            if range.min_sample_rate().0 <= SAMPLE_RATE && SAMPLE_RATE <= range.max_sample_rate().0
            {
                return Ok(range.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)));
            }
        }
    }
    let fallback = device.default_input_config()?;
    if !opus_compatible(fallback.sample_rate().0) {
        return Err(anyhow!(
            "input device rate {} Hz is not usable for opus",
            fallback.sample_rate().0
        ));
    }
    Ok(fallback)
}

fn run_device_capture(
    device: cpal::Device,
    supported: SupportedStreamConfig,
    bitrate: u32,
    frames: broadcast::Sender<Bytes>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let samples_per_frame = (rate / 50) as usize; // 20 ms, mono after downmix

    let mut encoder = Encoder::new(rate, Channels::Mono, Application::Voip)?;
    encoder.set_bitrate(Bitrate::Bits(bitrate as i32))?;
    let encoder = Arc::new(Mutex::new(encoder));
    let buffer = Arc::new(Mutex::new(VecDeque::<i16>::new()));

    let err_fn = |err| warn!("input stream error: {err}");
    let stream_config = supported.config();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            let buffer = buffer.clone();
            let encoder = encoder.clone();
            let frames = frames.clone();
            let running = running.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = buffer.lock().unwrap();
                    for frame in data.chunks_exact(channels) {
                        let sum: f32 = frame.iter().sum();
                        let mono = (sum / channels as f32 * 32767.0).clamp(-32768.0, 32767.0);
                        buf.push_back(mono as i16);
                    }
                    let mut enc = encoder.lock().unwrap();
                    encode_ready_frames(&mut enc, &mut buf, samples_per_frame, &frames);
                },
                err_fn,
                None,
            )?
        }
        cpal::SampleFormat::I16 => {
            let buffer = buffer.clone();
            let encoder = encoder.clone();
            let frames = frames.clone();
            let running = running.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = buffer.lock().unwrap();
                    for frame in data.chunks_exact(channels) {
                        let sum: i32 = frame.iter().map(|s| *s as i32).sum();
                        buf.push_back((sum / channels as i32) as i16);
                    }
                    let mut enc = encoder.lock().unwrap();
                    encode_ready_frames(&mut enc, &mut buf, samples_per_frame, &frames);
                },
                err_fn,
                None,
            )?
        }
        other => return Err(anyhow!("unsupported input sample format {other}")),
    };

    stream.play()?;
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);
    debug!("capture thread exiting");
    Ok(())
}

/// Synthetic source: encoded silence at the same cadence as a microphone.
fn spawn_silence_capture(bitrate: u32, frames: broadcast::Sender<Bytes>, running: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let mut encoder = match Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip) {
            Ok(encoder) => encoder,
            Err(err) => {
                warn!("failed to create opus encoder: {err}");
                return;
            }
        };
        let _ = encoder.set_bitrate(Bitrate::Bits(bitrate as i32));
        let pcm = vec![0i16; FRAME_SAMPLES];
        let mut out = vec![0u8; 4000];
        while running.load(Ordering::Relaxed) {
            match encoder.encode(&pcm, &mut out) {
                Ok(len) => {
                    let _ = frames.send(Bytes::copy_from_slice(&out[..len]));
                }
                Err(err) => {
                    warn!("opus encode failed: {err}");
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        debug!("silence source exiting");
    });
}

fn encode_ready_frames(
    encoder: &mut Encoder,
    buffer: &mut VecDeque<i16>,
    samples_per_frame: usize,
    frames: &broadcast::Sender<Bytes>,
) {
    while buffer.len() >= samples_per_frame {
        let frame: Vec<i16> = buffer.drain(..samples_per_frame).collect();
        let mut out = vec![0u8; 4000];
        match encoder.encode(&frame, &mut out) {
            Ok(len) => {
                out.truncate(len);
                let _ = frames.send(Bytes::from(out));
            }
            Err(err) => warn!("opus encode failed: {err}"),
        }
    }
}
